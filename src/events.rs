//! Notifications emitted to the hosting process.
//!
//! Every state change that matters to the client is pushed through one
//! unbounded channel and written out by the dispatcher as a JSON-RPC
//! notification. Payload field names are part of the wire contract.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::classify::Classification;
use crate::device::{DeviceDescriptor, OutputDevice};
use crate::sanitizer::SanitizedPlayback;

/// Sending half of the notification channel.
pub type EventSink = UnboundedSender<Notification>;

/// Client-visible connection lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum LinkState {
    Connected,
    Reconnecting,
    Failed,
    Disconnected,
}

/// Device summary included in lifecycle notifications.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identifier: String,
    pub name: String,
    pub address: String,
}

impl From<&DeviceDescriptor> for DeviceInfo {
    fn from(descriptor: &DeviceDescriptor) -> Self {
        Self {
            identifier: descriptor.identifier.clone(),
            name: descriptor.name.clone(),
            address: descriptor.address.to_string(),
        }
    }
}

/// Payload of a `connection-state` notification.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionEvent {
    pub state: LinkState,
    pub device: Option<DeviceInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Seconds until the next retry, for countdown display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_repairing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wake_recovery: Option<bool>,
}

impl ConnectionEvent {
    #[must_use]
    pub fn connected(device: DeviceInfo) -> Self {
        Self::bare(LinkState::Connected, Some(device))
    }

    #[must_use]
    pub fn disconnected(device: Option<DeviceInfo>) -> Self {
        Self::bare(LinkState::Disconnected, device)
    }

    #[must_use]
    pub fn reconnecting(
        device: Option<DeviceInfo>,
        attempt: u32,
        max_attempts: u32,
        next_retry_in: u64,
        error: Option<String>,
    ) -> Self {
        Self {
            attempt: Some(attempt),
            max_attempts: Some(max_attempts),
            next_retry_in: Some(next_retry_in),
            error,
            ..Self::bare(LinkState::Reconnecting, device)
        }
    }

    /// Connection dropped; reconnection is about to start. Per-attempt
    /// countdown fields follow in later events from the reconnection loop.
    #[must_use]
    pub fn lost(device: Option<DeviceInfo>, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::bare(LinkState::Reconnecting, device)
        }
    }

    #[must_use]
    pub fn failed(device: Option<DeviceInfo>, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::bare(LinkState::Failed, device)
        }
    }

    /// Marks this event as triggered by wake recovery.
    #[must_use]
    pub fn wake(mut self) -> Self {
        self.wake_recovery = Some(true);
        self
    }

    fn bare(state: LinkState, device: Option<DeviceInfo>) -> Self {
        Self {
            state,
            device,
            attempt: None,
            max_attempts: None,
            next_retry_in: None,
            error: None,
            requires_repairing: None,
            wake_recovery: None,
        }
    }
}

/// Payload of a `command-error` notification.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CommandErrorEvent {
    pub command: String,
    #[serde(flatten)]
    pub classification: Classification,
}

/// One notification to the hosting process.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Notification {
    ConnectionState(ConnectionEvent),
    PlaybackUpdate(SanitizedPlayback),
    PlaybackError { error: String },
    VolumeUpdate { old_level: f32, new_level: f32 },
    OutputDevicesUpdate { devices: Vec<OutputDevice> },
    KeyboardFocus { focused: bool },
    CommandError(CommandErrorEvent),
}

impl Notification {
    /// Wire name of the notification.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionState(_) => "connection-state",
            Self::PlaybackUpdate(_) => "playback-update",
            Self::PlaybackError { .. } => "playback-error",
            Self::VolumeUpdate { .. } => "volume-update",
            Self::OutputDevicesUpdate { .. } => "output-devices-update",
            Self::KeyboardFocus { .. } => "keyboard-focus",
            Self::CommandError(_) => "command-error",
        }
    }

    /// Serialized payload of the notification.
    #[must_use]
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnecting_payload_carries_countdown_fields() {
        let event = ConnectionEvent::reconnecting(None, 2, 10, 4, Some("scan failed".into()));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["state"], "Reconnecting");
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["max_attempts"], 10);
        assert_eq!(value["next_retry_in"], 4);
        assert_eq!(value["error"], "scan failed");
        assert!(value.get("wake_recovery").is_none());
    }

    #[test]
    fn wake_flag_is_present_only_when_set() {
        let event = ConnectionEvent::reconnecting(None, 1, 3, 0, None).wake();
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["wake_recovery"], true);
    }

    #[test]
    fn notification_names_match_the_wire_vocabulary() {
        let notification = Notification::KeyboardFocus { focused: true };
        assert_eq!(notification.name(), "keyboard-focus");
        assert_eq!(notification.payload()["focused"], true);
    }
}
