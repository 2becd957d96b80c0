//! The seam between the session core and the device-control library.
//!
//! Everything the session needs from a streaming device is expressed here as
//! traits: scanning, connecting, pairing, remote commands, and the push-event
//! subscription. The concrete wire protocols live behind these traits and are
//! injected at startup.
//!
//! # Failure kinds
//!
//! [`DeviceError`] is the closed set of failure kinds the classifier in
//! [`crate::classify`] understands. Implementations must map their internal
//! errors onto these kinds; anything that genuinely fits none of them goes
//! into [`DeviceError::Other`] and classifies as `unknown`.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Failure kinds reported by device-control implementations.
///
/// The variants are grouped by how the session recovers from them; the
/// grouping itself lives in [`crate::classify`], not here.
#[derive(Clone, Debug, Error)]
pub enum DeviceError {
    /// The device could not be reached at all.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection dropped mid-session.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The device sent something the protocol layer could not handle.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation did not complete within the transport's deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The device rejected our authentication outright.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Stored credentials exist but the device no longer accepts them.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// No credentials are stored for the protocol the device requires.
    #[error("no credentials: {0}")]
    NoCredentials(String),

    /// The device does not implement the requested operation.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Scanning found the device but no protocol we can speak.
    #[error("no usable service: {0}")]
    NoService(String),

    /// The pairing handshake failed.
    #[error("pairing failed: {0}")]
    Pairing(String),

    /// The device imposed a back-off after too many pairing attempts.
    #[error("device requested back-off: {0}")]
    BackOff(String),

    /// No live connection for an operation that needs one.
    #[error("not connected to a device")]
    NotConnected,

    /// Credential storage failed to load or persist.
    #[error("settings error: {0}")]
    Settings(String),

    /// Anything the layers above have no better kind for.
    #[error("{0}")]
    Other(String),
}

impl DeviceError {
    /// Stable name of the failure kind, used in classified error payloads.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "ConnectionFailed",
            Self::ConnectionLost(_) => "ConnectionLost",
            Self::Protocol(_) => "Protocol",
            Self::Timeout(_) => "Timeout",
            Self::Authentication(_) => "Authentication",
            Self::InvalidCredentials(_) => "InvalidCredentials",
            Self::NoCredentials(_) => "NoCredentials",
            Self::NotSupported(_) => "NotSupported",
            Self::NoService(_) => "NoService",
            Self::Pairing(_) => "Pairing",
            Self::BackOff(_) => "BackOff",
            Self::NotConnected => "NotConnected",
            Self::Settings(_) => "Settings",
            Self::Other(_) => "Other",
        }
    }
}

/// Service protocols a device may advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceProtocol {
    Companion,
    AirPlay,
    Mrp,
}

impl ServiceProtocol {
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "companion" => Some(Self::Companion),
            "airplay" => Some(Self::AirPlay),
            "mrp" => Some(Self::Mrp),
            _ => None,
        }
    }
}

/// A device found by a scan.
///
/// The identifier is stable across scans and is the reconnection key; the
/// address is not — it may change whenever the device rejoins the network,
/// which is why reconnection always re-scans instead of reusing a cached
/// descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub identifier: String,
    pub name: String,
    pub address: IpAddr,
    pub services: Vec<ServiceProtocol>,
}

/// Coarse playback state as reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PlayState {
    Idle,
    Loading,
    Playing,
    Paused,
    Stopped,
    Seeking,
    Unknown,
}

/// Coarse media type as reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum MediaKind {
    Music,
    Video,
    Tv,
    Unknown,
}

/// Raw now-playing snapshot as pushed by the device, before sanitization.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlayingSnapshot {
    pub state: PlayState,
    pub media_kind: MediaKind,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    /// Playback position in seconds.
    pub position: Option<u64>,
    /// Total duration in seconds. Zero or absent while metadata is loading.
    pub total_time: Option<u64>,
    /// Device-provided content identity, used for deduplication.
    pub content_hash: Option<String>,
}

/// Foreground application identity, best-effort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppInfo {
    pub name: Option<String>,
    pub identifier: Option<String>,
}

/// An audio output endpoint reported by the device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutputDevice {
    pub name: String,
    pub identifier: String,
}

/// Unsolicited state notifications pushed by a live connection.
#[derive(Clone, Debug)]
pub enum PushEvent {
    Playback(PlayingSnapshot),
    PlaybackError(DeviceError),
    VolumeChanged { old_level: f32, new_level: f32 },
    OutputDevicesChanged(Vec<OutputDevice>),
    KeyboardFocus(bool),
    /// The connection dropped unexpectedly. Triggers reconnection.
    ConnectionLost(DeviceError),
    /// The connection was closed on purpose. No reconnection.
    ConnectionClosed,
}

/// Physical button and transport commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RemoteCommand {
    Up,
    Down,
    Left,
    Right,
    Select,
    Menu,
    Home,
    HomeHold,
    TopMenu,
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
    SkipForward,
    SkipBackward,
    VolumeUp,
    VolumeDown,
}

impl RemoteCommand {
    /// Maps a wire command name to a command, or `None` for unknown names.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "select" => Some(Self::Select),
            "menu" => Some(Self::Menu),
            "home" => Some(Self::Home),
            "home_hold" => Some(Self::HomeHold),
            "top_menu" => Some(Self::TopMenu),
            "play" => Some(Self::Play),
            "pause" => Some(Self::Pause),
            "play_pause" => Some(Self::PlayPause),
            "stop" => Some(Self::Stop),
            "next" => Some(Self::Next),
            "previous" => Some(Self::Previous),
            "skip_forward" => Some(Self::SkipForward),
            "skip_backward" => Some(Self::SkipBackward),
            "volume_up" => Some(Self::VolumeUp),
            "volume_down" => Some(Self::VolumeDown),
            _ => None,
        }
    }
}

/// How a button press is performed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InputAction {
    #[default]
    SingleTap,
    DoubleTap,
    Hold,
}

impl InputAction {
    /// Unknown action names fall back to a single tap.
    #[must_use]
    pub fn parse(name: &str) -> Self {
        match name {
            "double_tap" => Self::DoubleTap,
            "hold" => Self::Hold,
            _ => Self::SingleTap,
        }
    }
}

/// Entry point into the device-control library.
#[async_trait]
pub trait DeviceBackend: Send + Sync {
    /// Scans the local network for devices.
    async fn scan(&self, timeout: Duration) -> DeviceResult<Vec<DeviceDescriptor>>;

    /// Connects to a previously scanned device.
    async fn connect(&self, descriptor: &DeviceDescriptor) -> DeviceResult<Box<dyn DeviceHandle>>;

    /// Begins pairing with a device over one of its advertised protocols.
    async fn pair(
        &self,
        descriptor: &DeviceDescriptor,
        protocol: ServiceProtocol,
    ) -> DeviceResult<Box<dyn PairingHandle>>;
}

/// A live connection to one device.
///
/// `audio` and `keyboard` are optional capabilities: whether a device exposes
/// them depends on the protocols it was connected over. Callers check once at
/// attach time rather than probing per call.
#[async_trait]
pub trait DeviceHandle: Send + Sync {
    fn descriptor(&self) -> DeviceDescriptor;

    /// Sends a remote-control command.
    async fn send(&self, command: RemoteCommand, action: InputAction) -> DeviceResult<()>;

    /// Current now-playing snapshot, if the device reports one.
    fn now_playing(&self) -> Option<PlayingSnapshot>;

    /// Identity of the foreground application, best-effort.
    fn foreground_app(&self) -> Option<AppInfo>;

    fn audio(&self) -> Option<&dyn AudioControl>;

    fn keyboard(&self) -> Option<&dyn KeyboardControl>;

    /// Starts the push-update subscription and returns its event stream.
    ///
    /// Must be called before the connection is treated as live, and must be
    /// balanced by [`stop_push_updates`](Self::stop_push_updates) before the
    /// handle is closed.
    async fn start_push_updates(&self) -> DeviceResult<UnboundedReceiver<PushEvent>>;

    /// Stops the push-update subscription.
    async fn stop_push_updates(&self) -> DeviceResult<()>;

    /// Releases the connection.
    async fn close(&self);
}

/// Optional volume capability of a connection.
#[async_trait]
pub trait AudioControl: Send + Sync {
    async fn volume_up(&self) -> DeviceResult<()>;
    async fn volume_down(&self) -> DeviceResult<()>;
}

/// Optional virtual-keyboard capability of a connection.
#[async_trait]
pub trait KeyboardControl: Send + Sync {
    async fn text_set(&self, text: &str) -> DeviceResult<()>;
    async fn text_clear(&self) -> DeviceResult<()>;
    async fn text_get(&self) -> DeviceResult<Option<String>>;
}

/// An in-flight pairing handshake. At most one exists per session.
#[async_trait]
pub trait PairingHandle: Send + Sync {
    /// Whether the device displays a PIN that must be fed back in.
    fn device_provides_pin(&self) -> bool;

    fn set_pin(&mut self, pin: &str);

    /// Runs the first half of the handshake.
    async fn begin(&mut self) -> DeviceResult<()>;

    /// Completes the handshake with the PIN set earlier.
    async fn finish(&mut self) -> DeviceResult<()>;

    /// Whether the handshake produced credentials.
    fn has_paired(&self) -> bool;

    /// Tears the pairing session down.
    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_names_round_trip_known_set() {
        for name in [
            "up",
            "down",
            "left",
            "right",
            "select",
            "menu",
            "home",
            "home_hold",
            "top_menu",
            "play",
            "pause",
            "play_pause",
            "stop",
            "next",
            "previous",
            "skip_forward",
            "skip_backward",
            "volume_up",
            "volume_down",
        ] {
            assert!(RemoteCommand::parse(name).is_some(), "unmapped: {name}");
        }
        assert!(RemoteCommand::parse("launch_app").is_none());
    }

    #[test]
    fn unknown_input_action_falls_back_to_single_tap() {
        assert_eq!(InputAction::parse("triple_tap"), InputAction::SingleTap);
        assert_eq!(InputAction::parse("hold"), InputAction::Hold);
    }
}
