//! Bridges device push events into the notification channel.
//!
//! One bridge exists per live connection. It consumes the handle's push-event
//! stream on a background task, runs playback snapshots through the
//! sanitizer, suppresses duplicates, and forwards the rest to the
//! notification sink. Connection loss is routed back into the session, which
//! owns the reconnection policy.
//!
//! Teardown ordering is load-bearing: the push subscription is stopped before
//! the handle is closed, on every path.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::device::{DeviceHandle, DeviceResult, PushEvent};
use crate::events::{ConnectionEvent, DeviceInfo, EventSink, Notification};
use crate::sanitizer::{PlaybackSanitizer, SanitizedPlayback};
use crate::session::Session;

pub struct ListenerBridge {
    task: JoinHandle<()>,
}

impl ListenerBridge {
    /// Starts push updates on the handle and spawns the event pump.
    ///
    /// Must complete before the connection is treated as live.
    pub async fn attach(
        handle: Arc<dyn DeviceHandle>,
        sink: EventSink,
        device: Option<DeviceInfo>,
        session: Session,
    ) -> DeviceResult<Self> {
        let events = handle.start_push_updates().await?;
        debug!("push updates started");

        let task = tokio::spawn(pump(events, handle, sink, device, session));
        Ok(Self { task })
    }

    /// Stops push updates and the event pump.
    ///
    /// Must be called before the handle is closed. A failure to stop cleanly
    /// is logged, not propagated: the handle is going away either way.
    pub async fn detach(self, handle: &dyn DeviceHandle) {
        if let Err(e) = handle.stop_push_updates().await {
            warn!("failed to stop push updates: {e}");
        }
        self.task.abort();
        debug!("listeners detached");
    }

    /// Drops the bridge without touching the handle. Used when the
    /// connection is already gone and there is nothing left to stop.
    pub fn forget(self) {
        // Dropping the join handle detaches the pump task; it exits on its
        // own once the push channel closes.
        drop(self.task);
    }
}

/// Dedup state for non-playback push events.
#[derive(Default)]
struct PumpState {
    sanitizer: PlaybackSanitizer,
    last_hash: Option<String>,
    last_playback: Option<SanitizedPlayback>,
    last_volume: Option<f32>,
    last_focus: Option<bool>,
}

async fn pump(
    mut events: UnboundedReceiver<PushEvent>,
    handle: Arc<dyn DeviceHandle>,
    sink: EventSink,
    device: Option<DeviceInfo>,
    session: Session,
) {
    let mut state = PumpState::default();

    while let Some(event) = events.recv().await {
        match event {
            PushEvent::Playback(snapshot) => {
                let app = handle.foreground_app();
                let Some(sanitized) = state.sanitizer.sanitize(&snapshot, app.as_ref()) else {
                    continue;
                };

                // Re-emission is suppressed only when neither the content
                // identity nor the sanitized state changed.
                let unchanged = snapshot.content_hash == state.last_hash
                    && state.last_playback.as_ref() == Some(&sanitized);
                if unchanged {
                    continue;
                }

                state.last_hash = snapshot.content_hash;
                state.last_playback = Some(sanitized.clone());
                info!("playback update: {} ({:?})", sanitized.title, sanitized.state);
                let _ = sink.send(Notification::PlaybackUpdate(sanitized));
            }
            PushEvent::PlaybackError(error) => {
                warn!("push update error: {error}");
                let _ = sink.send(Notification::PlaybackError {
                    error: error.to_string(),
                });
            }
            PushEvent::VolumeChanged {
                old_level,
                new_level,
            } => {
                if state.last_volume == Some(new_level) {
                    continue;
                }
                state.last_volume = Some(new_level);
                let _ = sink.send(Notification::VolumeUpdate {
                    old_level,
                    new_level,
                });
            }
            PushEvent::OutputDevicesChanged(devices) => {
                debug!("output devices changed: {} devices", devices.len());
                let _ = sink.send(Notification::OutputDevicesUpdate { devices });
            }
            PushEvent::KeyboardFocus(focused) => {
                if state.last_focus == Some(focused) {
                    continue;
                }
                state.last_focus = Some(focused);
                let _ = sink.send(Notification::KeyboardFocus { focused });
            }
            PushEvent::ConnectionClosed => {
                info!("connection closed by the device");
                let _ = sink.send(Notification::ConnectionState(ConnectionEvent::disconnected(
                    device.clone(),
                )));
                break;
            }
            PushEvent::ConnectionLost(error) => {
                warn!("connection lost: {error}");
                let _ = sink.send(Notification::ConnectionState(ConnectionEvent::lost(
                    device.clone(),
                    error.to_string(),
                )));
                session.handle_connection_lost(error).await;
                break;
            }
        }
    }
}
