//! Connection session state machine.
//!
//! One [`Session`] owns the live device connection and everything that keeps
//! it alive: the scan cache, the listener bridge, the reconnection task and
//! the in-flight pairing handshake. All request handlers and the wake monitor
//! talk to the same cloned session; internal state sits behind one async
//! mutex and no method holds it across an await into another session method.
//!
//! # Reconnection
//!
//! Losing a connection never surfaces as a request failure. The listener
//! bridge reports the loss, the session drops the dead handle and spawns a
//! reconnection task that re-scans and retries under exponential backoff,
//! narrating every attempt through the notification channel. Reconnection
//! targets the device identifier, not its last address: devices routinely
//! come back on a different address after sleep.
//!
//! A system wake takes a fast path instead: cancel whatever reconnection is
//! in flight and try once immediately, falling back to the normal loop if
//! that misses.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::{Backoff, BackoffConfig};
use crate::classify::{classify, requires_repairing, ErrorCategory};
use crate::device::{
    DeviceBackend, DeviceDescriptor, DeviceError, DeviceHandle, DeviceResult, InputAction,
    PairingHandle, PlayingSnapshot, RemoteCommand, ServiceProtocol,
};
use crate::events::{ConnectionEvent, DeviceInfo, EventSink, Notification};
use crate::listener::ListenerBridge;
use crate::storage::{CredentialStore, SavedDevice};

/// Attempt numbering reported for the wake fast path.
const WAKE_ATTEMPT: u32 = 1;
const WAKE_MAX_ATTEMPTS: u32 = 3;

/// One scan result as reported to the client.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ScanEntry {
    pub identifier: String,
    pub name: String,
    pub address: String,
    pub services: Vec<ServiceProtocol>,
    /// Whether credentials are stored for this device.
    pub paired: bool,
}

/// Snapshot of the session state, for `get_status`.
#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub connected: bool,
    pub reconnecting: bool,
    pub device: Option<DeviceInfo>,
    pub playback: Option<PlayingSnapshot>,
}

/// Result of starting a pairing handshake.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct PairingStarted {
    /// Whether the device displays a PIN the client must collect.
    pub requires_pin: bool,
    pub protocol: ServiceProtocol,
}

/// Outcome of a wake fast-path attempt.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WakeOutcome {
    pub success: bool,
    pub message: String,
}

impl WakeOutcome {
    fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

struct ReconnectTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct PairingState {
    handle: Box<dyn PairingHandle>,
    protocol: ServiceProtocol,
}

#[derive(Default)]
struct Inner {
    handle: Option<Arc<dyn DeviceHandle>>,
    /// Descriptor of the connected (or last connected) device.
    device: Option<DeviceDescriptor>,
    /// Devices found by the most recent scan, keyed by identifier.
    scanned: HashMap<String, DeviceDescriptor>,
    /// Reconnection target. Survives connection loss.
    last_identifier: Option<String>,
    bridge: Option<ListenerBridge>,
    reconnect: Option<ReconnectTask>,
    reconnecting: bool,
    pairing: Option<PairingState>,
}

/// Cloneable handle to the shared session state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Mutex<Inner>>,
    /// Serializes reconnect task handoff: take, cancel, await, spawn, store
    /// happen under this lock so at most one task exists at any point.
    reconnect_gate: Arc<Mutex<()>>,
    backend: Arc<dyn DeviceBackend>,
    storage: Arc<dyn CredentialStore>,
    sink: EventSink,
    backoff: BackoffConfig,
    scan_timeout: Duration,
}

impl Session {
    #[must_use]
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        storage: Arc<dyn CredentialStore>,
        sink: EventSink,
        backoff: BackoffConfig,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            reconnect_gate: Arc::new(Mutex::new(())),
            backend,
            storage,
            sink,
            backoff,
            scan_timeout,
        }
    }

    fn emit(&self, notification: Notification) {
        // A closed channel means the host is shutting down. Nothing to do.
        let _ = self.sink.send(notification);
    }

    /// Scans the network and refreshes the descriptor cache.
    pub async fn scan(&self, timeout: Duration) -> DeviceResult<Vec<ScanEntry>> {
        let devices = self.backend.scan(timeout).await?;
        debug!("scan found {} devices", devices.len());

        {
            let mut inner = self.inner.lock().await;
            inner.scanned.clear();
            for descriptor in &devices {
                inner
                    .scanned
                    .insert(descriptor.identifier.clone(), descriptor.clone());
            }
        }

        let mut entries = Vec::with_capacity(devices.len());
        for descriptor in devices {
            let paired = self
                .storage
                .settings_for(&descriptor.identifier)
                .await
                .is_some_and(|settings| settings.is_paired());
            entries.push(ScanEntry {
                identifier: descriptor.identifier,
                name: descriptor.name,
                address: descriptor.address.to_string(),
                services: descriptor.services,
                paired,
            });
        }
        Ok(entries)
    }

    /// Looks up a device by identifier, re-scanning once on a cache miss.
    async fn resolve(&self, identifier: &str) -> DeviceResult<DeviceDescriptor> {
        if let Some(descriptor) = self.inner.lock().await.scanned.get(identifier).cloned() {
            return Ok(descriptor);
        }

        self.scan(self.scan_timeout).await?;
        self.inner
            .lock()
            .await
            .scanned
            .get(identifier)
            .cloned()
            .ok_or_else(|| {
                DeviceError::ConnectionFailed(format!("device {identifier} not found on network"))
            })
    }

    /// Connects to a device by identifier.
    ///
    /// Any in-flight reconnection is cancelled and an existing connection is
    /// torn down first; the session holds at most one live handle.
    pub async fn connect(&self, identifier: &str) -> DeviceResult<DeviceInfo> {
        self.cancel_reconnect().await;
        if self.inner.lock().await.handle.is_some() {
            self.disconnect().await;
        }
        self.establish(identifier).await
    }

    /// Resolves, connects and attaches listeners. Callers must have torn
    /// down any existing handle; the reconnect loop calls this directly and
    /// must never re-enter the reconnect task handoff.
    async fn establish(&self, identifier: &str) -> DeviceResult<DeviceInfo> {
        let descriptor = self.resolve(identifier).await?;
        let handle: Arc<dyn DeviceHandle> = Arc::from(self.backend.connect(&descriptor).await?);
        let info = DeviceInfo::from(&descriptor);

        let bridge = match ListenerBridge::attach(
            Arc::clone(&handle),
            self.sink.clone(),
            Some(info.clone()),
            self.clone(),
        )
        .await
        {
            Ok(bridge) => bridge,
            Err(e) => {
                handle.close().await;
                return Err(e);
            }
        };

        {
            let mut inner = self.inner.lock().await;
            inner.handle = Some(handle);
            inner.device = Some(descriptor);
            inner.last_identifier = Some(identifier.to_string());
            inner.bridge = Some(bridge);
        }
        info!("connected to {} at {}", info.name, info.address);
        self.emit(Notification::ConnectionState(ConnectionEvent::connected(
            info.clone(),
        )));
        Ok(info)
    }

    /// Tears down the connection on purpose. No reconnection follows.
    pub async fn disconnect(&self) {
        self.cancel_reconnect().await;

        let (bridge, handle, device) = {
            let mut inner = self.inner.lock().await;
            let device = inner.device.take();
            (
                inner.bridge.take(),
                inner.handle.take(),
                device.as_ref().map(DeviceInfo::from),
            )
        };

        if let Some(handle) = handle {
            if let Some(bridge) = bridge {
                bridge.detach(handle.as_ref()).await;
            }
            handle.close().await;
            info!("disconnected");
            self.emit(Notification::ConnectionState(
                ConnectionEvent::disconnected(device),
            ));
        }
    }

    /// Reacts to a connection loss reported by the listener bridge.
    ///
    /// The dead handle is dropped without a close handshake and a
    /// reconnection task takes over.
    ///
    /// Returns a boxed future: the event pump awaits this, the reconnection
    /// task re-attaches the pump, and type erasure is what keeps that cycle
    /// out of the spawned futures' types.
    pub fn handle_connection_lost(
        &self,
        error: DeviceError,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            warn!("handling connection loss: {error}");

            let (device, target) = {
                let mut inner = self.inner.lock().await;
                inner.handle = None;
                if let Some(bridge) = inner.bridge.take() {
                    bridge.forget();
                }
                (
                    inner.device.as_ref().map(DeviceInfo::from),
                    inner.last_identifier.clone(),
                )
            };

            if target.is_none() {
                warn!("connection lost with no reconnection target");
                return;
            }
            self.schedule_reconnect(device).await;
        })
    }

    /// Replaces any running reconnection task with a fresh one.
    async fn schedule_reconnect(&self, device: Option<DeviceInfo>) {
        let _handoff = self.reconnect_gate.lock().await;

        let previous = self.inner.lock().await.reconnect.take();
        if let Some(task) = previous {
            task.token.cancel();
            let _ = task.handle.await;
        }

        self.inner.lock().await.reconnecting = true;
        let token = CancellationToken::new();
        let session = self.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            session.reconnect_loop(loop_token, device).await;
        });
        self.inner.lock().await.reconnect = Some(ReconnectTask { token, handle });
    }

    async fn reconnect_loop(self, token: CancellationToken, device: Option<DeviceInfo>) {
        let Some(identifier) = self.inner.lock().await.last_identifier.clone() else {
            self.clear_reconnecting().await;
            return;
        };

        let mut backoff = Backoff::new(self.backoff);
        let mut last_error: Option<String> = None;
        info!(
            "reconnecting to {identifier}, up to {} attempts",
            backoff.max_attempts()
        );

        loop {
            // A manual connect may have restored the connection while this
            // task was waiting; it must stand down, not tear it up.
            if self.inner.lock().await.handle.is_some() {
                debug!("connection already restored, standing down");
                self.clear_reconnecting().await;
                return;
            }

            let Some(delay) = backoff.next() else {
                warn!(
                    "giving up on {identifier} after {} attempts",
                    backoff.max_attempts()
                );
                self.clear_reconnecting().await;
                self.emit(Notification::ConnectionState(ConnectionEvent {
                    attempt: Some(backoff.attempt()),
                    max_attempts: Some(backoff.max_attempts()),
                    ..ConnectionEvent::failed(
                        device.clone(),
                        last_error
                            .take()
                            .unwrap_or_else(|| "all reconnection attempts failed".to_string()),
                    )
                }));
                return;
            };

            info!(
                "reconnect attempt {}/{} in {:.1}s",
                backoff.attempt(),
                backoff.max_attempts(),
                delay.as_secs_f64()
            );
            self.emit(Notification::ConnectionState(
                ConnectionEvent::reconnecting(
                    device.clone(),
                    backoff.attempt(),
                    backoff.max_attempts(),
                    delay.as_secs(),
                    last_error.clone(),
                ),
            ));

            tokio::select! {
                () = token.cancelled() => {
                    debug!("reconnection cancelled while waiting");
                    self.clear_reconnecting().await;
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }

            if let Err(e) = self.scan(self.scan_timeout).await {
                debug!("reconnect scan failed: {e}");
                last_error = Some(e.to_string());
                continue;
            }
            if token.is_cancelled() {
                self.clear_reconnecting().await;
                return;
            }

            if !self.inner.lock().await.scanned.contains_key(&identifier) {
                debug!("device {identifier} not found, will retry");
                last_error = Some("device not found on network".to_string());
                continue;
            }

            match self.establish(&identifier).await {
                Ok(info) => {
                    // `establish` has already announced the new connection.
                    self.clear_reconnecting().await;
                    info!("reconnected to {}", info.name);
                    return;
                }
                Err(e) if classify(&e).category == ErrorCategory::NonRetryable => {
                    warn!("reconnection hit a non-retryable failure: {e}");
                    self.clear_reconnecting().await;
                    self.emit(Notification::ConnectionState(ConnectionEvent {
                        requires_repairing: Some(requires_repairing(&e)),
                        ..ConnectionEvent::failed(device.clone(), classify(&e).message.to_string())
                    }));
                    return;
                }
                Err(e) => {
                    debug!("reconnect attempt failed: {e}");
                    last_error = Some(e.to_string());
                }
            }
        }
    }

    async fn clear_reconnecting(&self) {
        self.inner.lock().await.reconnecting = false;
    }

    /// Stops a running reconnection task. Returns whether one was running.
    pub async fn cancel_reconnect(&self) -> bool {
        let _handoff = self.reconnect_gate.lock().await;

        let Some(task) = self.inner.lock().await.reconnect.take() else {
            return false;
        };
        let was_running = !task.handle.is_finished();
        task.token.cancel();
        let _ = task.handle.await;
        self.inner.lock().await.reconnecting = false;
        if was_running {
            info!("reconnection cancelled");
        }
        was_running
    }

    /// Fast-path reconnect after a system wake.
    ///
    /// Cancels any backoff loop already in flight and tries once with no
    /// delay. A miss hands over to the normal reconnection loop rather than
    /// reporting failure to the user.
    pub async fn trigger_wake_reconnect(&self) -> WakeOutcome {
        info!("wake reconnect triggered");
        self.cancel_reconnect().await;

        let (identifier, connected, device) = {
            let inner = self.inner.lock().await;
            (
                inner.last_identifier.clone(),
                inner.handle.is_some(),
                inner.device.as_ref().map(DeviceInfo::from),
            )
        };
        let Some(identifier) = identifier else {
            return WakeOutcome::failed("no device to reconnect to");
        };
        if connected {
            return WakeOutcome::succeeded("already connected");
        }

        self.emit(Notification::ConnectionState(
            ConnectionEvent::reconnecting(device.clone(), WAKE_ATTEMPT, WAKE_MAX_ATTEMPTS, 0, None)
                .wake(),
        ));

        if let Err(e) = self.scan(self.scan_timeout).await {
            debug!("wake scan failed: {e}");
            self.schedule_reconnect(device).await;
            return WakeOutcome::failed(format!("scan failed, starting reconnection: {e}"));
        }
        if !self.inner.lock().await.scanned.contains_key(&identifier) {
            self.schedule_reconnect(device).await;
            return WakeOutcome::failed("device not found, starting reconnection");
        }

        match self.connect(&identifier).await {
            Ok(_) => WakeOutcome::succeeded("reconnected after wake"),
            Err(e) => {
                debug!("wake reconnect failed: {e}");
                self.schedule_reconnect(device).await;
                WakeOutcome::failed("connection failed, starting reconnection")
            }
        }
    }

    /// Sends a remote command to the connected device.
    ///
    /// Returns `Ok(false)` for unknown command names and when no device is
    /// connected; both are client mistakes rather than device failures.
    pub async fn send_command(&self, name: &str, action: &str) -> DeviceResult<bool> {
        let Some(command) = RemoteCommand::parse(name) else {
            debug!("unknown command name: {name}");
            return Ok(false);
        };
        let Some(handle) = self.inner.lock().await.handle.clone() else {
            return Ok(false);
        };

        let action = InputAction::parse(action);
        match command {
            // Volume goes through the audio capability so routed outputs
            // (soundbars, speaker groups) are adjusted too.
            RemoteCommand::VolumeUp => match handle.audio() {
                Some(audio) => audio.volume_up().await?,
                None => {
                    return Err(DeviceError::NotSupported(
                        "volume control unavailable".to_string(),
                    ))
                }
            },
            RemoteCommand::VolumeDown => match handle.audio() {
                Some(audio) => audio.volume_down().await?,
                None => {
                    return Err(DeviceError::NotSupported(
                        "volume control unavailable".to_string(),
                    ))
                }
            },
            _ => handle.send(command, action).await?,
        }
        Ok(true)
    }

    /// Begins a pairing handshake. At most one may be in flight.
    pub async fn start_pairing(
        &self,
        identifier: &str,
        protocol: ServiceProtocol,
    ) -> DeviceResult<PairingStarted> {
        if self.inner.lock().await.pairing.is_some() {
            return Err(DeviceError::Pairing(
                "another pairing session is already active".to_string(),
            ));
        }

        let descriptor = self.resolve(identifier).await?;
        let mut pairing = self.backend.pair(&descriptor, protocol).await?;
        if let Err(e) = pairing.begin().await {
            pairing.close().await;
            return Err(e);
        }

        let started = PairingStarted {
            requires_pin: pairing.device_provides_pin(),
            protocol,
        };
        self.inner.lock().await.pairing = Some(PairingState {
            handle: pairing,
            protocol,
        });
        info!("pairing started with {} over {protocol:?}", descriptor.name);
        Ok(started)
    }

    /// Completes the pairing handshake with the PIN shown on the device.
    ///
    /// Returns whether credentials were produced. The handshake is consumed
    /// either way; a failed attempt restarts from `start_pairing`.
    pub async fn finish_pairing(&self, pin: &str) -> DeviceResult<bool> {
        let Some(mut state) = self.inner.lock().await.pairing.take() else {
            return Ok(false);
        };

        state.handle.set_pin(pin);
        match state.handle.finish().await {
            Ok(()) => {
                let paired = state.handle.has_paired();
                state.handle.close().await;
                if paired {
                    if let Err(e) = self.storage.save().await {
                        warn!("pairing succeeded but credentials were not persisted: {e}");
                    }
                    info!("paired over {:?}", state.protocol);
                }
                Ok(paired)
            }
            Err(e) => {
                state.handle.close().await;
                Err(e)
            }
        }
    }

    pub async fn saved_devices(&self) -> Vec<SavedDevice> {
        self.storage.saved_devices().await
    }

    /// Forgets a device's stored credentials. Returns whether any existed.
    pub async fn forget_device(&self, identifier: &str) -> DeviceResult<bool> {
        let removed = self.storage.remove_settings(identifier).await?;
        if removed {
            self.storage.save().await?;
            info!("forgot device {identifier}");
        }
        Ok(removed)
    }

    pub async fn set_text(&self, text: &str) -> DeviceResult<()> {
        let handle = self.live_handle().await?;
        let Some(keyboard) = handle.keyboard() else {
            return Err(DeviceError::NotSupported(
                "virtual keyboard unavailable".to_string(),
            ));
        };
        keyboard.text_set(text).await
    }

    pub async fn clear_text(&self) -> DeviceResult<()> {
        let handle = self.live_handle().await?;
        let Some(keyboard) = handle.keyboard() else {
            return Err(DeviceError::NotSupported(
                "virtual keyboard unavailable".to_string(),
            ));
        };
        keyboard.text_clear().await
    }

    pub async fn get_text(&self) -> DeviceResult<Option<String>> {
        let handle = self.live_handle().await?;
        let Some(keyboard) = handle.keyboard() else {
            return Err(DeviceError::NotSupported(
                "virtual keyboard unavailable".to_string(),
            ));
        };
        keyboard.text_get().await
    }

    pub async fn status(&self) -> SessionStatus {
        let inner = self.inner.lock().await;
        SessionStatus {
            connected: inner.handle.is_some(),
            reconnecting: inner.reconnecting,
            device: inner.device.as_ref().map(DeviceInfo::from),
            playback: inner
                .handle
                .as_ref()
                .and_then(|handle| handle.now_playing()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.handle.is_some()
    }

    pub async fn is_reconnecting(&self) -> bool {
        self.inner.lock().await.reconnecting
    }

    async fn live_handle(&self) -> DeviceResult<Arc<dyn DeviceHandle>> {
        self.inner
            .lock()
            .await
            .handle
            .clone()
            .ok_or(DeviceError::NotConnected)
    }
}
