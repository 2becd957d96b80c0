//! Scripted in-memory device backend.
//!
//! Stands in for a real device-control library when none is linked: the
//! integration tests drive the session against it, and the binary's
//! `--simulate` flag wires it up so the request surface can be exercised
//! end to end without hardware.
//!
//! The backend and its [`SimController`] share one state block. The
//! controller scripts what the next scan returns, injects push events into
//! the live connection and records every call the session makes, in order,
//! so tests can assert on teardown sequencing.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::device::{
    AppInfo, AudioControl, DeviceBackend, DeviceDescriptor, DeviceError, DeviceHandle,
    DeviceResult, InputAction, KeyboardControl, PairingHandle, PlayingSnapshot, PushEvent,
    RemoteCommand, ServiceProtocol,
};

/// Builds a descriptor for a simulated device.
#[must_use]
pub fn device(identifier: &str, name: &str, address: [u8; 4]) -> DeviceDescriptor {
    DeviceDescriptor {
        identifier: identifier.to_string(),
        name: name.to_string(),
        address: IpAddr::V4(Ipv4Addr::from(address)),
        services: vec![ServiceProtocol::Companion, ServiceProtocol::AirPlay],
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct State {
    devices: Vec<DeviceDescriptor>,
    scan_failures: VecDeque<DeviceError>,
    connect_failures: VecDeque<DeviceError>,
    push: Option<UnboundedSender<PushEvent>>,
    now_playing: Option<PlayingSnapshot>,
    foreground_app: Option<AppInfo>,
    keyboard_text: Option<String>,
    expected_pin: Option<String>,
}

struct Shared {
    state: Mutex<State>,
    log: Mutex<Vec<String>>,
    has_audio: AtomicBool,
    has_keyboard: AtomicBool,
    provides_pin: AtomicBool,
}

impl Shared {
    fn record(&self, entry: impl Into<String>) {
        lock(&self.log).push(entry.into());
    }
}

/// Simulated device-control library entry point.
pub struct SimBackend {
    shared: Arc<Shared>,
}

impl SimBackend {
    /// Creates a backend with no devices on the simulated network, plus the
    /// controller that scripts it.
    #[must_use]
    pub fn new() -> (Self, SimController) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            log: Mutex::new(Vec::new()),
            has_audio: AtomicBool::new(true),
            has_keyboard: AtomicBool::new(true),
            provides_pin: AtomicBool::new(true),
        });
        let controller = SimController {
            shared: Arc::clone(&shared),
        };
        (Self { shared }, controller)
    }
}

#[async_trait]
impl DeviceBackend for SimBackend {
    async fn scan(&self, _timeout: Duration) -> DeviceResult<Vec<DeviceDescriptor>> {
        self.shared.record("scan");
        let mut state = lock(&self.shared.state);
        if let Some(error) = state.scan_failures.pop_front() {
            return Err(error);
        }
        Ok(state.devices.clone())
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> DeviceResult<Box<dyn DeviceHandle>> {
        self.shared.record(format!("connect {}", descriptor.identifier));
        if let Some(error) = lock(&self.shared.state).connect_failures.pop_front() {
            return Err(error);
        }
        Ok(Box::new(SimHandle {
            shared: Arc::clone(&self.shared),
            descriptor: descriptor.clone(),
        }))
    }

    async fn pair(
        &self,
        descriptor: &DeviceDescriptor,
        protocol: ServiceProtocol,
    ) -> DeviceResult<Box<dyn PairingHandle>> {
        self.shared
            .record(format!("pair {} {protocol:?}", descriptor.identifier));
        Ok(Box::new(SimPairing {
            shared: Arc::clone(&self.shared),
            pin: None,
            paired: false,
        }))
    }
}

/// Scripting and inspection handle for a [`SimBackend`].
#[derive(Clone)]
pub struct SimController {
    shared: Arc<Shared>,
}

impl SimController {
    /// Replaces the set of devices future scans will find.
    pub fn set_devices(&self, devices: Vec<DeviceDescriptor>) {
        lock(&self.shared.state).devices = devices;
    }

    /// Queues a failure for the next scan.
    pub fn fail_next_scan(&self, error: DeviceError) {
        lock(&self.shared.state).scan_failures.push_back(error);
    }

    /// Queues a failure for the next connect attempt. Queued failures are
    /// consumed in order; once drained, connects succeed again.
    pub fn fail_next_connect(&self, error: DeviceError) {
        lock(&self.shared.state).connect_failures.push_back(error);
    }

    /// Injects a push event into the live connection. Returns whether a
    /// subscription was there to receive it.
    pub fn push(&self, event: PushEvent) -> bool {
        lock(&self.shared.state)
            .push
            .as_ref()
            .is_some_and(|sender| sender.send(event).is_ok())
    }

    /// Simulates the transport dropping out from under the session.
    pub fn drop_connection(&self, error: DeviceError) -> bool {
        self.push(PushEvent::ConnectionLost(error))
    }

    pub fn set_now_playing(&self, snapshot: Option<PlayingSnapshot>) {
        lock(&self.shared.state).now_playing = snapshot;
    }

    pub fn set_foreground_app(&self, app: Option<AppInfo>) {
        lock(&self.shared.state).foreground_app = app;
    }

    /// Scripts which optional capabilities connections expose.
    pub fn set_capabilities(&self, audio: bool, keyboard: bool) {
        self.shared.has_audio.store(audio, Ordering::SeqCst);
        self.shared.has_keyboard.store(keyboard, Ordering::SeqCst);
    }

    /// Requires this PIN for pairing to produce credentials.
    pub fn set_expected_pin(&self, pin: &str) {
        lock(&self.shared.state).expected_pin = Some(pin.to_string());
    }

    pub fn set_provides_pin(&self, provides: bool) {
        self.shared.provides_pin.store(provides, Ordering::SeqCst);
    }

    /// Every backend call made so far, in order.
    #[must_use]
    pub fn log(&self) -> Vec<String> {
        lock(&self.shared.log).clone()
    }

    /// How many connect attempts the session has made.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        lock(&self.shared.log)
            .iter()
            .filter(|entry| entry.starts_with("connect "))
            .count()
    }
}

struct SimHandle {
    shared: Arc<Shared>,
    descriptor: DeviceDescriptor,
}

#[async_trait]
impl DeviceHandle for SimHandle {
    fn descriptor(&self) -> DeviceDescriptor {
        self.descriptor.clone()
    }

    async fn send(&self, command: RemoteCommand, action: InputAction) -> DeviceResult<()> {
        self.shared.record(format!("send {command:?} {action:?}"));
        Ok(())
    }

    fn now_playing(&self) -> Option<PlayingSnapshot> {
        lock(&self.shared.state).now_playing.clone()
    }

    fn foreground_app(&self) -> Option<AppInfo> {
        lock(&self.shared.state).foreground_app.clone()
    }

    fn audio(&self) -> Option<&dyn AudioControl> {
        self.shared
            .has_audio
            .load(Ordering::SeqCst)
            .then_some(self as &dyn AudioControl)
    }

    fn keyboard(&self) -> Option<&dyn KeyboardControl> {
        self.shared
            .has_keyboard
            .load(Ordering::SeqCst)
            .then_some(self as &dyn KeyboardControl)
    }

    async fn start_push_updates(&self) -> DeviceResult<tokio::sync::mpsc::UnboundedReceiver<PushEvent>> {
        self.shared.record("start_push");
        let (sender, receiver) = unbounded_channel();
        lock(&self.shared.state).push = Some(sender);
        Ok(receiver)
    }

    async fn stop_push_updates(&self) -> DeviceResult<()> {
        self.shared.record("stop_push");
        lock(&self.shared.state).push = None;
        Ok(())
    }

    async fn close(&self) {
        self.shared.record("close");
        lock(&self.shared.state).push = None;
    }
}

#[async_trait]
impl AudioControl for SimHandle {
    async fn volume_up(&self) -> DeviceResult<()> {
        self.shared.record("volume_up");
        Ok(())
    }

    async fn volume_down(&self) -> DeviceResult<()> {
        self.shared.record("volume_down");
        Ok(())
    }
}

#[async_trait]
impl KeyboardControl for SimHandle {
    async fn text_set(&self, text: &str) -> DeviceResult<()> {
        self.shared.record(format!("text_set {text}"));
        lock(&self.shared.state).keyboard_text = Some(text.to_string());
        Ok(())
    }

    async fn text_clear(&self) -> DeviceResult<()> {
        self.shared.record("text_clear");
        lock(&self.shared.state).keyboard_text = None;
        Ok(())
    }

    async fn text_get(&self) -> DeviceResult<Option<String>> {
        Ok(lock(&self.shared.state).keyboard_text.clone())
    }
}

struct SimPairing {
    shared: Arc<Shared>,
    pin: Option<String>,
    paired: bool,
}

#[async_trait]
impl PairingHandle for SimPairing {
    fn device_provides_pin(&self) -> bool {
        self.shared.provides_pin.load(Ordering::SeqCst)
    }

    fn set_pin(&mut self, pin: &str) {
        self.pin = Some(pin.to_string());
    }

    async fn begin(&mut self) -> DeviceResult<()> {
        self.shared.record("pair_begin");
        Ok(())
    }

    async fn finish(&mut self) -> DeviceResult<()> {
        self.shared.record("pair_finish");
        let expected = lock(&self.shared.state).expected_pin.clone();
        match expected {
            Some(expected) if self.pin.as_deref() != Some(expected.as_str()) => {
                Err(DeviceError::Pairing("incorrect PIN".to_string()))
            }
            _ => {
                self.paired = true;
                Ok(())
            }
        }
    }

    fn has_paired(&self) -> bool {
        self.paired
    }

    async fn close(&mut self) {
        self.shared.record("pair_close");
    }
}
