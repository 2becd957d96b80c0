//! Session behavior other than reconnection: teardown ordering, command
//! routing, pairing, the virtual keyboard and the playback pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use castlink::backoff::BackoffConfig;
use castlink::device::{
    AppInfo, DeviceError, MediaKind, PlayState, PlayingSnapshot, PushEvent, ServiceProtocol,
};
use castlink::events::Notification;
use castlink::session::Session;
use castlink::sim::{device, SimBackend, SimController};
use castlink::storage::{DeviceSettings, MemoryStore};

fn harness() -> (
    Session,
    SimController,
    UnboundedReceiver<Notification>,
    Arc<MemoryStore>,
) {
    let (backend, controller) = SimBackend::new();
    controller.set_devices(vec![device("tv-1", "Living Room", [192, 168, 1, 20])]);
    let storage = Arc::new(MemoryStore::new());
    let (sink, events) = unbounded_channel();
    let session = Session::new(
        Arc::new(backend),
        storage.clone(),
        sink,
        BackoffConfig::default(),
        Duration::from_secs(1),
    );
    (session, controller, events, storage)
}

fn snapshot(title: &str, total_time: u64) -> PlayingSnapshot {
    PlayingSnapshot {
        state: PlayState::Playing,
        media_kind: MediaKind::Video,
        title: Some(title.to_string()),
        artist: None,
        album: None,
        position: Some(10),
        total_time: Some(total_time),
        content_hash: Some(format!("hash-{title}")),
    }
}

#[tokio::test]
async fn disconnect_stops_push_updates_before_closing() {
    let (session, controller, _events, _storage) = harness();
    session.connect("tv-1").await.unwrap();
    session.disconnect().await;

    let log = controller.log();
    let stop = log.iter().position(|e| e == "stop_push").unwrap();
    let close = log.iter().position(|e| e == "close").unwrap();
    assert!(stop < close, "stop_push must precede close: {log:?}");
    assert!(!session.is_connected().await);
}

#[tokio::test]
async fn connect_starts_push_updates_before_going_live() {
    let (session, controller, _events, _storage) = harness();
    session.connect("tv-1").await.unwrap();

    let log = controller.log();
    let connect = log.iter().position(|e| e == "connect tv-1").unwrap();
    let start = log.iter().position(|e| e == "start_push").unwrap();
    assert!(connect < start);
    assert!(session.is_connected().await);
}

#[tokio::test]
async fn connecting_to_an_unknown_device_fails_cleanly() {
    let (session, _controller, _events, _storage) = harness();
    let error = session.connect("nope").await.unwrap_err();
    assert!(matches!(error, DeviceError::ConnectionFailed(_)));
    assert!(!session.is_connected().await);
}

#[tokio::test]
async fn commands_route_through_the_right_capability() {
    let (session, controller, _events, _storage) = harness();
    session.connect("tv-1").await.unwrap();

    assert!(session.send_command("select", "single_tap").await.unwrap());
    assert!(session.send_command("home", "hold").await.unwrap());
    assert!(session.send_command("volume_up", "single_tap").await.unwrap());

    let log = controller.log();
    assert!(log.contains(&"send Select SingleTap".to_string()));
    assert!(log.contains(&"send Home Hold".to_string()));
    assert!(log.contains(&"volume_up".to_string()));
}

#[tokio::test]
async fn unknown_commands_and_disconnected_sessions_report_not_sent() {
    let (session, _controller, _events, _storage) = harness();
    assert!(!session.send_command("select", "single_tap").await.unwrap());

    session.connect("tv-1").await.unwrap();
    assert!(!session.send_command("warp", "single_tap").await.unwrap());
}

#[tokio::test]
async fn volume_without_audio_capability_is_not_supported() {
    let (session, controller, _events, _storage) = harness();
    controller.set_capabilities(false, true);
    session.connect("tv-1").await.unwrap();

    let error = session
        .send_command("volume_up", "single_tap")
        .await
        .unwrap_err();
    assert!(matches!(error, DeviceError::NotSupported(_)));
}

#[tokio::test]
async fn keyboard_text_round_trips() {
    let (session, _controller, _events, _storage) = harness();
    session.connect("tv-1").await.unwrap();

    session.set_text("hello there").await.unwrap();
    assert_eq!(session.get_text().await.unwrap().as_deref(), Some("hello there"));

    session.clear_text().await.unwrap();
    assert_eq!(session.get_text().await.unwrap(), None);
}

#[tokio::test]
async fn keyboard_without_capability_is_not_supported() {
    let (session, controller, _events, _storage) = harness();
    controller.set_capabilities(true, false);
    session.connect("tv-1").await.unwrap();

    assert!(matches!(
        session.set_text("x").await,
        Err(DeviceError::NotSupported(_))
    ));
}

#[tokio::test]
async fn text_requires_a_connection() {
    let (session, _controller, _events, _storage) = harness();
    assert!(matches!(
        session.set_text("x").await,
        Err(DeviceError::NotConnected)
    ));
}

#[tokio::test]
async fn pairing_runs_to_credentials() {
    let (session, controller, _events, _storage) = harness();
    controller.set_expected_pin("1234");

    let started = session
        .start_pairing("tv-1", ServiceProtocol::Companion)
        .await
        .unwrap();
    assert!(started.requires_pin);
    assert_eq!(started.protocol, ServiceProtocol::Companion);

    // Only one handshake at a time.
    assert!(matches!(
        session.start_pairing("tv-1", ServiceProtocol::AirPlay).await,
        Err(DeviceError::Pairing(_))
    ));

    assert!(session.finish_pairing("1234").await.unwrap());
    assert!(controller.log().contains(&"pair_close".to_string()));

    // The handshake was consumed.
    assert!(!session.finish_pairing("1234").await.unwrap());
}

#[tokio::test]
async fn wrong_pin_fails_and_consumes_the_handshake() {
    let (session, controller, _events, _storage) = harness();
    controller.set_expected_pin("1234");

    session
        .start_pairing("tv-1", ServiceProtocol::Companion)
        .await
        .unwrap();
    assert!(matches!(
        session.finish_pairing("9999").await,
        Err(DeviceError::Pairing(_))
    ));
    assert!(controller.log().contains(&"pair_close".to_string()));
    assert!(!session.finish_pairing("1234").await.unwrap());
}

#[tokio::test]
async fn scan_reports_stored_pairing_state() {
    let (session, _controller, _events, storage) = harness();
    storage
        .insert(DeviceSettings {
            identifier: "tv-1".to_string(),
            name: Some("Living Room".to_string()),
            credentials: HashMap::from([(ServiceProtocol::Companion, "blob".to_string())]),
        })
        .await;

    let entries = session.scan(Duration::from_secs(1)).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].paired);
    assert_eq!(entries[0].address, "192.168.1.20");
}

#[tokio::test]
async fn forget_device_drops_saved_credentials() {
    let (session, _controller, _events, storage) = harness();
    storage
        .insert(DeviceSettings {
            identifier: "tv-1".to_string(),
            name: Some("Living Room".to_string()),
            credentials: HashMap::from([(ServiceProtocol::AirPlay, "blob".to_string())]),
        })
        .await;

    assert_eq!(session.saved_devices().await.len(), 1);
    assert!(session.forget_device("tv-1").await.unwrap());
    assert!(session.saved_devices().await.is_empty());
    assert!(!session.forget_device("tv-1").await.unwrap());
}

#[tokio::test]
async fn status_reflects_the_live_connection() {
    let (session, controller, _events, _storage) = harness();

    let idle = session.status().await;
    assert!(!idle.connected);
    assert!(idle.device.is_none());

    session.connect("tv-1").await.unwrap();
    controller.set_now_playing(Some(snapshot("Some Film", 5400)));

    let live = session.status().await;
    assert!(live.connected);
    assert_eq!(live.device.as_ref().unwrap().name, "Living Room");
    assert_eq!(
        live.playback.as_ref().unwrap().title.as_deref(),
        Some("Some Film")
    );
}

#[tokio::test]
async fn duplicate_playback_events_are_suppressed() {
    let (session, controller, mut events, _storage) = harness();
    session.connect("tv-1").await.unwrap();
    let connected = events.recv().await.unwrap();
    assert!(matches!(connected, Notification::ConnectionState(_)));
    controller.set_foreground_app(Some(AppInfo {
        name: Some("Player".to_string()),
        identifier: Some("tv.example.player".to_string()),
    }));

    controller.push(PushEvent::Playback(snapshot("Episode 1", 1800)));
    controller.push(PushEvent::Playback(snapshot("Episode 1", 1800)));
    // Fence: arrives after both playback events were pumped.
    controller.push(PushEvent::KeyboardFocus(true));

    let first = events.recv().await.unwrap();
    let Notification::PlaybackUpdate(update) = first else {
        panic!("expected a playback update, got {first:?}");
    };
    assert_eq!(update.title, "Episode 1");

    let fence = events.recv().await.unwrap();
    assert!(matches!(fence, Notification::KeyboardFocus { focused: true }));
}

#[tokio::test]
async fn incomplete_playback_never_surfaces() {
    let (session, controller, mut events, _storage) = harness();
    session.connect("tv-1").await.unwrap();
    let connected = events.recv().await.unwrap();
    assert!(matches!(connected, Notification::ConnectionState(_)));

    // Playing with zero duration means metadata is still loading.
    controller.push(PushEvent::Playback(snapshot("Episode 1", 0)));
    controller.push(PushEvent::KeyboardFocus(true));

    let fence = events.recv().await.unwrap();
    assert!(matches!(fence, Notification::KeyboardFocus { focused: true }));
}
