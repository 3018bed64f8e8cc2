mod common;

use common::{count_lines, dead_address, eventually, log_contains, spawn_fake_obs, ObsSetup, RecordingNotifier};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tipswitch_core::modules::log::MemoryLog;
use tipswitch_core::{ConnectError, ConnectionState, ControlPlaneClient, RequestError};

fn client() -> (ControlPlaneClient, Arc<MemoryLog>, Arc<RecordingNotifier>) {
    let log = Arc::new(MemoryLog::new());
    let notifier = Arc::new(RecordingNotifier::default());
    (
        ControlPlaneClient::new(log.clone(), notifier.clone()),
        log,
        notifier,
    )
}

#[tokio::test]
async fn connect_authenticates_and_discovers_targets() {
    let obs = spawn_fake_obs(ObsSetup::default()).await;
    let (client, log, notifier) = client();

    client.connect(&obs.address, "hunter2").await.unwrap();

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(
        client.scene_targets(),
        vec!["Gameplay".to_string(), "Thanks".to_string()]
    );
    assert_eq!(client.text_targets(), vec!["Title".to_string()]);
    assert_eq!(
        obs.request_types(),
        vec![
            "GetSceneList",
            "GetInputKindList",
            "GetInputList",
            "GetInputList"
        ]
    );
    assert!(log_contains(&log, "Connecting to OBS..."));
    assert!(log_contains(&log, "Connected to OBS. 2 scene(s), 1 text source(s)."));
    assert_eq!(notifier.titles(), vec!["Connected to OBS".to_string()]);
}

#[tokio::test]
async fn connect_without_password_when_server_needs_none() {
    let obs = spawn_fake_obs(ObsSetup {
        password: None,
        ..ObsSetup::default()
    })
    .await;
    let (client, _log, _notifier) = client();

    client.connect(&obs.address, "").await.unwrap();
    assert!(client.is_connected());
}

#[tokio::test]
async fn wrong_password_is_an_auth_error() {
    let obs = spawn_fake_obs(ObsSetup::default()).await;
    let (client, log, notifier) = client();

    let err = client.connect(&obs.address, "wrong").await.unwrap_err();

    assert!(matches!(err, ConnectError::Auth(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(log_contains(&log, "Failed to connect to OBS"));
    assert_eq!(notifier.titles(), vec!["Failed to connect to OBS".to_string()]);
    assert!(obs.request_types().is_empty());
}

#[tokio::test]
async fn unreachable_and_malformed_addresses() {
    let (client, _log, _notifier) = client();

    let err = client.connect(&dead_address().await, "").await.unwrap_err();
    assert!(matches!(err, ConnectError::Transport(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let err = client.connect("http://127.0.0.1:4455", "").await.unwrap_err();
    assert!(matches!(err, ConnectError::InvalidAddress(_)), "got {err:?}");

    let err = client.connect("not a url", "").await.unwrap_err();
    assert!(matches!(err, ConnectError::InvalidAddress(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn commands_fail_fast_while_disconnected() {
    let obs = spawn_fake_obs(ObsSetup::default()).await;
    let (client, _log, _notifier) = client();

    assert_eq!(client.set_scene("Thanks").await, Err(RequestError::NotConnected));
    assert_eq!(client.current_scene().await, Err(RequestError::NotConnected));
    assert_eq!(
        client.set_text_content("Title", "hi").await,
        Err(RequestError::NotConnected)
    );
    assert!(matches!(
        client.refresh_targets().await,
        Err(RequestError::NotConnected)
    ));

    client.connect(&obs.address, "hunter2").await.unwrap();
    client.disconnect();
    let before = obs.request_types().len();
    assert_eq!(client.set_scene("Thanks").await, Err(RequestError::NotConnected));
    assert_eq!(obs.request_types().len(), before);
}

#[tokio::test]
async fn scene_and_text_commands_round_trip() {
    let obs = spawn_fake_obs(ObsSetup::default()).await;
    let (client, _log, _notifier) = client();
    client.connect(&obs.address, "hunter2").await.unwrap();

    assert_eq!(client.current_scene().await.unwrap(), "Gameplay");
    client.set_scene("Thanks").await.unwrap();
    assert_eq!(obs.current_scene(), "Thanks");
    assert_eq!(client.current_scene().await.unwrap(), "Thanks");

    let err = client.set_scene("Nope").await.unwrap_err();
    assert!(matches!(err, RequestError::Command { code: 600, .. }), "got {err:?}");
    assert_eq!(obs.current_scene(), "Thanks");

    client.set_text_content("Title", "Budi: makasih").await.unwrap();
    let last = obs.requests.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.0, "SetInputSettings");
    assert_eq!(
        last.1,
        Some(json!({ "inputName": "Title", "inputSettings": { "text": "Budi: makasih" } }))
    );

    let snapshot = client.refresh_targets().await.unwrap();
    assert_eq!(snapshot.text_inputs, vec!["Title".to_string()]);
}

#[tokio::test]
async fn connect_is_idempotent_and_disconnect_logs_once() {
    let obs = spawn_fake_obs(ObsSetup::default()).await;
    let (client, log, _notifier) = client();

    client.connect(&obs.address, "hunter2").await.unwrap();
    client.connect(&obs.address, "hunter2").await.unwrap();
    assert_eq!(obs.connections.load(Ordering::SeqCst), 1);

    client.disconnect();
    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(count_lines(&log, "Disconnected from OBS."), 1);
}

#[tokio::test]
async fn server_drop_moves_client_to_disconnected() {
    let obs = spawn_fake_obs(ObsSetup::default()).await;
    let (client, log, notifier) = client();
    client.connect(&obs.address, "hunter2").await.unwrap();
    let mut states = client.watch_state();

    obs.kick();

    eventually("client notices the drop", || {
        client.state() == ConnectionState::Disconnected
    })
    .await;
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);
    assert!(log_contains(&log, "Lost connection to OBS"));
    assert!(notifier.titles().contains(&"Disconnected from OBS".to_string()));
    assert_eq!(client.set_scene("Thanks").await, Err(RequestError::NotConnected));

    // Manual reconnect works; nothing reconnects on its own.
    assert_eq!(obs.connections.load(Ordering::SeqCst), 1);
    client.connect(&obs.address, "hunter2").await.unwrap();
    assert_eq!(obs.connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn disconnect_during_discovery_cancels_the_connect() {
    let obs = spawn_fake_obs(ObsSetup {
        response_delay: Duration::from_millis(500),
        ..ObsSetup::default()
    })
    .await;
    let log = Arc::new(MemoryLog::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let client = Arc::new(ControlPlaneClient::new(log.clone(), notifier.clone()));

    let connecting = {
        let client = Arc::clone(&client);
        let address = obs.address.clone();
        tokio::spawn(async move { client.connect(&address, "hunter2").await })
    };
    eventually("discovery starts", || !obs.request_types().is_empty()).await;
    assert_eq!(client.state(), ConnectionState::Connecting);

    client.disconnect();

    assert_eq!(connecting.await.unwrap(), Err(ConnectError::Cancelled));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(log_contains(&log, "OBS connection aborted."));
    assert!(!log_contains(&log, "Failed to connect to OBS"));
    assert!(notifier.titles().is_empty());
}

#[tokio::test]
async fn timed_out_requests_do_not_linger() {
    let obs = spawn_fake_obs(ObsSetup {
        silent: vec!["GetCurrentProgramScene".to_string()],
        ..ObsSetup::default()
    })
    .await;
    let log = Arc::new(MemoryLog::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let client = ControlPlaneClient::with_request_timeout(
        log.clone(),
        notifier.clone(),
        Duration::from_millis(200),
    );
    client.connect(&obs.address, "hunter2").await.unwrap();
    assert_eq!(client.in_flight_requests(), 0);

    assert_eq!(client.current_scene().await, Err(RequestError::Timeout));
    assert_eq!(client.current_scene().await, Err(RequestError::Timeout));
    assert!(client.is_connected());

    client.set_scene("Thanks").await.unwrap();
    assert_eq!(client.in_flight_requests(), 0);
    assert_eq!(obs.current_scene(), "Thanks");
}

#[tokio::test]
async fn refresh_replaces_the_cached_targets() {
    let obs = spawn_fake_obs(ObsSetup::default()).await;
    let (client, _log, _notifier) = client();
    client.connect(&obs.address, "hunter2").await.unwrap();

    let refreshed = client.refresh_targets().await.unwrap();
    assert_eq!(refreshed.scenes, client.scene_targets());
    assert_eq!(client.targets().text_inputs, vec!["Title".to_string()]);
}
