//! Tests the control socket against a daemon whose bus is unreachable

use smol::io::{AsyncWriteExt, BufReader};
use std::path::{Path, PathBuf};
use std::time::Duration;

use spotbridged::bus::{BusClient, DEFAULT_PREFIX, DbusSend};
use spotbridged::control::{ControlError, ControlServer};
use spotbridged::machine::{MachineHandle, RetryPolicy, StateMachine};
use spotbridged::notification::Notification;

mod common;

const LIMIT: Duration = Duration::from_secs(5);

struct Daemon {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    handle: MachineHandle<DbusSend>,
    server: smol::Task<()>,
}

fn spawn_daemon() -> Daemon {
    common::setup();
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("spotbridge.sock");
    let transport = DbusSend::new(
        "/nonexistent/dbus-send",
        None,
        None,
        Duration::from_millis(500),
    );
    let (machine, handle) = StateMachine::new(
        BusClient::new(transport, DEFAULT_PREFIX),
        0.5,
        RetryPolicy::default(),
    );
    smol::spawn(machine.run()).detach();
    let server = ControlServer::bind(&socket, handle.clone()).unwrap();
    let server = smol::spawn(async move { server.serve().await });
    Daemon {
        _dir: dir,
        socket,
        handle,
        server,
    }
}

fn dispatch(handle: &MachineHandle<DbusSend>, payload: &str) {
    handle.dispatch(Notification::decode(payload.as_bytes()).unwrap());
}

async fn ask(path: &Path, command: &str) -> serde_json::Value {
    common::within(LIMIT, common::request(path, command)).await
}

#[test]
fn reporting_status() {
    let daemon = spawn_daemon();
    smol::block_on(async {
        let status = ask(&daemon.socket, "status").await;
        assert_eq!(status["connected"], false);
        assert_eq!(status["playback_state"], "stopped");
        assert_eq!(status["volume"], 0.5);
        assert!(status["track"].is_null());

        dispatch(
            &daemon.handle,
            r#"{"event_kind":"session_connected","user_name":"alice","connection_id":"c1"}"#,
        );
        dispatch(
            &daemon.handle,
            r#"{"event_kind":"track_changed","track_id":"spotify:track:1","name":"Song","artists":["A","B"],"album":"Album","duration_ms":200000}"#,
        );
        dispatch(&daemon.handle, r#"{"event_kind":"playing","position_ms":1500}"#);

        let status = ask(&daemon.socket, "status").await;
        assert_eq!(status["connected"], true);
        assert_eq!(status["session_user"], "alice");
        assert_eq!(status["playback_state"], "playing");
        assert_eq!(status["position_ms"], 1500);
        assert_eq!(status["track"]["name"], "Song");
        assert_eq!(status["track"]["artists"], serde_json::json!(["A", "B"]));
    });
}

#[test]
fn commands_fail_without_bus() {
    let daemon = spawn_daemon();
    smol::block_on(async {
        for command in ["toggle", "next", "prev", "volume 0.3"] {
            let reply = ask(&daemon.socket, command).await;
            assert_eq!(reply["ok"], false, "{command}");
            assert!(reply["error"].is_string(), "{command}");
        }
        // Reading the volume falls back to the last known value
        let reply = ask(&daemon.socket, "volume").await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["volume"], 0.5);
        // A failed set leaves the state untouched
        let status = ask(&daemon.socket, "status").await;
        assert_eq!(status["volume"], 0.5);
    });
}

#[test]
fn rejecting_bad_commands() {
    let daemon = spawn_daemon();
    smol::block_on(async {
        let reply = ask(&daemon.socket, "rewind").await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"], "Unrecognised command");
        let reply = ask(&daemon.socket, "volume loud").await;
        assert_eq!(reply["error"], "Invalid argument");
        let reply = ask(&daemon.socket, "volume nan").await;
        assert_eq!(reply["error"], "Invalid argument");
        // The state keeps a real volume
        let status = ask(&daemon.socket, "status").await;
        assert_eq!(status["volume"], 0.5);
    });
}

#[test]
fn watching() {
    let daemon = spawn_daemon();
    smol::block_on(async {
        let mut conn = smol::net::unix::UnixStream::connect(&daemon.socket)
            .await
            .unwrap();
        conn.write_all(b"watch\n").await.unwrap();
        let mut reader = BufReader::new(conn);

        // The current state comes first
        let state = common::within(LIMIT, common::read_json(&mut reader)).await;
        assert_eq!(state["playback_state"], "stopped");

        dispatch(&daemon.handle, r#"{"event_kind":"playing"}"#);
        dispatch(&daemon.handle, r#"{"event_kind":"paused","position_ms":42}"#);
        let state = common::within(LIMIT, common::read_json(&mut reader)).await;
        assert_eq!(state["playback_state"], "playing");
        let state = common::within(LIMIT, common::read_json(&mut reader)).await;
        assert_eq!(state["playback_state"], "paused");
        assert_eq!(state["position_ms"], 42);
    });
}

#[test]
fn refusing_live_socket() {
    let daemon = spawn_daemon();
    let (_machine, handle) = StateMachine::new(
        BusClient::new(
            DbusSend::new("/nonexistent/dbus-send", None, None, Duration::from_millis(500)),
            DEFAULT_PREFIX,
        ),
        0.5,
        RetryPolicy::default(),
    );
    assert!(matches!(
        ControlServer::bind(&daemon.socket, handle),
        Err(ControlError::InitFailed(..))
    ));

    // The first daemon keeps serving
    smol::block_on(async {
        let status = ask(&daemon.socket, "status").await;
        assert_eq!(status["volume"], 0.5);
    });
}

#[test]
fn quitting() {
    let daemon = spawn_daemon();
    smol::block_on(async {
        let reply = ask(&daemon.socket, "quit").await;
        assert_eq!(reply["ok"], true);
        common::within(LIMIT, daemon.server).await;
    });
    assert!(!daemon.socket.exists());
}
