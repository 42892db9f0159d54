//! End-to-end scenarios: the supervisor driving real `qoler worker` child
//! processes, and clients talking to the worker over HTTP and WebSocket.

use std::time::{Duration, Instant};

use futures_util::StreamExt;
use qoler_protocol::{OperationResult, ServiceError, ServiceState};
use qoler_supervisor::{ProcessLauncher, ServiceSupervisor, SupervisorConfig};
use qoler_transport::AuthGate;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const SECRET: &str = "scenario-secret";

fn worker_launcher() -> ProcessLauncher {
    ProcessLauncher::new(env!("CARGO_BIN_EXE_qoler"))
        .arg("worker")
        .arg("--hostname")
        .arg("127.0.0.1")
}

fn supervisor() -> ServiceSupervisor {
    ServiceSupervisor::new(worker_launcher(), SupervisorConfig::new(SECRET))
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn result_json<T>(outcome: &Result<T, ServiceError>, sup: &ServiceSupervisor) -> Value {
    let state = sup.status().state;
    let result = match outcome {
        Ok(_) => OperationResult::success(&state),
        Err(e) => OperationResult::failure(e, &state),
    };
    serde_json::to_value(result).unwrap()
}

#[tokio::test]
async fn start_from_stopped_then_repeat_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor();
    let port = free_port();

    let first = sup.start(u32::from(port), dir.path().join("db.sqlite")).await;
    assert_eq!(
        result_json(&first, &sup),
        json!({ "success": true, "port": port, "state": "running" })
    );
    let pid = sup.status().pid;
    assert!(pid.is_some());

    let again = sup.start(u32::from(port), dir.path().join("db.sqlite")).await;
    assert_eq!(result_json(&again, &sup), result_json(&first, &sup));
    assert_eq!(sup.status().pid, pid, "no second worker process");

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn privileged_port_is_rejected_without_a_process() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor();

    let outcome = sup.start(80, dir.path().join("db.sqlite")).await;
    let result = result_json(&outcome, &sup);
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "InvalidPort");
    assert_eq!(sup.status().pid, None);
    assert_eq!(sup.status().state, ServiceState::Stopped);
    assert!(!dir.path().join("db.sqlite").exists(), "worker never touched storage");
}

#[tokio::test]
async fn graceful_stop_of_running_worker() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor();
    let port = free_port();
    sup.start(u32::from(port), dir.path().join("db.sqlite")).await.unwrap();

    let began = Instant::now();
    let outcome = sup.stop().await;
    assert_eq!(result_json(&outcome, &sup), json!({ "success": true, "state": "stopped" }));
    assert!(began.elapsed() < Duration::from_secs(5), "acknowledged well inside the budget");
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());

    // Storage was seeded and closed; a fresh start reuses it without error.
    sup.start(u32::from(port), dir.path().join("db.sqlite")).await.unwrap();
    sup.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn wedged_worker_is_killed_after_budget() {
    // Claims to be running, then ignores everything.
    let script = r#"read -r line; echo '{"type":"status","state":"running","port":4555}'; exec sleep 30"#;
    let launcher = ProcessLauncher::new("sh").arg("-c").arg(script);
    let budget = Duration::from_millis(500);
    let sup = ServiceSupervisor::new(
        launcher,
        SupervisorConfig {
            stop_timeout: budget,
            ..SupervisorConfig::new(SECRET)
        },
    );
    sup.start(4555, "unused.sqlite").await.unwrap();
    let pid = sup.status().pid.unwrap();

    let began = Instant::now();
    let outcome = sup.stop().await;
    let elapsed = began.elapsed();

    assert!(matches!(outcome, Err(ServiceError::EscalatedShutdown { budget_ms: 500 })));
    assert!(elapsed >= budget && elapsed < budget + Duration::from_secs(1), "{elapsed:?}");
    let result = result_json(&outcome, &sup);
    assert_eq!(result["success"], false);
    assert_eq!(result["error"], "EscalatedShutdown");
    assert_eq!(result["state"], "stopped");

    #[cfg(target_os = "linux")]
    {
        let proc_dir = std::path::PathBuf::from(format!("/proc/{pid}"));
        let deadline = Instant::now() + Duration::from_secs(3);
        while proc_dir.exists() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!proc_dir.exists(), "worker {pid} still alive after escalation");
    }
    let _ = pid;
}

async fn next_json(ws: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn next_of(ws: &mut Client, kind: &str) -> Value {
    loop {
        let envelope = next_json(ws).await;
        if envelope["type"] == kind {
            return envelope;
        }
    }
}

async fn login(http: &reqwest::Client, base: &str, id: i64, username: &str) -> String {
    let status = http
        .post(format!("{base}/register"))
        .json(&json!({ "id": id, "username": username, "password": "pw" }))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::CREATED);
    let body: Value = http
        .post(format!("{base}/login"))
        .json(&json!({ "id": id, "password": "pw" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn message_reaches_both_clients_and_expired_token_gets_nothing() {
    let dir = TempDir::new().unwrap();
    let sup = supervisor();
    let port = free_port();
    sup.start(u32::from(port), dir.path().join("db.sqlite")).await.unwrap();

    let base = format!("http://127.0.0.1:{port}");
    let http = reqwest::Client::new();
    let alice = login(&http, &base, 1, "alice").await;
    let bob = login(&http, &base, 2, "bob").await;

    let ws_url = |token: &str| format!("ws://127.0.0.1:{port}/ws?token={token}");
    let (mut alice_ws, _) = connect_async(ws_url(&alice)).await.unwrap();
    next_of(&mut alice_ws, "user_list_update").await;
    let (mut bob_ws, _) = connect_async(ws_url(&bob)).await.unwrap();
    next_of(&mut bob_ws, "user_list_update").await;

    let expired = AuthGate::new(SECRET)
        .with_token_ttl(chrono::Duration::minutes(-5))
        .issue(3, "carol")
        .unwrap();
    let (mut carol_ws, _) = connect_async(ws_url(&expired)).await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), carol_ws.next())
        .await
        .expect("expired client was not closed")
        .expect("stream ended")
        .expect("websocket error");
    match first {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expired client received {other:?} before being closed"),
    }

    let channels: Value = http
        .get(format!("{base}/channels"))
        .bearer_auth(&alice)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let channel_id = channels[0]["id"].as_i64().unwrap();
    let status = http
        .post(format!("{base}/messages"))
        .bearer_auth(&alice)
        .json(&json!({ "channelId": channel_id, "text": "hello both" }))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::CREATED);

    let at_alice = next_of(&mut alice_ws, "new_message").await;
    let at_bob = next_of(&mut bob_ws, "new_message").await;
    assert_eq!(at_alice, at_bob);
    assert_eq!(at_alice["data"]["text"], "hello both");

    let online: Value = http
        .get(format!("{base}/users/online"))
        .bearer_auth(&bob)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(online, json!(["alice", "bob"]));

    sup.stop().await.unwrap();
    match tokio::time::timeout(Duration::from_secs(5), alice_ws.next()).await {
        Ok(Some(Ok(Message::Close(Some(frame))))) => assert_eq!(u16::from(frame.code), 1001),
        other => panic!("expected going-away close, got {other:?}"),
    }
}
