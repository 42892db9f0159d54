//! Control loop tests over an in-memory duplex pipe standing in for the
//! worker's stdin/stdout.

use std::time::{Duration, Instant};

use qoler_protocol::{ControlMessage, LogLevel, WorkerState};
use qoler_server::{ControlOptions, EXIT_FAULT, EXIT_OK, WorkerOptions, control};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct Host {
    to_worker: Option<DuplexStream>,
    from_worker: Lines<BufReader<DuplexStream>>,
    worker: JoinHandle<i32>,
    faults: mpsc::UnboundedSender<String>,
}

fn options() -> ControlOptions {
    ControlOptions {
        worker: WorkerOptions {
            hostname: "127.0.0.1".into(),
            http_close_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        ..Default::default()
    }
}

impl Host {
    fn spawn() -> Self {
        Self::spawn_with(options())
    }

    fn spawn_with(options: ControlOptions) -> Self {
        let (host_in, worker_out) = tokio::io::duplex(64 * 1024);
        let (worker_in, host_out) = tokio::io::duplex(64 * 1024);
        let (faults, external) = mpsc::unbounded_channel();
        let worker = tokio::spawn(control::run_with_faults(worker_in, worker_out, options, external));
        Self {
            to_worker: Some(host_out),
            from_worker: BufReader::new(host_in).lines(),
            worker,
            faults,
        }
    }

    /// Wait for the worker to exit on its own, keeping its input open.
    async fn wait_exit(mut self, within: Duration) -> (i32, Vec<ControlMessage>) {
        let code = tokio::time::timeout(within, &mut self.worker)
            .await
            .expect("worker did not exit in time")
            .unwrap();
        let mut rest = Vec::new();
        while let Ok(Some(line)) = self.from_worker.next_line().await {
            rest.push(ControlMessage::decode(&line).unwrap());
        }
        (code, rest)
    }

    async fn send_raw(&mut self, line: &str) {
        let pipe = self.to_worker.as_mut().unwrap();
        pipe.write_all(format!("{line}\n").as_bytes()).await.unwrap();
    }

    async fn send(&mut self, msg: ControlMessage) {
        self.send_raw(&msg.encode().unwrap()).await;
    }

    async fn recv(&mut self) -> ControlMessage {
        let line = tokio::time::timeout(Duration::from_secs(5), self.from_worker.next_line())
            .await
            .expect("timed out waiting for worker")
            .unwrap()
            .expect("worker closed its output");
        ControlMessage::decode(&line).unwrap()
    }

    /// Skip log lines until a status with `state` arrives.
    async fn recv_status(&mut self, state: WorkerState) -> ControlMessage {
        loop {
            let msg = self.recv().await;
            if matches!(&msg, ControlMessage::Status { state: s, .. } if *s == state) {
                return msg;
            }
        }
    }

    async fn close_and_wait(mut self) -> (i32, Vec<ControlMessage>) {
        self.to_worker.take();
        let code = tokio::time::timeout(Duration::from_secs(10), self.worker)
            .await
            .expect("worker did not exit")
            .unwrap();
        let mut rest = Vec::new();
        while let Ok(Some(line)) = self.from_worker.next_line().await {
            rest.push(ControlMessage::decode(&line).unwrap());
        }
        (code, rest)
    }
}

fn start(dir: &TempDir) -> ControlMessage {
    ControlMessage::Start {
        port: 0,
        storage_path: dir.path().join("chat.db"),
        secret: "control-test".into(),
    }
}

#[tokio::test]
async fn start_then_stop_round_trip() {
    let dir = TempDir::new().unwrap();
    let mut host = Host::spawn();

    host.send(start(&dir)).await;
    match host.recv_status(WorkerState::Running).await {
        ControlMessage::Status { port: Some(port), .. } => assert_ne!(port, 0),
        other => panic!("running status without port: {other:?}"),
    }

    host.send(ControlMessage::Stop).await;
    host.recv_status(WorkerState::Stopped).await;

    let (code, _) = host.close_and_wait().await;
    assert_eq!(code, EXIT_OK);
}

#[tokio::test]
async fn malformed_line_is_reported_and_loop_continues() {
    let mut host = Host::spawn();

    host.send_raw("{not json").await;
    match host.recv().await {
        ControlMessage::Log { level, .. } => assert_eq!(level, LogLevel::Error),
        other => panic!("expected error log, got {other:?}"),
    }

    host.send(ControlMessage::Stop).await;
    host.recv_status(WorkerState::Stopped).await;
    host.close_and_wait().await;
}

#[tokio::test]
async fn host_side_messages_are_protocol_violations() {
    let mut host = Host::spawn();
    host.send(ControlMessage::status(WorkerState::Running)).await;
    match host.recv().await {
        ControlMessage::Log { level, message } => {
            assert_eq!(level, LogLevel::Error);
            assert!(message.contains("status"), "{message}");
        }
        other => panic!("expected error log, got {other:?}"),
    }
    host.close_and_wait().await;
}

#[tokio::test]
async fn eof_while_running_stops_in_order_and_exits_zero() {
    let dir = TempDir::new().unwrap();
    let mut host = Host::spawn();
    host.send(start(&dir)).await;
    let port = match host.recv_status(WorkerState::Running).await {
        ControlMessage::Status { port: Some(port), .. } => port,
        other => panic!("{other:?}"),
    };

    let (code, rest) = host.close_and_wait().await;
    assert_eq!(code, EXIT_OK);
    let states: Vec<WorkerState> = rest
        .iter()
        .filter_map(|m| match m {
            ControlMessage::Status { state, .. } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![WorkerState::Stopping, WorkerState::Stopped]);
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

fn states(messages: &[ControlMessage]) -> Vec<WorkerState> {
    messages
        .iter()
        .filter_map(|m| match m {
            ControlMessage::Status { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn internal_fault_stops_in_order_and_exits_with_fault_code() {
    let dir = TempDir::new().unwrap();
    let mut host = Host::spawn();
    host.send(start(&dir)).await;
    let port = match host.recv_status(WorkerState::Running).await {
        ControlMessage::Status { port: Some(port), .. } => port,
        other => panic!("{other:?}"),
    };

    host.faults.send("request handler wedged".into()).unwrap();
    let (code, rest) = host.wait_exit(Duration::from_secs(5)).await;

    assert_eq!(code, EXIT_FAULT);
    assert!(
        rest.iter().any(|m| matches!(
            m,
            ControlMessage::Log { level: LogLevel::Error, message } if message.contains("request handler wedged")
        )),
        "{rest:?}"
    );
    assert_eq!(states(&rest), vec![WorkerState::Stopping, WorkerState::Stopped]);
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
}

#[tokio::test]
async fn fault_exit_does_not_wait_for_a_stalled_stop() {
    let dir = TempDir::new().unwrap();
    let budget = Duration::from_millis(300);
    let base = options();
    let mut host = Host::spawn_with(ControlOptions {
        worker: WorkerOptions {
            // Long enough that the HTTP drain below outlasts the fault budget.
            http_close_timeout: Duration::from_secs(10),
            ..base.worker
        },
        fault_shutdown_budget: budget,
        ..base
    });
    host.send(start(&dir)).await;
    let port = match host.recv_status(WorkerState::Running).await {
        ControlMessage::Status { port: Some(port), .. } => port,
        other => panic!("{other:?}"),
    };

    // A request whose body never finishes keeps the graceful drain waiting.
    let mut stalled = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stalled
        .write_all(
            b"POST /register HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\n\
              Content-Length: 100\r\n\r\n{\"id\":",
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let began = Instant::now();
    host.faults.send("listener gone".into()).unwrap();
    let (code, rest) = host.wait_exit(Duration::from_secs(5)).await;

    assert_eq!(code, EXIT_FAULT);
    assert!(began.elapsed() >= budget, "{:?}", began.elapsed());
    assert!(began.elapsed() < Duration::from_secs(3), "{:?}", began.elapsed());
    let states = states(&rest);
    assert!(states.contains(&WorkerState::Stopping), "{rest:?}");
    assert!(!states.contains(&WorkerState::Stopped), "stop was cut off: {rest:?}");
    drop(stalled);
}
