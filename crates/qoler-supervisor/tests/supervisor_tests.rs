//! ServiceSupervisor against scripted in-memory workers.
//!
//! Each fake worker speaks the control protocol over duplex pipes and follows
//! a fixed script, so timeouts and failure paths can be driven exactly.
//! Budget tests run on a paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qoler_protocol::{ControlMessage, OperationResult, ServiceError, ServiceState, WorkerFault, WorkerState};
use qoler_supervisor::{
    ControlChannel, KillSwitch, LaunchedWorker, ServiceSupervisor, SupervisorConfig, SupervisorEvent,
    WorkerExit, WorkerLauncher,
};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Script {
    /// Starts and stops as asked.
    Cooperative,
    /// Starts, then never answers `stop`.
    IgnoreStop,
    /// Reports a bind failure.
    FailBind,
    /// Exits with the code instead of starting.
    ExitOnStart(i32),
    /// Never reports anything after `starting`.
    Silent,
}

#[derive(Clone)]
struct FakeLauncher {
    script: Script,
    launches: Arc<AtomicUsize>,
    crash_triggers: Arc<Mutex<Vec<oneshot::Sender<i32>>>>,
}

impl FakeLauncher {
    fn new(script: Script) -> Self {
        Self {
            script,
            launches: Arc::new(AtomicUsize::new(0)),
            crash_triggers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Make the most recently launched worker exit with `code`.
    fn crash_latest(&self, code: i32) {
        let trigger = self.crash_triggers.lock().unwrap().pop().expect("no worker launched");
        trigger.send(code).unwrap();
    }
}

impl WorkerLauncher for FakeLauncher {
    fn launch(&self) -> Result<LaunchedWorker, ServiceError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (host_read, worker_write) = tokio::io::duplex(4096);
        let (worker_read, host_write) = tokio::io::duplex(4096);
        let (crash_tx, crash_rx) = oneshot::channel();
        self.crash_triggers.lock().unwrap().push(crash_tx);

        let task = tokio::spawn(fake_worker(self.script, worker_read, worker_write, crash_rx));
        let (channel, notifier) = ControlChannel::link(host_read, host_write);
        let (kill, mut kill_rx) = KillSwitch::new();
        tokio::spawn(async move {
            let mut task: JoinHandle<i32> = task;
            let exit = tokio::select! {
                code = &mut task => WorkerExit::with_code(code.unwrap_or(101)),
                Ok(()) = &mut kill_rx => {
                    task.abort();
                    WorkerExit::killed()
                }
            };
            notifier.notify(exit).await;
        });
        Ok(LaunchedWorker { channel, kill, pid: None })
    }
}

async fn reply(out: &mut DuplexStream, message: ControlMessage) {
    let line = format!("{}\n", message.encode().unwrap());
    let _ = out.write_all(line.as_bytes()).await;
}

async fn fake_worker(script: Script, input: DuplexStream, mut out: DuplexStream, mut crash: oneshot::Receiver<i32>) -> i32 {
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            Ok(code) = &mut crash => return code,
        };
        let Ok(Some(line)) = line else {
            return 0;
        };
        match ControlMessage::decode(&line) {
            Ok(ControlMessage::Start { port, .. }) => {
                reply(&mut out, ControlMessage::status(WorkerState::Starting)).await;
                match script {
                    Script::FailBind => {
                        reply(&mut out, ControlMessage::failed(WorkerFault::bind("address in use"))).await;
                    }
                    Script::ExitOnStart(code) => return code,
                    Script::Silent => {}
                    Script::Cooperative | Script::IgnoreStop => {
                        reply(&mut out, ControlMessage::log(qoler_protocol::LogLevel::Info, "listening")).await;
                        reply(&mut out, ControlMessage::running(port)).await;
                    }
                }
            }
            Ok(ControlMessage::Stop) if script == Script::IgnoreStop => {}
            Ok(ControlMessage::Stop) => {
                reply(&mut out, ControlMessage::status(WorkerState::Stopping)).await;
                reply(&mut out, ControlMessage::status(WorkerState::Stopped)).await;
            }
            _ => {}
        }
    }
}

fn config() -> SupervisorConfig {
    SupervisorConfig {
        settle_delay: Duration::from_millis(10),
        ..SupervisorConfig::new("test-secret")
    }
}

fn supervisor(script: Script) -> (ServiceSupervisor, FakeLauncher) {
    let launcher = FakeLauncher::new(script);
    (ServiceSupervisor::new(launcher.clone(), config()), launcher)
}

async fn wait_event(
    events: &mut broadcast::Receiver<SupervisorEvent>,
    wanted: impl Fn(&SupervisorEvent) -> bool,
) -> SupervisorEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for supervisor event")
}

#[tokio::test]
async fn start_from_stopped_reports_running() {
    let (sup, launcher) = supervisor(Script::Cooperative);

    let report = sup.start(3001, "db.sqlite").await.unwrap();
    assert_eq!(report.port, 3001);
    assert_eq!(report.state, ServiceState::Running { port: 3001 });
    assert_eq!(
        serde_json::to_value(OperationResult::success(&report.state)).unwrap(),
        json!({ "success": true, "port": 3001, "state": "running" })
    );
    assert_eq!(launcher.launches(), 1);

    sup.stop().await.unwrap();
}

#[tokio::test]
async fn second_start_on_same_port_does_not_relaunch() {
    let (sup, launcher) = supervisor(Script::Cooperative);
    let first = sup.start(3001, "db.sqlite").await.unwrap();
    let second = sup.start(3001, "db.sqlite").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(launcher.launches(), 1);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn out_of_range_ports_never_launch() {
    let (sup, launcher) = supervisor(Script::Cooperative);
    for port in [0, 80, 1023, 65536, 70000] {
        let err = sup.start(port, "db.sqlite").await.unwrap_err();
        assert_eq!(err, ServiceError::InvalidPort(port));
        assert_eq!(
            serde_json::to_value(OperationResult::failure(&err, &sup.status().state)).unwrap()["error"],
            "InvalidPort"
        );
    }
    assert_eq!(launcher.launches(), 0);
    let status = sup.status();
    assert_eq!(status.state, ServiceState::Stopped);
    assert_eq!(status.port, None, "rejected config is not recorded");
}

#[tokio::test]
async fn stop_when_stopped_is_immediate() {
    let (sup, launcher) = supervisor(Script::Cooperative);
    let report = sup.stop().await.unwrap();
    assert_eq!(report.state, ServiceState::Stopped);
    assert_eq!(launcher.launches(), 0);
}

#[tokio::test]
async fn acknowledged_stop_succeeds() {
    let (sup, _launcher) = supervisor(Script::Cooperative);
    sup.start(3001, "db.sqlite").await.unwrap();

    let report = sup.stop().await.unwrap();
    assert_eq!(report.state, ServiceState::Stopped);
    assert_eq!(
        serde_json::to_value(OperationResult::success(&report.state)).unwrap(),
        json!({ "success": true, "state": "stopped" })
    );
    assert_eq!(sup.status().state, ServiceState::Stopped);
    assert_eq!(sup.status().pid, None);

    // Stopping again sends nothing and still succeeds.
    assert_eq!(sup.stop().await.unwrap().state, ServiceState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn unresponsive_worker_is_killed_when_budget_expires() {
    let (sup, _launcher) = supervisor(Script::IgnoreStop);
    let mut events = sup.subscribe();
    sup.start(3001, "db.sqlite").await.unwrap();

    let budget = Duration::from_secs(5);
    let began = tokio::time::Instant::now();
    let err = sup.stop().await.unwrap_err();
    let elapsed = began.elapsed();

    assert_eq!(err, ServiceError::EscalatedShutdown { budget_ms: 5000 });
    assert!(elapsed >= budget, "stopped early after {elapsed:?}");
    assert!(elapsed < budget + Duration::from_millis(100), "escalation took {elapsed:?}");
    assert_eq!(sup.status().state, ServiceState::Stopped);
    assert_eq!(
        serde_json::to_value(OperationResult::failure(&err, &sup.status().state)).unwrap(),
        json!({
            "success": false,
            "error": "EscalatedShutdown",
            "state": "stopped",
            "message": "worker did not stop within 5000 ms and was killed",
        })
    );
    wait_event(&mut events, |e| *e == SupervisorEvent::StateChanged(ServiceState::Stopped)).await;
}

#[tokio::test(start_paused = true)]
async fn custom_stop_budget_is_honoured() {
    let launcher = FakeLauncher::new(Script::IgnoreStop);
    let sup = ServiceSupervisor::new(
        launcher,
        SupervisorConfig {
            stop_timeout: Duration::from_millis(750),
            ..config()
        },
    );
    sup.start(3001, "db.sqlite").await.unwrap();

    let began = tokio::time::Instant::now();
    assert_eq!(
        sup.stop().await.unwrap_err(),
        ServiceError::EscalatedShutdown { budget_ms: 750 }
    );
    let elapsed = began.elapsed();
    assert!(elapsed >= Duration::from_millis(750) && elapsed < Duration::from_millis(850));
}

#[tokio::test]
async fn bind_failure_leaves_failed_and_retry_relaunches() {
    let (sup, launcher) = supervisor(Script::FailBind);

    let err = sup.start(3001, "db.sqlite").await.unwrap_err();
    assert_eq!(err, ServiceError::BindFailure("address in use".into()));
    match sup.status().state {
        ServiceState::Failed { reason } => assert!(reason.contains("address in use"), "{reason}"),
        other => panic!("expected failed, got {other:?}"),
    }

    sup.start(3001, "db.sqlite").await.unwrap_err();
    assert_eq!(launcher.launches(), 2);

    // A failed slot has no worker; stop just normalizes it.
    assert_eq!(sup.stop().await.unwrap().state, ServiceState::Stopped);
}

#[tokio::test]
async fn exit_during_start_is_unexpected() {
    let (sup, _launcher) = supervisor(Script::ExitOnStart(70));
    let err = sup.start(3001, "db.sqlite").await.unwrap_err();
    assert_eq!(err, ServiceError::UnexpectedExit("exit code 70".into()));
    assert!(matches!(sup.status().state, ServiceState::Failed { .. }));
}

#[tokio::test(start_paused = true)]
async fn silent_worker_times_out_on_start() {
    let (sup, _launcher) = supervisor(Script::Silent);
    let err = sup.start(3001, "db.sqlite").await.unwrap_err();
    assert_eq!(err, ServiceError::StartTimeout { budget_ms: 30_000 });
    assert!(matches!(sup.status().state, ServiceState::Failed { .. }));
}

#[tokio::test(start_paused = true)]
async fn stop_during_start_is_busy() {
    let (sup, _launcher) = supervisor(Script::Silent);
    let starting = {
        let sup = sup.clone();
        tokio::spawn(async move { sup.start(3001, "db.sqlite").await })
    };
    while sup.status().state != ServiceState::Starting {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    assert_eq!(sup.stop().await.unwrap_err(), ServiceError::Busy);
    assert_eq!(sup.status().state, ServiceState::Starting, "start is not interrupted");

    let outcome = starting.await.unwrap();
    assert!(matches!(outcome, Err(ServiceError::StartTimeout { .. })));
}

#[tokio::test]
async fn concurrent_starts_queue_instead_of_racing() {
    let (sup, launcher) = supervisor(Script::Cooperative);
    let a = tokio::spawn({
        let sup = sup.clone();
        async move { sup.start(3001, "db.sqlite").await }
    });
    let b = tokio::spawn({
        let sup = sup.clone();
        async move { sup.start(3001, "db.sqlite").await }
    });

    assert_eq!(a.await.unwrap().unwrap().port, 3001);
    assert_eq!(b.await.unwrap().unwrap().port, 3001);
    assert_eq!(launcher.launches(), 1);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn port_change_stops_then_starts_a_new_worker() {
    let (sup, launcher) = supervisor(Script::Cooperative);
    sup.start(3001, "db.sqlite").await.unwrap();
    let mut events = sup.subscribe();

    let report = sup.start(3002, "db.sqlite").await.unwrap();
    assert_eq!(report.state, ServiceState::Running { port: 3002 });
    assert_eq!(launcher.launches(), 2);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SupervisorEvent::StateChanged(state) = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            ServiceState::Stopping,
            ServiceState::Stopped,
            ServiceState::Starting,
            ServiceState::Running { port: 3002 },
        ]
    );
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn crash_while_running_is_a_fault() {
    let (sup, launcher) = supervisor(Script::Cooperative);
    let mut events = sup.subscribe();
    sup.start(3001, "db.sqlite").await.unwrap();

    launcher.crash_latest(70);

    let fault = wait_event(&mut events, |e| matches!(e, SupervisorEvent::Fault(_))).await;
    assert_eq!(fault, SupervisorEvent::Fault(ServiceError::UnexpectedExit("exit code 70".into())));
    match sup.status().state {
        ServiceState::Failed { reason } => assert!(reason.contains("exit code 70"), "{reason}"),
        other => panic!("expected failed, got {other:?}"),
    }

    // Restart after a crash launches a fresh worker.
    sup.start(3001, "db.sqlite").await.unwrap();
    assert_eq!(launcher.launches(), 2);
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn clean_exit_while_running_is_stopped_not_failed() {
    let (sup, launcher) = supervisor(Script::Cooperative);
    let mut events = sup.subscribe();
    sup.start(3001, "db.sqlite").await.unwrap();

    launcher.crash_latest(0);

    wait_event(&mut events, |e| *e == SupervisorEvent::StateChanged(ServiceState::Stopped)).await;
    assert_eq!(sup.status().state, ServiceState::Stopped);
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SupervisorEvent::Fault(_)), "unexpected {event:?}");
    }
}

#[tokio::test]
async fn worker_logs_are_relayed_to_subscribers() {
    let (sup, _launcher) = supervisor(Script::Cooperative);
    let mut events = sup.subscribe();
    sup.start(3001, "db.sqlite").await.unwrap();

    let log = wait_event(&mut events, |e| matches!(e, SupervisorEvent::WorkerLog { .. })).await;
    assert_eq!(
        log,
        SupervisorEvent::WorkerLog {
            level: qoler_protocol::LogLevel::Info,
            message: "listening".into(),
        }
    );
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn status_keeps_desired_config_after_stop() {
    let (sup, _launcher) = supervisor(Script::Cooperative);
    sup.start(3005, "data/chat.sqlite").await.unwrap();
    sup.stop().await.unwrap();

    let status = sup.status();
    assert_eq!(status.state, ServiceState::Stopped);
    assert_eq!(status.port, Some(3005));
    assert_eq!(status.storage_path.as_deref(), Some(std::path::Path::new("data/chat.sqlite")));
}
