//! Supervisor driving the real worker control loop, with the worker running
//! as a task over duplex pipes instead of a child process.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use qoler_protocol::{ServiceError, ServiceState};
use qoler_server::{ControlOptions, WorkerOptions, control};
use qoler_supervisor::{
    ControlChannel, KillSwitch, LaunchedWorker, ServiceSupervisor, SupervisorConfig, WorkerExit, WorkerLauncher,
};
use tempfile::TempDir;

#[derive(Clone, Default)]
struct InProcessLauncher {
    launches: Arc<AtomicUsize>,
}

impl WorkerLauncher for InProcessLauncher {
    fn launch(&self) -> Result<LaunchedWorker, ServiceError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let (host_read, worker_write) = tokio::io::duplex(64 * 1024);
        let (worker_read, host_write) = tokio::io::duplex(64 * 1024);
        let options = ControlOptions {
            worker: WorkerOptions {
                hostname: "127.0.0.1".into(),
                http_close_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut task = tokio::spawn(control::run(worker_read, worker_write, options));

        let (channel, notifier) = ControlChannel::link(host_read, host_write);
        let (kill, mut kill_rx) = KillSwitch::new();
        tokio::spawn(async move {
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

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn start_binds_listener_and_stop_releases_it() {
    let dir = TempDir::new().unwrap();
    let launcher = InProcessLauncher::default();
    let sup = ServiceSupervisor::new(launcher.clone(), SupervisorConfig::new("in-process"));
    let port = free_port();

    let report = sup.start(u32::from(port), dir.path().join("chat.db")).await.unwrap();
    assert_eq!(report.state, ServiceState::Running { port });
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok());
    assert!(dir.path().join("chat.db").exists(), "storage opened before running");

    let stopped = sup.stop().await.unwrap();
    assert_eq!(stopped.state, ServiceState::Stopped);
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_err());
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn occupied_port_surfaces_bind_failure() {
    let dir = TempDir::new().unwrap();
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let sup = ServiceSupervisor::new(InProcessLauncher::default(), SupervisorConfig::new("in-process"));

    let err = sup.start(u32::from(port), dir.path().join("chat.db")).await.unwrap_err();
    assert!(matches!(err, ServiceError::BindFailure(_)), "{err:?}");
    assert!(matches!(sup.status().state, ServiceState::Failed { .. }));

    drop(occupied);
    sup.start(u32::from(port), dir.path().join("chat.db")).await.unwrap();
    sup.stop().await.unwrap();
}

#[tokio::test]
async fn unusable_storage_surfaces_storage_failure() {
    let dir = TempDir::new().unwrap();
    let sup = ServiceSupervisor::new(InProcessLauncher::default(), SupervisorConfig::new("in-process"));

    // A directory cannot be opened as a database.
    let err = sup.start(u32::from(free_port()), dir.path()).await.unwrap_err();
    assert!(matches!(err, ServiceError::StorageOpenFailure(_)), "{err:?}");
}
