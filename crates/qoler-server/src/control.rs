//! Worker side of the control channel.
//!
//! Reads one JSON [`ControlMessage`] per line from the host and drives the
//! [`WorkerProcess`]. Replies go out through a single writer task so status
//! and log lines are never interleaved mid-line.

use std::time::Duration;

use qoler_protocol::{ControlMessage, LogLevel, ProtocolError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::worker::{WorkerOptions, WorkerProcess};

/// Clean exit: the host closed the channel.
pub const EXIT_OK: i32 = 0;
/// Internal fault: the listener died or the control loop panicked.
pub const EXIT_FAULT: i32 = 70;

#[derive(Debug, Clone)]
pub struct ControlOptions {
    pub worker: WorkerOptions,
    /// Upper bound on the ordered stop after an internal fault
    pub fault_shutdown_budget: Duration,
    /// How long to wait for queued replies to flush before returning
    pub flush_timeout: Duration,
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            worker: WorkerOptions::default(),
            fault_shutdown_budget: Duration::from_secs(3),
            flush_timeout: Duration::from_secs(1),
        }
    }
}

/// Serve the control channel until the host goes away or the worker faults.
/// Returns the process exit code.
pub async fn run<R, W>(reader: R, writer: W, options: ControlOptions) -> i32
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (_no_faults, external) = mpsc::unbounded_channel();
    run_with_faults(reader, writer, options, external).await
}

/// Like [`run`], with an extra fault source (a watchdog, say). A reason
/// received on `external` is handled exactly like the listener dying: bounded
/// ordered stop, then [`EXIT_FAULT`]. A closed `external` is ignored.
pub async fn run_with_faults<R, W>(
    reader: R,
    writer: W,
    options: ControlOptions,
    mut external: mpsc::UnboundedReceiver<String>,
) -> i32
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (reports_tx, reports_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, reports_rx));

    let mut worker = WorkerProcess::new(options.worker.clone(), reports_tx.clone());
    let mut lines = BufReader::new(reader).lines();
    let mut faults: Option<oneshot::Receiver<String>> = None;

    info!("Worker ready, waiting for commands");

    let code = loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        info!("Control channel closed by host, shutting down");
                        worker.stop().await;
                        break EXIT_OK;
                    }
                    Err(e) => {
                        warn!("Control channel read failed: {e}, shutting down");
                        worker.stop().await;
                        break EXIT_OK;
                    }
                };

                match ControlMessage::decode(&line) {
                    Ok(ControlMessage::Start { port, storage_path, secret }) => {
                        info!("Start requested on port {port}");
                        if worker.start(port, &storage_path, &secret).await.is_ok() {
                            if let Some(rx) = worker.take_faults() {
                                faults = Some(rx);
                            }
                        }
                    }
                    Ok(ControlMessage::Stop) => {
                        info!("Stop requested");
                        worker.stop().await;
                        faults = None;
                    }
                    Ok(other) => {
                        let msg = format!("unexpected `{}` message from host", other.kind());
                        warn!("{msg}");
                        let _ = reports_tx.send(ControlMessage::log(LogLevel::Error, msg));
                    }
                    Err(ProtocolError::Empty) => {}
                    Err(e) => {
                        warn!("{e}");
                        let _ = reports_tx.send(ControlMessage::log(LogLevel::Error, e.to_string()));
                    }
                }
            }

            reason = next_fault(&mut faults, &mut external) => {
                error!("Internal fault: {reason}");
                let _ = reports_tx.send(ControlMessage::log(LogLevel::Error, format!("internal fault: {reason}")));
                if tokio::time::timeout(options.fault_shutdown_budget, worker.stop()).await.is_err() {
                    error!(
                        "Ordered stop exceeded {} ms after fault",
                        options.fault_shutdown_budget.as_millis()
                    );
                }
                break EXIT_FAULT;
            }
        }
    };

    drop(worker);
    drop(reports_tx);
    if tokio::time::timeout(options.flush_timeout, writer_task).await.is_err() {
        warn!("Control writer did not flush in time");
    }
    debug!("Control loop exiting with code {code}");
    code
}

async fn next_fault(
    listener: &mut Option<oneshot::Receiver<String>>,
    external: &mut mpsc::UnboundedReceiver<String>,
) -> String {
    tokio::select! {
        reason = listener_fault(listener) => reason,
        Some(reason) = external.recv() => reason,
    }
}

/// Resolves with the fault reason once the current listener dies. Pending
/// forever when nothing is running.
async fn listener_fault(faults: &mut Option<oneshot::Receiver<String>>) -> String {
    if let Some(rx) = faults.as_mut() {
        let outcome = rx.await;
        *faults = None;
        if let Ok(reason) = outcome {
            return reason;
        }
    }
    std::future::pending().await
}

async fn write_loop<W>(mut writer: W, mut reports: mpsc::UnboundedReceiver<ControlMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = reports.recv().await {
        let mut line = match message.encode() {
            Ok(line) => line,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Control write failed: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("Control flush failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
