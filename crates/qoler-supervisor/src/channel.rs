//! Host end of the control channel.
//!
//! Commands go out as JSON lines through a writer task; everything the worker
//! says comes back as a [`ChannelEvent`]. Process exit is not a message the
//! worker can send, so the launcher reports it through an [`ExitNotifier`],
//! which queues it behind whatever the reader was still draining.

use std::fmt;
use std::process::ExitStatus;
use std::time::Duration;

use qoler_protocol::{ControlMessage, ProtocolError, ServiceError};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Upper bound on waiting for the worker's output to drain after it exited.
const DRAIN_WAIT: Duration = Duration::from_millis(500);

/// Something observed on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Message(ControlMessage),
    /// A line that failed strict decoding.
    Malformed(ProtocolError),
    /// The worker process is gone. Always the last event.
    Exited(WorkerExit),
}

/// How the worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// The supervisor killed it.
    pub killed: bool,
}

impl WorkerExit {
    pub fn from_status(status: ExitStatus, killed: bool) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self { code: status.code(), signal, killed }
    }

    pub fn with_code(code: i32) -> Self {
        Self { code: Some(code), signal: None, killed: false }
    }

    pub fn killed() -> Self {
        Self { code: None, signal: None, killed: true }
    }

    /// Exit status could not be collected.
    pub fn unknown() -> Self {
        Self { code: None, signal: None, killed: false }
    }

    pub fn success(&self) -> bool {
        !self.killed && self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.killed {
            return f.write_str("killed by the supervisor");
        }
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "terminated by signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Outbound half: queues commands for the writer task.
#[derive(Debug)]
pub struct ControlSender {
    tx: Option<mpsc::UnboundedSender<ControlMessage>>,
}

impl ControlSender {
    pub fn send(&self, message: ControlMessage) -> Result<(), ServiceError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ServiceError::ChannelClosed("sender closed".into()))?;
        tx.send(message)
            .map_err(|_| ServiceError::ChannelClosed("worker input is gone".into()))
    }

    /// Close the worker's input once queued commands are written. The
    /// worker treats end of input as a request to shut down.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }
}

/// A linked control channel.
#[derive(Debug)]
pub struct ControlChannel {
    sender: ControlSender,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ControlChannel {
    /// Wire a channel over the worker's output (`reader`) and input
    /// (`writer`). Must be called inside a tokio runtime.
    pub fn link<R, W>(reader: R, writer: W) -> (Self, ExitNotifier)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (drained_tx, drained_rx) = oneshot::channel();

        tokio::spawn(write_loop(writer, outbound_rx));
        tokio::spawn(read_loop(reader, events_tx.clone(), drained_tx));

        let channel = Self {
            sender: ControlSender { tx: Some(outbound_tx) },
            events: events_rx,
        };
        let notifier = ExitNotifier { events: events_tx, drained: drained_rx };
        (channel, notifier)
    }

    pub fn send(&self, message: ControlMessage) -> Result<(), ServiceError> {
        self.sender.send(message)
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn split(self) -> (ControlSender, mpsc::UnboundedReceiver<ChannelEvent>) {
        (self.sender, self.events)
    }
}

/// Held by whoever watches the worker process.
#[derive(Debug)]
pub struct ExitNotifier {
    events: mpsc::UnboundedSender<ChannelEvent>,
    drained: oneshot::Receiver<()>,
}

impl ExitNotifier {
    /// Report the exit once the worker's output reached EOF (or after a
    /// short bound), so a final status line is never overtaken.
    pub async fn notify(self, exit: WorkerExit) {
        if tokio::time::timeout(DRAIN_WAIT, self.drained).await.is_err() {
            debug!("Worker output still open {} ms after exit", DRAIN_WAIT.as_millis());
        }
        let _ = self.events.send(ChannelEvent::Exited(exit));
    }
}

async fn read_loop<R>(reader: R, events: mpsc::UnboundedSender<ChannelEvent>, drained: oneshot::Sender<()>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Worker output read failed: {e}");
                break;
            }
        };
        let event = match ControlMessage::decode(&line) {
            Ok(message) => ChannelEvent::Message(message),
            Err(ProtocolError::Empty) => continue,
            Err(e) => ChannelEvent::Malformed(e),
        };
        if events.send(event).is_err() {
            break;
        }
    }
    debug!("Worker output closed");
    let _ = drained.send(());
}

async fn write_loop<W>(mut writer: W, mut outbound: mpsc::UnboundedReceiver<ControlMessage>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut line = match message.encode() {
            Ok(line) => line,
            Err(e) => {
                error!("{e}");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!("Worker input write failed: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            debug!("Worker input flush failed: {e}");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
