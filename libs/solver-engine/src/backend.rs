/// Interpreter backends - how a worker process comes to exist
///
/// A backend only knows how to start one out-of-process interpreter running
/// the driver and wire up its pipes. Lifecycle, serialization and output
/// classification live in the worker and collector.
use crate::protocol::{decode_event, WorkerEvent, DRIVER_SOURCE};
use crate::workspace::SessionPaths;
use anyhow::{Context, Result};
use async_trait::async_trait;
use solver_common::types::SessionId;
use std::pin::Pin;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Buffered events between the pipe reader and the collector
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Handle used to kill a worker process. Killing twice must be harmless.
#[async_trait]
pub trait WorkerProcess: Send {
    fn describe(&self) -> String;

    async fn kill(&mut self) -> Result<()>;
}

/// The live pipes of a freshly spawned worker.
pub struct WorkerIo {
    /// Request frames are written here.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
    /// Decoded protocol events, closed when the worker's stdout ends.
    pub events: mpsc::Receiver<WorkerEvent>,
    pub process: Box<dyn WorkerProcess>,
}

#[async_trait]
pub trait InterpreterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn spawn(&self, session: &SessionId, paths: &SessionPaths) -> Result<WorkerIo>;
}

/// Runs the driver as a local child process with the session root as cwd.
pub struct ProcessBackend {
    python: String,
}

impl ProcessBackend {
    pub fn new(python: impl Into<String>) -> Self {
        Self { python: python.into() }
    }
}

struct ChildProcess {
    child: Child,
    label: String,
}

#[async_trait]
impl WorkerProcess for ChildProcess {
    fn describe(&self) -> String {
        self.label.clone()
    }

    async fn kill(&mut self) -> Result<()> {
        // Already reaped children report Ok(Some(_)); nothing left to kill.
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        self.child
            .kill()
            .await
            .with_context(|| format!("Failed to kill {}", self.label))
    }
}

#[async_trait]
impl InterpreterBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, session: &SessionId, paths: &SessionPaths) -> Result<WorkerIo> {
        let mut child = Command::new(&self.python)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER_SOURCE)
            .current_dir(&paths.root)
            .env("PYTHONUNBUFFERED", "1")
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn interpreter '{}'", self.python))?;

        let label = format!("process:{}", child.id().unwrap_or_default());
        let stdin = child.stdin.take().context("Interpreter stdin not captured")?;
        let stdout = child.stdout.take().context("Interpreter stdout not captured")?;
        let stderr = child.stderr.take().context("Interpreter stderr not captured")?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let reader_label = label.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match decode_event(&line) {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => debug!(worker = %reader_label, "Ignoring non-protocol line"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(worker = %reader_label, error = %e, "Failed reading worker stdout");
                        break;
                    }
                }
            }
        });

        let session_label = session.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(session = %session_label, "worker stderr: {}", line);
            }
        });

        Ok(WorkerIo {
            input: Box::pin(stdin),
            events: rx,
            process: Box::new(ChildProcess { child, label }),
        })
    }
}
