/// Interpreter Worker - one stateful, out-of-process execution context
///
/// **State machine:**
/// `Starting -> Ready -> Executing -> Ready ...`, and `Ready/Executing -> Dead`
/// on timeout, crash or teardown. `Dead` is terminal for the instance; the
/// registry builds a new generation instead of reviving one, so no state
/// crosses a generation boundary.
use crate::backend::{InterpreterBackend, WorkerProcess};
use crate::collector::{collect, CollectError, CollectedOutput};
use crate::metrics;
use crate::protocol::{encode_request, WorkerEvent, WorkerRequest};
use crate::workspace::SessionPaths;
use anyhow::{bail, Context, Result};
use solver_common::types::SessionId;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Applied to every new worker before it is marked ready.
pub const PREAMBLE: &str = r#"import math as mathlib
import os
INPUT_DIR = os.path.abspath("inputs")
OUTPUT_DIR = os.path.abspath("outputs")
try:
    import matplotlib
    matplotlib.use("Agg")
except ImportError:
    pass
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Ready,
    Executing,
    Dead,
}

/// Deadlines that govern a worker's conversation with its interpreter.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLimits {
    /// Spawn plus preamble must finish within this.
    pub startup_timeout: Duration,
    /// Longest silence tolerated between two events of one submission.
    pub read_deadline: Duration,
}

/// One code fragment plus the correlation id that tags its events.
#[derive(Debug, Clone)]
pub struct Submission {
    pub id: Uuid,
    pub code: String,
}

impl Submission {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerFault {
    #[error("worker is {0:?}, not ready for a submission")]
    NotReady(WorkerState),
    #[error("failed to encode submission: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to send submission to the interpreter: {0}")]
    Send(#[from] std::io::Error),
    #[error(transparent)]
    Collect(#[from] CollectError),
}

pub struct InterpreterWorker {
    session: SessionId,
    generation: u64,
    state: WorkerState,
    input: Pin<Box<dyn AsyncWrite + Send>>,
    events: mpsc::Receiver<WorkerEvent>,
    process: Box<dyn WorkerProcess>,
    limits: WorkerLimits,
    /// Included in the live-workers gauge.
    counted: bool,
}

impl InterpreterWorker {
    /// Spawn a worker through `backend` and run the preamble. Any failure
    /// kills the process and is returned; no half-started worker escapes.
    #[instrument(skip(backend, paths, limits), fields(backend_kind = backend.name()))]
    pub async fn start(
        backend: &dyn InterpreterBackend,
        session: &SessionId,
        paths: &SessionPaths,
        generation: u64,
        limits: WorkerLimits,
    ) -> Result<Self> {
        let io = tokio::time::timeout(limits.startup_timeout, backend.spawn(session, paths))
            .await
            .with_context(|| format!("Interpreter did not spawn within {:?}", limits.startup_timeout))??;

        let mut worker = Self {
            session: session.clone(),
            generation,
            state: WorkerState::Starting,
            input: io.input,
            events: io.events,
            process: io.process,
            limits,
            counted: false,
        };

        let preamble = Submission::new(PREAMBLE);
        let outcome = tokio::time::timeout(limits.startup_timeout, worker.run(&preamble, limits.read_deadline)).await;
        let failure = match outcome {
            Ok(Ok(output)) if output.error.is_empty() => None,
            Ok(Ok(output)) => Some(format!("preamble failed: {}", output.error.trim_end())),
            Ok(Err(fault)) => Some(format!("preamble failed: {}", fault)),
            Err(_) => Some(format!("preamble did not finish within {:?}", limits.startup_timeout)),
        };
        if let Some(reason) = failure {
            worker.terminate().await;
            bail!("Interpreter worker for session {} is dead: {}", session, reason);
        }

        worker.state = WorkerState::Ready;
        worker.counted = true;
        metrics::WORKERS_STARTED.inc();
        metrics::LIVE_WORKERS.inc();
        info!(
            session = %session,
            generation,
            process = %worker.process.describe(),
            "Interpreter worker ready"
        );
        Ok(worker)
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state != WorkerState::Dead
    }

    /// Only a `Ready` worker may take a submission. A worker left in
    /// `Executing` by a cancelled submission is still running that code.
    pub fn is_ready(&self) -> bool {
        self.state == WorkerState::Ready
    }

    /// Run one submission to completion. Only a `Ready` worker accepts work,
    /// which is what keeps submissions against one worker strictly serial.
    ///
    /// `timeout` is the caller's overall deadline; the silence tolerated
    /// between events is never shorter than it.
    ///
    /// Cancelling this future (the caller's deadline) leaves the worker in
    /// `Executing`; such a worker is never reused and must be terminated.
    pub async fn execute(&mut self, submission: &Submission, timeout: Duration) -> Result<CollectedOutput, WorkerFault> {
        if self.state != WorkerState::Ready {
            return Err(WorkerFault::NotReady(self.state));
        }
        let read_deadline = self.limits.read_deadline.max(timeout);
        self.run(submission, read_deadline).await
    }

    async fn run(&mut self, submission: &Submission, read_deadline: Duration) -> Result<CollectedOutput, WorkerFault> {
        self.state = WorkerState::Executing;
        debug!(session = %self.session, generation = self.generation, submission = %submission.id, "Submitting code");

        let request = WorkerRequest {
            id: submission.id,
            code: submission.code.clone(),
        };
        let sent = async {
            let frame = encode_request(&request)?;
            self.input.write_all(&frame).await?;
            self.input.flush().await?;
            Ok::<(), WorkerFault>(())
        }
        .await;
        if let Err(fault) = sent {
            self.state = WorkerState::Dead;
            return Err(fault);
        }

        match collect(&mut self.events, submission.id, read_deadline).await {
            Ok(output) => {
                if self.state == WorkerState::Executing {
                    self.state = WorkerState::Ready;
                }
                Ok(output)
            }
            Err(e) => {
                self.state = WorkerState::Dead;
                Err(e.into())
            }
        }
    }

    /// Kill the process and mark the worker dead. Safe to call repeatedly.
    pub async fn terminate(&mut self) {
        self.state = WorkerState::Dead;
        self.events.close();
        if let Err(e) = self.process.kill().await {
            warn!(session = %self.session, generation = self.generation, error = %e, "Failed to kill interpreter");
        }
        if std::mem::take(&mut self.counted) {
            metrics::LIVE_WORKERS.dec();
        }
        debug!(session = %self.session, generation = self.generation, "Interpreter worker terminated");
    }
}
