/// Session Registry - session id -> interpreter worker
///
/// The outer map is only locked long enough to find or insert a slot; every
/// slot carries its own async mutex. Holding that mutex (a `SessionLease`)
/// is the per-session exclusive region: unrelated sessions never wait on
/// each other, and one session can never race-construct two workers.
use crate::backend::InterpreterBackend;
use crate::metrics;
use crate::worker::{InterpreterWorker, WorkerLimits};
use crate::workspace::{CleanupReport, Workspace};
use anyhow::{Context, Result};
use solver_common::types::SessionId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::{info, warn};

#[derive(Default)]
struct SessionSlot {
    worker: Option<InterpreterWorker>,
    generation: u64,
    /// Set once the session is destroyed; waiters must look the slot up again.
    retired: bool,
}

/// Outcome of `remove_and_destroy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub worker_stopped: bool,
    pub cleanup: CleanupReport,
}

pub struct SessionRegistry {
    backend: Arc<dyn InterpreterBackend>,
    workspace: Arc<Workspace>,
    limits: WorkerLimits,
    slots: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<SessionSlot>>>>,
}

/// Exclusive access to one session's worker slot.
pub struct SessionLease<'a> {
    registry: &'a SessionRegistry,
    session: SessionId,
    slot_ref: Arc<tokio::sync::Mutex<SessionSlot>>,
    slot: OwnedMutexGuard<SessionSlot>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn InterpreterBackend>, workspace: Arc<Workspace>, limits: WorkerLimits) -> Self {
        Self {
            backend,
            workspace,
            limits,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Enter the session's exclusive region, waiting for any submission
    /// already running against it.
    pub async fn lease(&self, session: &SessionId) -> SessionLease<'_> {
        loop {
            let slot_ref = {
                let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
                slots.entry(session.clone()).or_default().clone()
            };
            let slot = slot_ref.clone().lock_owned().await;
            if slot.retired {
                continue;
            }
            return SessionLease {
                registry: self,
                session: session.clone(),
                slot_ref,
                slot,
            };
        }
    }

    /// Lease the session with a live worker, constructing one if the current
    /// worker is missing or dead.
    pub async fn get_or_create(&self, session: &SessionId) -> Result<SessionLease<'_>> {
        let mut lease = self.lease(session).await;
        lease.worker().await?;
        Ok(lease)
    }

    /// Tear down the session's worker so the next submission starts fresh.
    pub async fn replace(&self, session: &SessionId) -> bool {
        self.lease(session).await.replace().await
    }

    /// Stop the worker and delete all session data. Idempotent.
    pub async fn remove_and_destroy(&self, session: &SessionId) -> Teardown {
        let lease = self.lease(session).await;
        self.destroy(lease).await
    }

    /// Destroy a session whose lease the caller already holds.
    pub async fn destroy(&self, mut lease: SessionLease<'_>) -> Teardown {
        let worker_stopped = lease.replace().await;
        lease.slot.retired = true;
        {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            if slots
                .get(&lease.session)
                .is_some_and(|current| Arc::ptr_eq(current, &lease.slot_ref))
            {
                slots.remove(&lease.session);
            }
        }
        // Keep the slot locked until the data is gone, so a new submission
        // cannot recreate the workspace underneath the deletion.
        let cleanup = self.workspace.destroy(&lease.session).await;
        info!(session = %lease.session, worker_stopped, "Session destroyed");
        Teardown { worker_stopped, cleanup }
    }

    /// Give the lease back, dropping the slot entirely when it holds no
    /// worker, so a look-up that found nothing to do leaves no trace.
    pub fn release(&self, mut lease: SessionLease<'_>) {
        if lease.slot.worker.is_some() {
            return;
        }
        lease.slot.retired = true;
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(&lease.session)
            .is_some_and(|current| Arc::ptr_eq(current, &lease.slot_ref))
        {
            slots.remove(&lease.session);
        }
    }

    /// Sessions currently tracked in memory.
    pub fn sessions(&self) -> Vec<SessionId> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let mut sessions: Vec<SessionId> = slots.keys().cloned().collect();
        sessions.sort();
        sessions
    }

    pub fn contains(&self, session: &SessionId) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session)
    }

    /// Terminate every worker (process shutdown). Session data is kept.
    pub async fn shutdown(&self) {
        for session in self.sessions() {
            if self.replace(&session).await {
                info!(session = %session, "Worker stopped for shutdown");
            }
        }
    }
}

impl SessionLease<'_> {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Generation of the most recently constructed worker (0 before the first).
    pub fn generation(&self) -> u64 {
        self.slot.generation
    }

    /// A worker exists and is `Ready` for the next submission.
    pub fn has_live_worker(&self) -> bool {
        self.slot.worker.as_ref().is_some_and(|w| w.is_ready())
    }

    /// The live worker, constructing a new generation when needed. A worker
    /// that is dead, or still busy with an abandoned submission, is killed
    /// first.
    pub async fn worker(&mut self) -> Result<&mut InterpreterWorker> {
        if !self.has_live_worker() {
            if let Some(mut stale) = self.slot.worker.take() {
                if stale.is_alive() {
                    warn!(
                        session = %self.session,
                        generation = stale.generation(),
                        state = ?stale.state(),
                        "Discarding worker left busy by a cancelled submission"
                    );
                    metrics::WORKER_REPLACEMENTS.inc();
                }
                stale.terminate().await;
            }
            self.slot.generation += 1;
            let generation = self.slot.generation;
            let registry = self.registry;
            let paths = registry.workspace.ensure(&self.session).await?;
            let worker = InterpreterWorker::start(
                registry.backend.as_ref(),
                &self.session,
                &paths,
                generation,
                registry.limits,
            )
            .await?;
            self.slot.worker = Some(worker);
        }
        self.slot
            .worker
            .as_mut()
            .context("worker slot empty after construction")
    }

    /// Kill and drop the current worker. Returns whether one existed.
    pub async fn replace(&mut self) -> bool {
        match self.slot.worker.take() {
            Some(mut worker) => {
                let generation = worker.generation();
                worker.terminate().await;
                info!(session = %self.session, generation, "Interpreter worker stopped");
                true
            }
            None => false,
        }
    }
}
