/// Execution Coordinator - the request entry point of the engine
///
/// **Per submission, inside the session's exclusive region:**
/// 1. Refresh inputs, clear outputs (same path for first and Nth run)
/// 2. Obtain the worker from the registry (infrastructure failure -> result error)
/// 3. Submit with a fresh correlation id, raced against the caller's deadline
/// 4. Success -> collected output + harvested files
/// 5. Timeout or crash -> discard the worker, report that state was lost
///
/// Nothing here returns a transport error for execution; every failure is
/// folded into `ExecutionResult::error`. Admission paths return `Rejection`.
use crate::backend::InterpreterBackend;
use crate::error::Rejection;
use crate::metrics;
use crate::quota::QuotaEnforcer;
use crate::registry::{SessionRegistry, Teardown};
use crate::worker::{Submission, WorkerLimits};
use crate::workspace::{sanitize_filename, Workspace};
use chrono::Utc;
use solver_common::config::EngineConfig;
use solver_common::storage::BlobStore;
use solver_common::types::{ExecutionMetadata, ExecutionResult, SessionId, TeardownResponse, UsageReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};

/// A file accepted into a session's inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedFile {
    pub filename: String,
    pub bytes: u64,
    pub usage_bytes: u64,
}

pub struct ExecutionCoordinator {
    registry: Arc<SessionRegistry>,
    workspace: Arc<Workspace>,
    quota: QuotaEnforcer,
    max_code_bytes: usize,
}

impl ExecutionCoordinator {
    pub fn new(
        config: &EngineConfig,
        backend: Arc<dyn InterpreterBackend>,
        store: Option<Arc<dyn BlobStore>>,
    ) -> Self {
        let workspace = Arc::new(Workspace::new(config.workspace_root.clone(), store));
        let limits = WorkerLimits {
            startup_timeout: config.startup_timeout,
            read_deadline: config.read_deadline,
        };
        let registry = Arc::new(SessionRegistry::new(backend, workspace.clone(), limits));
        Self {
            registry,
            workspace,
            quota: QuotaEnforcer::new(config.quota_bytes),
            max_code_bytes: config.max_code_bytes,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn workspace(&self) -> &Arc<Workspace> {
        &self.workspace
    }

    /// Run `code` for `session_id` with a hard deadline. Always returns a
    /// well-formed result.
    #[instrument(skip(self, code), fields(code_bytes = code.len(), timeout_ms = timeout.as_millis() as u64))]
    pub async fn execute(&self, session_id: &str, code: &str, timeout: Duration) -> ExecutionResult {
        let session = match SessionId::parse(session_id) {
            Ok(session) => session,
            Err(e) => {
                metrics::EXECUTIONS_TOTAL.with_label_values(&["invalid"]).inc();
                return ExecutionResult::failure(format!("Invalid session id: {}", e));
            }
        };
        if code.trim().is_empty() {
            metrics::EXECUTIONS_TOTAL.with_label_values(&["invalid"]).inc();
            return ExecutionResult::failure("No code provided");
        }
        if code.len() > self.max_code_bytes {
            metrics::EXECUTIONS_TOTAL.with_label_values(&["invalid"]).inc();
            return ExecutionResult::failure(format!(
                "Code exceeds maximum size of {} bytes",
                self.max_code_bytes
            ));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let mut lease = self.registry.lease(&session).await;

        // Step 1: refresh inputs, clear outputs
        if let Err(e) = self.workspace.ensure(&session).await {
            error!(session = %session, error = %e, "Workspace unavailable");
            metrics::EXECUTIONS_TOTAL.with_label_values(&["infra_error"]).inc();
            return ExecutionResult::failure(format!("Workspace unavailable: {:#}", e));
        }
        if let Err(e) = self.workspace.refresh_inputs(&session).await {
            warn!(session = %session, error = %e, "Input refresh failed, continuing with local inputs");
        }
        if let Err(e) = self.workspace.clear_outputs(&session).await {
            error!(session = %session, error = %e, "Failed to clear outputs");
            metrics::EXECUTIONS_TOTAL.with_label_values(&["infra_error"]).inc();
            return ExecutionResult::failure(format!("Failed to prepare outputs directory: {:#}", e));
        }
        if let Err(e) = self.workspace.touch(&session).await {
            warn!(session = %session, error = %e, "Failed to mark session as used");
        }

        // Step 2: obtain worker
        let submission = Submission::new(code);
        let (generation, outcome) = match lease.worker().await {
            Ok(worker) => {
                let generation = worker.generation();
                // Step 3: submit against the deadline
                (generation, tokio::time::timeout(timeout, worker.execute(&submission, timeout)).await)
            }
            Err(e) => {
                error!(session = %session, error = %e, "Failed to start interpreter worker");
                metrics::EXECUTIONS_TOTAL.with_label_values(&["infra_error"]).inc();
                return ExecutionResult::failure(format!("Failed to start interpreter: {:#}", e));
            }
        };

        let mut metadata = ExecutionMetadata {
            generation,
            started_at: Some(started_at),
            ..Default::default()
        };

        let mut result = match outcome {
            // Step 4: success
            Ok(Ok(collected)) => {
                let files = match self.workspace.harvest_outputs(&session).await {
                    Ok(files) => files,
                    Err(e) => {
                        warn!(session = %session, error = %e, "Failed to harvest outputs");
                        Vec::new()
                    }
                };
                metrics::EXECUTIONS_TOTAL.with_label_values(&["completed"]).inc();
                ExecutionResult {
                    output: collected.output,
                    error: collected.error,
                    artifacts: collected.artifacts,
                    files,
                    metadata: ExecutionMetadata::default(),
                }
            }
            // Step 6: worker crashed or went silent
            Ok(Err(fault)) => {
                lease.replace().await;
                metrics::WORKER_REPLACEMENTS.inc();
                metrics::EXECUTIONS_TOTAL.with_label_values(&["crashed"]).inc();
                metadata.worker_replaced = true;
                warn!(session = %session, generation, error = %fault, "Interpreter worker failed mid-execution");
                ExecutionResult::failure(format!(
                    "Interpreter worker failed: {}. The interpreter was restarted and all session state (variables, imports, loaded data) was lost.",
                    fault
                ))
            }
            // Step 5: deadline exceeded
            Err(_) => {
                lease.replace().await;
                metrics::WORKER_REPLACEMENTS.inc();
                metrics::EXECUTIONS_TOTAL.with_label_values(&["timeout"]).inc();
                metadata.worker_replaced = true;
                metadata.timed_out = true;
                warn!(session = %session, generation, timeout_ms = timeout.as_millis() as u64, "Execution timed out, worker discarded");
                ExecutionResult::failure(format!(
                    "Execution aborted: exceeded the {}s time limit. The interpreter was restarted and all session state (variables, imports, loaded data) was lost.",
                    timeout.as_secs_f64()
                ))
            }
        };
        drop(lease);

        let elapsed = start.elapsed();
        metrics::EXECUTION_SECONDS.observe(elapsed.as_secs_f64());
        metadata.duration_ms = elapsed.as_millis() as u64;
        result.metadata = metadata;

        info!(
            session = %session,
            generation,
            execution_ms = result.metadata.duration_ms,
            output_bytes = result.output.len(),
            error_bytes = result.error.len(),
            artifacts = result.artifacts.len(),
            files = result.files.len(),
            "Execution finished"
        );
        result
    }

    /// Admit an input file: quota check first, then persist. Rejected
    /// requests change nothing.
    #[instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    pub async fn admit_file(&self, session_id: &str, filename: &str, bytes: &[u8]) -> Result<AdmittedFile, Rejection> {
        let outcome = self.admit_inner(session_id, filename, bytes).await;
        let label = match &outcome {
            Ok(_) => "accepted",
            Err(rejection) => rejection.kind(),
        };
        metrics::ADMISSIONS_TOTAL.with_label_values(&[label]).inc();
        outcome
    }

    async fn admit_inner(&self, session_id: &str, filename: &str, bytes: &[u8]) -> Result<AdmittedFile, Rejection> {
        let session = SessionId::parse(session_id)?;
        let name = sanitize_filename(filename).ok_or_else(|| Rejection::InvalidFilename(filename.to_string()))?;
        let incoming = bytes.len() as u64;

        // Admission shares the session's exclusive region with execution and
        // teardown, so an upload can never land in a workspace being destroyed.
        let _lease = self.registry.lease(&session).await;
        let reservation = self
            .quota
            .check_and_reserve(&self.workspace, &session, incoming)
            .await?;
        self.workspace
            .store_input(&session, &name, bytes)
            .await
            .map_err(Rejection::storage)?;
        if let Err(e) = self.workspace.touch(&session).await {
            warn!(session = %session, error = %e, "Failed to mark session as used");
        }

        info!(session = %session, file = %name, bytes = incoming, "Input admitted");
        Ok(AdmittedFile {
            filename: name,
            bytes: incoming,
            usage_bytes: reservation.usage_after(),
        })
    }

    /// Best-effort teardown; always succeeds from the caller's side.
    pub async fn teardown(&self, session_id: &str) -> TeardownResponse {
        let session = match SessionId::parse(session_id) {
            Ok(session) => session,
            Err(e) => {
                // Nothing can exist under an id we would never have accepted.
                warn!(session_id, error = %e, "Teardown for invalid session id ignored");
                return TeardownResponse {
                    session_id: session_id.to_string(),
                    ..Default::default()
                };
            }
        };

        let Teardown { worker_stopped, cleanup } = self.registry.remove_and_destroy(&session).await;
        self.quota.forget(&session);
        TeardownResponse {
            session_id: session.to_string(),
            worker_stopped,
            local_removed: cleanup.local_removed,
            remote_removed: cleanup.remote_removed,
        }
    }

    pub async fn usage(&self, session_id: &str) -> Result<UsageReport, Rejection> {
        let session = SessionId::parse(session_id)?;
        let used = self.workspace.usage(&session).await.map_err(Rejection::storage)?;
        Ok(UsageReport {
            session_id: session.to_string(),
            used_bytes: used,
            ceiling_bytes: self.quota.ceiling(),
        })
    }

    /// Stop every worker; used on process shutdown.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
