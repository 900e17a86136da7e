//! Session-scoped execution engine.
//!
//! One isolated, stateful interpreter worker per session; submissions are
//! serialized per session, raced against a deadline, and every outcome is
//! folded into an [`ExecutionResult`](solver_common::types::ExecutionResult).

pub mod backend;
pub mod collector;
pub mod docker;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod protocol;
pub mod quota;
pub mod reaper;
pub mod registry;
pub mod worker;
pub mod workspace;


use anyhow::Result;
use solver_common::config::{BackendKind, EngineConfig};
use std::sync::Arc;

pub use executor::ExecutionCoordinator;

/// Build the interpreter backend selected by the configuration.
pub fn backend_from_config(config: &EngineConfig) -> Result<Arc<dyn backend::InterpreterBackend>> {
    Ok(match config.backend {
        BackendKind::Process => Arc::new(backend::ProcessBackend::new(config.python_bin.clone())),
        BackendKind::Docker => Arc::new(docker::DockerBackend::new(config)?),
    })
}
