/// Quota Enforcer - per-session byte ceiling for admitted input material
///
/// Usage is always recomputed from what is actually stored, never kept as a
/// running counter. The check is an admission decision: it never waits for
/// space and never queues.
use crate::error::Rejection;
use crate::workspace::Workspace;
use solver_common::types::SessionId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Held while admitted bytes are being persisted, so two admissions for the
/// same session cannot both pass against the same usage figure.
#[derive(Debug)]
pub struct Reservation {
    pub usage_before: u64,
    pub incoming: u64,
    _guard: OwnedMutexGuard<()>,
}

impl Reservation {
    pub fn usage_after(&self) -> u64 {
        self.usage_before + self.incoming
    }
}

pub struct QuotaEnforcer {
    ceiling: u64,
    admissions: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl QuotaEnforcer {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            admissions: Mutex::new(HashMap::new()),
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Pure admission rule: accept iff `usage + incoming <= ceiling`.
    pub fn check(&self, usage: u64, incoming: u64) -> Result<u64, Rejection> {
        match usage.checked_add(incoming) {
            Some(total) if total <= self.ceiling => Ok(total),
            _ => Err(Rejection::QuotaExceeded {
                used: usage,
                incoming,
                ceiling: self.ceiling,
            }),
        }
    }

    /// Compute current usage and admit `incoming` bytes or reject. The
    /// returned reservation must be held until the bytes are stored.
    pub async fn check_and_reserve(
        &self,
        workspace: &Workspace,
        session: &SessionId,
        incoming: u64,
    ) -> Result<Reservation, Rejection> {
        let lock = {
            let mut admissions = self.admissions.lock().unwrap_or_else(PoisonError::into_inner);
            admissions.entry(session.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;

        let usage = workspace.usage(session).await.map_err(Rejection::storage)?;
        self.check(usage, incoming)?;
        Ok(Reservation {
            usage_before: usage,
            incoming,
            _guard: guard,
        })
    }

    /// Drop bookkeeping for a destroyed session.
    pub fn forget(&self, session: &SessionId) {
        self.admissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session);
    }
}
