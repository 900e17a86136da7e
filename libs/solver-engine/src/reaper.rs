/// Reaper - background garbage collector for idle sessions
///
/// Last-touched time comes from the workspace's modification time, so the
/// reaper and the workspace can never disagree about activity.
use crate::metrics;
use crate::registry::SessionRegistry;
use crate::workspace::Workspace;
use solver_common::types::SessionId;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct Reaper {
    registry: Arc<SessionRegistry>,
    workspace: Arc<Workspace>,
    retention: Duration,
    interval: Duration,
}

impl Reaper {
    pub fn new(registry: Arc<SessionRegistry>, retention: Duration, interval: Duration) -> Self {
        let workspace = registry.workspace().clone();
        Self {
            registry,
            workspace,
            retention,
            interval,
        }
    }

    async fn is_expired(&self, session: &SessionId, now: SystemTime) -> Option<bool> {
        match self.workspace.last_touched(session).await {
            Ok(Some(touched)) => Some(now.duration_since(touched).unwrap_or_default() > self.retention),
            // A worker with no workspace left has nothing to protect.
            Ok(None) => Some(true),
            Err(e) => {
                warn!(session = %session, error = %e, "Cannot read session activity, skipping");
                None
            }
        }
    }

    /// One pass over every known session. Returns the sessions removed.
    pub async fn reap_once(&self, now: SystemTime) -> Vec<SessionId> {
        let mut known: BTreeSet<SessionId> = self.registry.sessions().into_iter().collect();
        match self.workspace.sessions().await {
            Ok(sessions) => known.extend(sessions),
            Err(e) => warn!(error = %e, "Failed to list workspaces"),
        }

        let mut reaped = Vec::new();
        for session in known {
            if self.is_expired(&session, now).await != Some(true) {
                continue;
            }
            // Re-check under the lease: a submission may have touched the
            // session while we waited for it to finish.
            let lease = self.registry.lease(&session).await;
            if self.is_expired(&session, now).await != Some(true) {
                self.registry.release(lease);
                continue;
            }
            self.registry.destroy(lease).await;
            metrics::SESSIONS_REAPED.inc();
            reaped.push(session);
        }

        if reaped.is_empty() {
            debug!("Reaper pass found no idle sessions");
        } else {
            info!(count = reaped.len(), "Reaped idle sessions");
        }
        reaped
    }

    /// Run until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                retention_secs = self.retention.as_secs(),
                interval_secs = self.interval.as_secs(),
                "Reaper started"
            );
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.reap_once(SystemTime::now()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Reaper stopped");
        })
    }
}
