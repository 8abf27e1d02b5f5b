//! Local service handling under the restart lock.
//!
//! Anything that interrupts the local server (stop, restart, clone,
//! promote) must hold the peer-group-wide restart lock first. Starting a
//! stopped server and reloading configuration are not disruptive and need
//! no lock.

use crate::database::DatabaseControl;
use crate::error::{AgentError, Result};
use crate::evaluator::ReplicationState;
use crate::lock::{LockStatus, RestartLock, RESTART_LOCK};
use crate::status::WorkloadStatus;
use crate::store::{keys, UnitStore};
use tracing::{debug, info, warn};

pub const LIVE_MASTER: &str = "Live master";
pub const LIVE_PRIMARY: &str = "Live primary";
pub const LIVE_SECONDARY: &str = "Live secondary";
pub const UNEXPECTEDLY_SHUT_DOWN: &str = "PostgreSQL unexpectedly shut down";

pub struct Service<'a> {
    db: &'a dyn DatabaseControl,
    lock: &'a dyn RestartLock,
}

impl<'a> Service<'a> {
    pub fn new(db: &'a dyn DatabaseControl, lock: &'a dyn RestartLock) -> Self {
        Self { db, lock }
    }

    /// Ask for the restart lock. Never blocks.
    pub async fn request_lock(&self) -> Result<LockStatus> {
        let status = self.lock.acquire(RESTART_LOCK).await?;
        crate::metrics::record_lock_request(RESTART_LOCK, status.as_str());
        debug!(status = status.as_str(), "Restart lock requested");
        Ok(status)
    }

    pub async fn release_lock(&self) -> Result<()> {
        self.lock.release(RESTART_LOCK).await
    }

    /// Give back a held lock but stay queued if only requested.
    pub async fn release_held_lock(&self) -> Result<bool> {
        self.lock.release_if_held(RESTART_LOCK).await
    }

    async fn require_lock(&self, action: &str) -> Result<()> {
        if self.lock.is_granted(RESTART_LOCK).await? {
            Ok(())
        } else {
            Err(AgentError::InvalidState {
                expected: format!("restart lock held for {}", action),
                actual: "lock not granted".to_string(),
            })
        }
    }

    /// Stop the server. Requires the restart lock.
    pub async fn stop(&self) -> Result<()> {
        self.require_lock("stop").await?;
        let result = self.db.stop().await;
        crate::metrics::record_service_action("stop", result.is_ok());
        result
    }

    /// Stop (if running) and start. Requires the restart lock.
    pub async fn restart(&self, store: &mut UnitStore) -> Result<()> {
        self.require_lock("restart").await?;
        if self.db.is_running().await? {
            info!("Restarting PostgreSQL");
            let stopped = self.db.stop().await;
            crate::metrics::record_service_action("stop", stopped.is_ok());
            stopped?;
        }
        self.start(store).await
    }

    /// Start a stopped server. Any pending restart or reload is satisfied.
    pub async fn start(&self, store: &mut UnitStore) -> Result<()> {
        let started = self.db.start().await;
        crate::metrics::record_service_action("start", started.is_ok());
        started?;
        store.set_flag(keys::NEEDS_RESTART, false);
        store.set_flag(keys::NEEDS_RELOAD, false);
        info!("PostgreSQL started");
        Ok(())
    }

    pub async fn reload(&self, store: &mut UnitStore) -> Result<()> {
        let reloaded = self.db.reload().await;
        crate::metrics::record_service_action("reload", reloaded.is_ok());
        if let Err(e) = reloaded {
            warn!(error = %e, "Reload failed");
            return Err(e);
        }
        store.set_flag(keys::NEEDS_RELOAD, false);
        info!("PostgreSQL configuration reloaded");
        Ok(())
    }
}

/// Status for a unit with nothing left to do this tick.
pub fn active_status(state: &ReplicationState) -> WorkloadStatus {
    if !state.is_running {
        WorkloadStatus::blocked(UNEXPECTEDLY_SHUT_DOWN)
    } else if state.is_master {
        WorkloadStatus::active(LIVE_MASTER)
    } else if state.is_primary {
        WorkloadStatus::active(LIVE_PRIMARY)
    } else {
        WorkloadStatus::active(LIVE_SECONDARY)
    }
}
