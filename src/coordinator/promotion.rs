//! Promotion of a standby to primary.

use super::{Flow, ReplicationAgent, Tick};
use crate::error::{AgentError, Result};
use crate::lock::LockStatus;
use crate::metrics;
use crate::recovery::RecoveryManager;
use crate::resilience::{poll_until, RetryConfig};
use crate::store::keys;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

impl ReplicationAgent {
    /// The master is running as a standby: promote it under the lock.
    pub(super) async fn promote_master(&mut self, t: &mut Tick) -> Result<Flow> {
        if self.service().request_lock().await? == LockStatus::Requested {
            t.status.waiting("Waiting for permission to promote");
            t.lock_wanted = true;
            return Ok(Flow::Continue);
        }
        self.promote_local(t).await
    }

    /// Promote and wait, bounded by `timeouts.promote`, for the instance
    /// to leave recovery. The caller holds the restart lock.
    #[instrument(skip_all)]
    pub(super) async fn promote_local(&mut self, t: &mut Tick) -> Result<Flow> {
        t.status.maintenance("Promoting to primary");
        let started = Instant::now();

        if let Err(e) = self.deps.db.promote().await {
            error!(error = %e, "Promotion failed");
            metrics::record_promotion(false, started.elapsed());
            t.status.blocked("Failed to promote to primary");
            return Ok(Flow::Halt);
        }

        let db = self.deps.db.as_ref();
        let schedule = RetryConfig::polling(self.config.timeouts.poll_interval());
        let waited = poll_until("promote", &schedule, self.config.timeouts.promote(), || async move {
            Ok::<_, AgentError>(!db.is_in_recovery().await?)
        })
        .await;
        match waited {
            Ok(_) => {}
            Err(AgentError::Timeout { .. }) => {
                warn!("Instance still in recovery after promotion");
                metrics::record_promotion(false, started.elapsed());
                t.status.blocked("Timed out promoting to primary");
                return Ok(Flow::Halt);
            }
            Err(e) => return Err(e),
        }

        self.refresh_probe(t).await?;
        self.store.set_flag(keys::CLONED, true);
        let manager = RecoveryManager::new(&self.config, self.deps.renderer.as_ref());
        manager.clear(&mut self.store).await?;
        t.registry.local_facts_mut().following = None;

        metrics::record_promotion(true, started.elapsed());
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Promoted to primary");
        Ok(Flow::Continue)
    }
}
