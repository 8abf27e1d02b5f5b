// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Controlled switchover.
//!
//! ```text
//! leader sets anointed
//!        │
//!        ▼
//! old master re-points at anointed ─► restarts as its standby
//!        │                            (publishes following = anointed)
//!        ▼
//! anointed drains: received ≥ old master's position, or both stop moving
//!        │
//!        ▼
//! anointed promotes, clears following
//!        │
//!        ▼
//! leader finalizes: master := anointed, anointed := none
//! ```
//!
//! The drain loop is bounded by `timeouts.drain`. Running out of time
//! blocks the anointed unit rather than promoting with data still in
//! flight.

use super::{Flow, ReplicationAgent, Tick};
use crate::database::{Lsn, PeerEndpoint, ReplicationCredentials};
use crate::error::{AgentError, Result};
use crate::evaluator::ReplicationState;
use crate::leadership::LeadershipUpdate;
use crate::lock::LockStatus;
use crate::metrics;
use crate::recovery::RecoveryManager;
use crate::resilience::{retry_transient, Poller, RetryConfig};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

impl ReplicationAgent {
    /// The old master starts following its successor.
    #[instrument(skip_all)]
    pub(super) async fn repoint_old_master(&mut self, t: &mut Tick, state: &ReplicationState) -> Result<Flow> {
        let Some(anointed) = state.anointed_master.clone() else {
            return Ok(Flow::Continue);
        };
        let (Some(upstream), Some(credentials)) = (self.endpoint(t, &anointed), self.credentials(t)) else {
            t.status.waiting(format!("Waiting for {}", anointed));
            return Ok(Flow::Continue);
        };

        info!(anointed = %anointed, "Handing over master role");
        let local = t.local().clone();
        let manager = RecoveryManager::new(&self.config, self.deps.renderer.as_ref());
        manager
            .update_recovery_target(&mut self.store, &local, &upstream, &credentials)
            .await?;
        metrics::record_switchover("repointed");
        t.status.maintenance(format!("Handing over to {}", anointed));
        Ok(Flow::Continue)
    }

    /// The anointed unit waits out the old master's last writes, then
    /// promotes.
    #[instrument(skip_all)]
    pub(super) async fn drain_and_promote_anointed(
        &mut self,
        t: &mut Tick,
        state: &ReplicationState,
    ) -> Result<Flow> {
        let Some(master) = state.master.clone() else {
            return Ok(Flow::Continue);
        };
        let local = t.local().clone();
        let handed_over = t
            .registry
            .peer_facts(&master)
            .is_some_and(|facts| facts.following.as_ref() == Some(&local));
        if !handed_over {
            debug!(master = %master, "Old master not yet following this unit");
            t.status.waiting(format!("Waiting for {} to hand over", master));
            return Ok(Flow::Continue);
        }
        if !t.probe.running {
            return Ok(Flow::Continue);
        }
        let (Some(upstream), Some(credentials)) = (self.endpoint(t, &master), self.credentials(t)) else {
            t.status.waiting(format!("Waiting for {} to hand over", master));
            return Ok(Flow::Continue);
        };

        if self.service().request_lock().await? == LockStatus::Requested {
            t.status.waiting("Waiting for permission to promote");
            t.lock_wanted = true;
            return Ok(Flow::Continue);
        }

        t.status.maintenance(format!("Draining {}", master));
        match self.drain(&upstream, &credentials).await {
            Ok(elapsed) => {
                metrics::record_drain(true, elapsed);
                info!(master = %master, elapsed_ms = elapsed.as_millis() as u64, "Drained old master");
            }
            Err(AgentError::Timeout { elapsed, .. }) => {
                metrics::record_drain(false, elapsed);
                warn!(master = %master, "Drain timed out");
                t.status.blocked(format!("Timed out draining {}", master));
                return Ok(Flow::Halt);
            }
            Err(e) => return Err(e),
        }

        let flow = self.promote_local(t).await?;
        if flow == Flow::Continue {
            metrics::record_switchover("promoted");
        }
        Ok(flow)
    }

    /// Poll until this unit has received everything the old master has.
    async fn drain(&self, master: &PeerEndpoint, credentials: &ReplicationCredentials) -> Result<Duration> {
        let schedule = RetryConfig::polling(self.config.timeouts.poll_interval());
        let mut poller = Poller::new("drain", schedule, self.config.timeouts.drain());
        let mut previous: Option<(Lsn, Lsn)> = None;
        loop {
            let received = match self.deps.db.received_position().await? {
                Some(lsn) => lsn,
                None => self.deps.db.replayed_position().await?.unwrap_or_default(),
            };
            let upstream = retry_transient("probe wal position", &self.retry, || {
                self.deps.peers.wal_position(master.clone(), credentials.clone())
            })
            .await?;

            if received >= upstream {
                debug!(position = %received, "Caught up");
                return Ok(poller.elapsed());
            }
            if previous == Some((received, upstream)) {
                warn!(
                    received = %received,
                    upstream = %upstream,
                    gap_bytes = upstream.bytes_ahead_of(received),
                    "Old master stopped advancing"
                );
                return Ok(poller.elapsed());
            }
            debug!(
                received = %received,
                upstream = %upstream,
                gap_bytes = upstream.bytes_ahead_of(received),
                "Draining"
            );
            previous = Some((received, upstream));
            poller.wait().await?;
        }
    }

    /// Complete (or abandon) the switchover once the anointed unit is
    /// primary or gone.
    #[instrument(skip_all)]
    pub(super) async fn finalize_switchover(&mut self, t: &mut Tick, state: &ReplicationState) -> Result<Flow> {
        let Some(anointed) = state.anointed_master.clone() else {
            return Ok(Flow::Continue);
        };

        if &anointed != t.local() && !t.registry.contains(&anointed) {
            warn!(anointed = %anointed, "Switchover target departed, abandoning switchover");
            self.leader_write(t, LeadershipUpdate::new().anointed_master(None))
                .await?;
            metrics::record_switchover("abandoned");
            return Ok(Flow::Continue);
        }

        info!(master = %anointed, "Finalizing switchover");
        self.leader_write(t, LeadershipUpdate::new().master(&anointed).anointed_master(None))
            .await?;
        metrics::record_switchover("finalized");
        Ok(Flow::Continue)
    }
}
