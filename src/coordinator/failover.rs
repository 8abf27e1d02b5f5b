//! Failover coordination (leader only).
//!
//! ```text
//! master departs
//!      │
//!      ▼
//! record start time ──► stragglers? ──yes──► waiting "Coordinating failover"
//!                           │                (blocked once past failover_quorum,
//!                           │                 unless forced)
//!                           no
//!                           ▼
//!                  probe replayed positions ──► elect ──► master := winner
//! ```
//!
//! A straggler is a unit that still publishes the departed master as its
//! upstream, or has not yet withdrawn its authorization. Electing while
//! one still streams from the dead master risks a diverged timeline.

use super::{Flow, ReplicationAgent, Tick};
use crate::database::{Lsn, PeerEndpoint};
use crate::error::Result;
use crate::evaluator::{failover_stragglers, ReplicationState};
use crate::leadership::LeadershipUpdate;
use crate::metrics;
use crate::resilience::retry_transient;
use crate::store::keys;
use crate::unit::UnitId;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Pick the candidate with the most advanced position.
///
/// Ties go to the lowest [`UnitId`], so the result depends only on the
/// set of candidates and never on their order.
pub fn elect(candidates: &[(UnitId, Lsn)]) -> Option<&UnitId> {
    candidates
        .iter()
        .max_by(|(unit_a, lsn_a), (unit_b, lsn_b)| lsn_a.cmp(lsn_b).then_with(|| unit_b.cmp(unit_a)))
        .map(|(unit, _)| unit)
}

impl ReplicationAgent {
    #[instrument(skip_all, fields(departed = ?state.master.as_ref().map(UnitId::as_str)))]
    pub(super) async fn coordinate_failover(&mut self, t: &mut Tick, state: &ReplicationState) -> Result<Flow> {
        let Some(departed) = state.master.clone() else {
            return Ok(Flow::Continue);
        };

        let now = chrono::Utc::now().timestamp_millis();
        let since = match self.store.get(keys::FAILOVER_SINCE).and_then(|v| v.parse::<i64>().ok()) {
            Some(since) => since,
            None => {
                warn!("Master departed, coordinating failover");
                self.store.set(keys::FAILOVER_SINCE, now.to_string());
                now
            }
        };
        let forced = self.store.flag(keys::FAILOVER_FORCED);

        let stragglers = failover_stragglers(&t.registry, &departed);
        metrics::set_failover_stragglers(stragglers.len());

        if !stragglers.is_empty() && !forced {
            let waited = Duration::from_millis(now.saturating_sub(since).max(0) as u64);
            let names: Vec<&str> = stragglers.iter().map(UnitId::as_str).collect();
            if waited >= self.config.timeouts.failover_quorum() {
                warn!(stragglers = %names.join(","), waited_s = waited.as_secs(), "Failover stalled");
                t.status
                    .blocked(format!("Failover stalled waiting for {}", names.join(", ")));
            } else {
                debug!(stragglers = %names.join(","), "Waiting for units to stop following departed master");
                t.status.waiting("Coordinating failover");
            }
            return Ok(Flow::Continue);
        }

        let excluded: BTreeSet<UnitId> = if forced {
            if !stragglers.is_empty() {
                warn!(count = stragglers.len(), "Failover forced, excluding stragglers");
            }
            stragglers.into_iter().collect()
        } else {
            BTreeSet::new()
        };

        let Some(credentials) = self.credentials(t) else {
            t.status.waiting("Coordinating failover");
            return Ok(Flow::Continue);
        };

        let mut candidates: Vec<(UnitId, Lsn)> = Vec::new();
        let local = t.local().clone();
        if state.cloned && t.probe.running && t.probe.in_recovery && !excluded.contains(&local) {
            match self.deps.db.replayed_position().await {
                Ok(Some(lsn)) => candidates.push((local, lsn)),
                Ok(None) => debug!("Local replay position unknown, not a candidate"),
                Err(e) => warn!(error = %e, "Unable to read local replay position"),
            }
        }

        let endpoints: Vec<PeerEndpoint> = t
            .registry
            .peer_units()
            .filter(|unit| !excluded.contains(*unit))
            .filter_map(|unit| self.endpoint(t, unit))
            .collect();
        for endpoint in endpoints {
            let probed = retry_transient("probe replayed position", &self.retry, || {
                self.deps
                    .peers
                    .replayed_position(endpoint.clone(), credentials.clone())
            })
            .await;
            match probed {
                Ok(lsn) => {
                    debug!(unit = %endpoint.unit, position = %lsn, "Candidate");
                    candidates.push((endpoint.unit, lsn));
                }
                Err(e) => warn!(unit = %endpoint.unit, error = %e, "Excluding unreachable unit from election"),
            }
        }

        let Some(winner) = elect(&candidates).cloned() else {
            warn!("No candidates for master");
            metrics::record_election("no_candidates", 0);
            t.status.blocked("No candidates for master found!");
            return Ok(Flow::Halt);
        };

        info!(master = %winner, candidates = candidates.len(), "Elected new master");
        self.leader_write(t, LeadershipUpdate::new().master(&winner).anointed_master(None))
            .await?;
        self.store.unset(keys::FAILOVER_SINCE);
        self.store.unset(keys::FAILOVER_FORCED);
        metrics::record_election("elected", candidates.len());
        Ok(Flow::Continue)
    }
}
