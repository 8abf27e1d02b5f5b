//! Operator actions.
//!
//! Actions run outside the tick loop, on the leader, and only write the
//! Leadership Record (or a durable flag). The next ticks carry out the
//! consequences.

use crate::coordinator::ReplicationAgent;
use crate::error::AgentError;
use crate::leadership::{LeadershipRecord, LeadershipUpdate};
use crate::metrics;
use crate::relation::PeerRegistry;
use crate::store::keys;
use crate::substrate::apply_leadership;
use crate::unit::UnitId;
use thiserror::Error;
use tracing::{info, warn};

/// Why an action was refused.
#[derive(Error, Debug)]
pub enum ActionError {
    #[error("Only the leader can run this action")]
    NotLeader,

    #[error("Switchover to {0} already in progress")]
    SwitchoverInProgress(String),

    #[error("There is no master")]
    NoMaster,

    #[error("No target unit specified")]
    NoTarget,

    #[error("{0} is not a valid unit")]
    InvalidTarget(String),

    /// The target must already stream from the current master, otherwise
    /// promoting it would lose data.
    #[error("{target} is not replicating from {master}")]
    NotReplicating { target: String, master: String },

    #[error("No failover in progress")]
    NoFailoverInProgress,

    #[error(transparent)]
    Agent(#[from] AgentError),
}

/// Result of a successful switchover request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchoverOutcome {
    Initiated { from: UnitId, to: UnitId },
    /// The target already is the master; nothing to do.
    AlreadyMaster(UnitId),
}

impl ReplicationAgent {
    async fn action_snapshot(&self) -> Result<(LeadershipRecord, PeerRegistry), ActionError> {
        let substrate = &self.collaborators().substrate;
        if !substrate.is_leader().await? {
            return Err(ActionError::NotLeader);
        }
        let leadership = LeadershipRecord::from_settings(&substrate.leader_get().await?);
        let registry = PeerRegistry::from_wire(
            substrate.local_unit().clone(),
            &substrate.local_bag().await?,
            &substrate.peer_bags().await?,
        );
        Ok((leadership, registry))
    }

    /// Hand the master role to `target`, a live unit replicating from the
    /// current master.
    pub async fn switchover(&mut self, target: Option<&str>) -> Result<SwitchoverOutcome, ActionError> {
        let (leadership, registry) = self.action_snapshot().await?;

        if leadership.switchover_pending() {
            let anointed = leadership
                .anointed_master
                .as_ref()
                .map(UnitId::to_string)
                .unwrap_or_default();
            return Err(ActionError::SwitchoverInProgress(anointed));
        }
        let Some(master) = leadership.master else {
            return Err(ActionError::NoMaster);
        };
        let target = target
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ActionError::NoTarget)?;
        let target = UnitId::new(target).map_err(|_| ActionError::InvalidTarget(target.to_string()))?;

        if target == master {
            info!(master = %master, "Switchover target already master");
            return Ok(SwitchoverOutcome::AlreadyMaster(master));
        }
        if &target != registry.local() && !registry.contains(&target) {
            return Err(ActionError::InvalidTarget(target.to_string()));
        }
        let following = registry.facts(&target).and_then(|facts| facts.following.as_ref());
        if following != Some(&master) {
            return Err(ActionError::NotReplicating {
                target: target.to_string(),
                master: master.to_string(),
            });
        }

        apply_leadership(
            self.collaborators().substrate.as_ref(),
            &LeadershipUpdate::new().anointed_master(Some(&target)),
        )
        .await?;
        info!(from = %master, to = %target, "Switchover initiated");
        metrics::record_switchover("initiated");
        Ok(SwitchoverOutcome::Initiated { from: master, to: target })
    }

    /// Let a stalled failover proceed without the units that still hold
    /// on to the departed master. They are excluded from the election.
    pub async fn force_failover(&mut self) -> Result<(), ActionError> {
        let (leadership, registry) = self.action_snapshot().await?;
        let Some(master) = leadership.master else {
            return Err(ActionError::NoMaster);
        };
        let departed = &master != registry.local() && registry.has_peers() && !registry.contains(&master);
        if !departed {
            return Err(ActionError::NoFailoverInProgress);
        }

        warn!(departed = %master, "Forcing failover");
        let store = self.store_mut();
        store.set_flag(keys::FAILOVER_FORCED, true);
        store.flush_dirty().await?;
        Ok(())
    }
}
