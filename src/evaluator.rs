// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication State Evaluator.
//!
//! A pure function from (peer registry, leadership record, durable flags,
//! local runtime probe) to the named conditions every rule is keyed on.
//! No I/O and no side effects: calling it twice with the same inputs gives
//! identical results, so the coordinator simply re-evaluates whenever one
//! of its own actions may have changed an input.
//!
//! # Conditions
//!
//! ```text
//! has_peers          peer registry non-empty
//! had_peers          has_peers now or ever (sticky, persisted)
//! is_master          leadership.master == local
//! master_peered      leadership.master in peer registry
//! master_authorized  master_peered && master allows local && master has host
//! has_master         is_master || master_authorized
//! switchover         anointed set && anointed != master && master present
//! is_anointed        switchover && anointed == local
//! is_primary         running && !in_recovery
//! cloned             stored cloned, cleared when primary without being
//!                    master or anointed (diverged timeline)
//! master_departed    master set && !is_master && has_peers && !master_peered
//! failover           master_departed && cloned
//! ```
//!
//! `switchover` needs the master present and `failover` needs it absent,
//! so the two can never hold together.
//!
//! With `manual_replication` every automatic condition is forced off.

use crate::leadership::LeadershipRecord;
use crate::relation::PeerRegistry;
use crate::unit::UnitId;
use std::fmt;

/// Local runtime status, probed once per tick and after local actions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LocalProbe {
    pub running: bool,
    pub in_recovery: bool,
}

impl LocalProbe {
    pub fn primary() -> Self {
        Self {
            running: true,
            in_recovery: false,
        }
    }

    pub fn standby() -> Self {
        Self {
            running: true,
            in_recovery: true,
        }
    }

    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn is_primary(&self) -> bool {
        self.running && !self.in_recovery
    }
}

/// Everything the evaluator reads.
#[derive(Debug, Clone, Copy)]
pub struct EvaluatorInput<'a> {
    pub registry: &'a PeerRegistry,
    pub leadership: &'a LeadershipRecord,
    pub had_peers: bool,
    pub stored_cloned: bool,
    pub probe: LocalProbe,
    pub manual_replication: bool,
}

/// Derived Replication State.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ReplicationState {
    pub master: Option<UnitId>,
    pub anointed_master: Option<UnitId>,
    pub has_peers: bool,
    pub had_peers: bool,
    pub is_master: bool,
    pub master_peered: bool,
    pub master_authorized: bool,
    pub has_master: bool,
    pub switchover: bool,
    pub is_anointed: bool,
    pub is_primary: bool,
    pub is_running: bool,
    pub cloned: bool,
    pub master_departed: bool,
    pub failover: bool,
    pub manual: bool,
}

/// Compute the Derived Replication State.
pub fn evaluate(input: &EvaluatorInput<'_>) -> ReplicationState {
    let registry = input.registry;
    let local = registry.local();
    let master = input.leadership.master.clone();
    let anointed_master = input.leadership.anointed_master.clone();

    let has_peers = registry.has_peers();
    let had_peers = input.had_peers || has_peers;
    let is_running = input.probe.running;
    let is_primary = input.probe.is_primary();

    if input.manual_replication {
        return ReplicationState {
            master,
            anointed_master,
            has_peers,
            had_peers,
            is_primary,
            is_running,
            manual: true,
            ..Default::default()
        };
    }

    let is_master = master.as_ref() == Some(local);
    let master_peered = master.as_ref().is_some_and(|m| registry.contains(m));
    let master_authorized = master_peered
        && master
            .as_ref()
            .and_then(|m| registry.peer_facts(m))
            .is_some_and(|facts| facts.authorizes(local));
    let has_master = is_master || master_authorized;

    let master_present = is_master || master_peered;
    let switchover = match (&anointed_master, &master) {
        (Some(anointed), Some(current)) => anointed != current && master_present,
        _ => false,
    };
    let is_anointed = switchover && anointed_master.as_ref() == Some(local);

    let diverged = is_primary && !is_master && !is_anointed;
    let cloned = input.stored_cloned && !diverged;

    let master_departed = master.is_some() && !is_master && has_peers && !master_peered;
    let failover = master_departed && cloned;

    ReplicationState {
        master,
        anointed_master,
        has_peers,
        had_peers,
        is_master,
        master_peered,
        master_authorized,
        has_master,
        switchover,
        is_anointed,
        is_primary,
        is_running,
        cloned,
        master_departed,
        failover,
        manual: false,
    }
}

/// Coordination phase of the peer group, as seen from one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Stable,
    /// Master gone; some units still follow it.
    CoordinatingFailover,
    /// Master gone; nobody follows it; awaiting election.
    FailingOver,
    /// Anointed set; old master not yet following it.
    SwitchoverInitiated,
    /// Old master follows the anointed unit, which has not promoted yet.
    SwitchoverDraining,
    /// Anointed unit promoted; awaiting finalization by the leader.
    SwitchoverConverging,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::CoordinatingFailover => "coordinating-failover",
            Self::FailingOver => "failing-over",
            Self::SwitchoverInitiated => "switchover-initiated",
            Self::SwitchoverDraining => "switchover-draining",
            Self::SwitchoverConverging => "switchover-converging",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the coordination phase from the state and published facts.
///
/// A departed master means failover only to units taking part in it: the
/// leader, which coordinates, and units that have cloned. A fresh unit that
/// has not seen the master yet is still waiting for it.
pub fn phase(state: &ReplicationState, registry: &PeerRegistry, is_leader: bool) -> Phase {
    let in_failover = state.failover || (is_leader && state.master_departed);
    if let (true, Some(master)) = (in_failover, &state.master) {
        return if failover_stragglers(registry, master).is_empty() {
            Phase::FailingOver
        } else {
            Phase::CoordinatingFailover
        };
    }

    if let (true, Some(master), Some(anointed)) = (state.switchover, &state.master, &state.anointed_master) {
        let master_follows_anointed = registry
            .facts(master)
            .is_some_and(|f| f.following.as_ref() == Some(anointed));
        if !master_follows_anointed {
            return Phase::SwitchoverInitiated;
        }
        let anointed_following = registry.facts(anointed).and_then(|f| f.following.as_ref());
        return if anointed_following.is_some() {
            Phase::SwitchoverDraining
        } else {
            Phase::SwitchoverConverging
        };
    }

    Phase::Stable
}

/// Units (the local one included) that have not yet let go of `departed`.
///
/// A unit still counts while it publishes `departed` as the upstream it
/// follows, or still lists `departed` among the units it authorizes (it has
/// not run a tick since the departure).
pub fn failover_stragglers(registry: &PeerRegistry, departed: &UnitId) -> Vec<UnitId> {
    let local = std::iter::once((registry.local(), registry.local_facts()));
    local
        .chain(registry.all_peers())
        .filter(|(_, facts)| {
            facts.following.as_ref() == Some(departed) || facts.allowed_units.contains(departed)
        })
        .map(|(unit, _)| unit.clone())
        .collect()
}
