// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process substrate shared by several simulated units.
//!
//! A [`MemoryCluster`] plays the part of the orchestrator: one Leadership
//! Record, one relation bag per unit, one leader, one lock table. Each
//! [`MemoryUnit`] is a unit's view onto it. Used for simulation and tests;
//! every write is visible to every unit immediately.

use crate::error::{AgentError, Result};
use crate::lock::{LockStatus, LockTable, RestartLock};
use crate::relation::WireBag;
use crate::status::WorkloadStatus;
use crate::substrate::{BoxFuture, Substrate};
use crate::unit::UnitId;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct ClusterState {
    leader: Option<UnitId>,
    leadership: WireBag,
    bags: BTreeMap<UnitId, WireBag>,
    addresses: BTreeMap<UnitId, String>,
    statuses: BTreeMap<UnitId, WorkloadStatus>,
    locks: LockTable,
}

/// Shared orchestrator state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add a unit to the peer group. The first unit to join becomes leader.
    pub fn join(&self, name: &str, address: &str) -> Result<MemoryUnit> {
        let unit = UnitId::new(name)?;
        let mut state = self.state();
        state.bags.entry(unit.clone()).or_default();
        state.addresses.insert(unit.clone(), address.to_string());
        if state.leader.is_none() {
            state.leader = Some(unit.clone());
        }
        info!(unit = %unit, "Unit joined peer group");
        Ok(MemoryUnit {
            unit,
            cluster: self.clone(),
        })
    }

    /// Remove a unit as if it had been destroyed.
    ///
    /// Its bag disappears from every peer's view, its locks are released
    /// and, if it was leader, leadership passes to the lowest remaining
    /// unit.
    pub fn remove(&self, unit: &UnitId) {
        let mut state = self.state();
        state.bags.remove(unit);
        state.addresses.remove(unit);
        state.locks.release_all(unit);
        if state.leader.as_ref() == Some(unit) {
            state.leader = state.bags.keys().next().cloned();
            debug!(leader = ?state.leader, "Leadership moved after departure");
        }
        info!(unit = %unit, "Unit departed peer group");
    }

    pub fn set_leader(&self, unit: Option<&UnitId>) {
        self.state().leader = unit.cloned();
    }

    pub fn leader(&self) -> Option<UnitId> {
        self.state().leader.clone()
    }

    pub fn leadership(&self) -> WireBag {
        self.state().leadership.clone()
    }

    /// Write leadership settings directly, bypassing the leader check.
    pub fn force_leadership(&self, key: &str, value: Option<&str>) {
        let mut state = self.state();
        match value {
            Some(v) => state.leadership.insert(key.to_string(), v.to_string()),
            None => state.leadership.remove(key),
        };
    }

    pub fn bag(&self, unit: &UnitId) -> Option<WireBag> {
        self.state().bags.get(unit).cloned()
    }

    pub fn status(&self, unit: &UnitId) -> Option<WorkloadStatus> {
        self.state().statuses.get(unit).cloned()
    }

    pub fn lock_holder(&self, lock: &str) -> Option<UnitId> {
        self.state().locks.holder(lock).cloned()
    }

    pub fn units(&self) -> Vec<UnitId> {
        self.state().bags.keys().cloned().collect()
    }
}

/// One unit's handle onto a [`MemoryCluster`].
#[derive(Debug, Clone)]
pub struct MemoryUnit {
    unit: UnitId,
    cluster: MemoryCluster,
}

impl MemoryUnit {
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }

    fn departed(&self) -> AgentError {
        AgentError::Substrate {
            operation: "relation".to_string(),
            message: format!("{} is no longer in the peer group", self.unit),
        }
    }
}

impl Substrate for MemoryUnit {
    fn local_unit(&self) -> &UnitId {
        &self.unit
    }

    fn private_address(&self) -> BoxFuture<'_, String> {
        Box::pin(async move {
            self.cluster
                .state()
                .addresses
                .get(&self.unit)
                .cloned()
                .ok_or_else(|| self.departed())
        })
    }

    fn is_leader(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.cluster.state().leader.as_ref() == Some(&self.unit)) })
    }

    fn leader_get(&self) -> BoxFuture<'_, WireBag> {
        Box::pin(async move { Ok(self.cluster.leadership()) })
    }

    fn leader_set(&self, changes: Vec<(String, Option<String>)>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.cluster.state();
            if state.leader.as_ref() != Some(&self.unit) {
                let keys: Vec<&str> = changes.iter().map(|(k, _)| k.as_str()).collect();
                return Err(AgentError::NotLeader(keys.join(",")));
            }
            for (key, value) in changes {
                match value {
                    Some(v) => state.leadership.insert(key, v),
                    None => state.leadership.remove(&key),
                };
            }
            Ok(())
        })
    }

    fn local_bag(&self) -> BoxFuture<'_, WireBag> {
        Box::pin(async move {
            self.cluster
                .state()
                .bags
                .get(&self.unit)
                .cloned()
                .ok_or_else(|| self.departed())
        })
    }

    fn peer_bags(&self) -> BoxFuture<'_, BTreeMap<UnitId, WireBag>> {
        Box::pin(async move {
            let state = self.cluster.state();
            Ok(state
                .bags
                .iter()
                .filter(|(unit, _)| **unit != self.unit)
                .map(|(unit, bag)| (unit.clone(), bag.clone()))
                .collect())
        })
    }

    fn publish(&self, bag: WireBag) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.cluster.state();
            match state.bags.get_mut(&self.unit) {
                Some(existing) => {
                    *existing = bag;
                    Ok(())
                }
                None => Err(self.departed()),
            }
        })
    }

    fn status_set(&self, status: WorkloadStatus) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.cluster.state().statuses.insert(self.unit.clone(), status);
            Ok(())
        })
    }
}

impl RestartLock for MemoryUnit {
    fn acquire(&self, lock: &'static str) -> BoxFuture<'_, LockStatus> {
        Box::pin(async move { Ok(self.cluster.state().locks.acquire(lock, &self.unit)) })
    }

    fn release(&self, lock: &'static str) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.cluster.state().locks.release(lock, &self.unit);
            Ok(())
        })
    }

    fn is_granted(&self, lock: &'static str) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.cluster.state().locks.is_granted(lock, &self.unit)) })
    }
}
