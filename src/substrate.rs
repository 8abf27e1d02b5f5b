// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event substrate integration traits.
//!
//! The substrate is whatever schedules ticks on each unit: it knows the
//! local unit's identity, who the leader is, holds the Leadership Record,
//! relays relation bags between peers and displays workload status.
//!
//! Reads return owned snapshots. The coordinator takes one snapshot at the
//! start of a tick and never reads the substrate again mid-tick, apart from
//! its own writes which it applies locally.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_replication_agent::substrate::{BoxFuture, Substrate};
//! use pg_replication_agent::relation::WireBag;
//! use pg_replication_agent::status::WorkloadStatus;
//! use pg_replication_agent::unit::UnitId;
//! use std::collections::BTreeMap;
//!
//! struct Standalone { unit: UnitId }
//!
//! impl Substrate for Standalone {
//!     fn local_unit(&self) -> &UnitId { &self.unit }
//!     fn private_address(&self) -> BoxFuture<'_, String> {
//!         Box::pin(async move { Ok("127.0.0.1".to_string()) })
//!     }
//!     fn is_leader(&self) -> BoxFuture<'_, bool> { Box::pin(async move { Ok(true) }) }
//!     fn leader_get(&self) -> BoxFuture<'_, WireBag> { Box::pin(async move { Ok(WireBag::new()) }) }
//!     fn leader_set(&self, _changes: Vec<(String, Option<String>)>) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//!     fn local_bag(&self) -> BoxFuture<'_, WireBag> { Box::pin(async move { Ok(WireBag::new()) }) }
//!     fn peer_bags(&self) -> BoxFuture<'_, BTreeMap<UnitId, WireBag>> {
//!         Box::pin(async move { Ok(BTreeMap::new()) })
//!     }
//!     fn publish(&self, _bag: WireBag) -> BoxFuture<'_, ()> { Box::pin(async move { Ok(()) }) }
//!     fn status_set(&self, _status: WorkloadStatus) -> BoxFuture<'_, ()> {
//!         Box::pin(async move { Ok(()) })
//!     }
//! }
//! ```

use crate::error::Result;
use crate::leadership::LeadershipUpdate;
use crate::relation::WireBag;
use crate::status::WorkloadStatus;
use crate::unit::UnitId;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// What the agent needs from the event substrate.
pub trait Substrate: Send + Sync {
    /// Identity of the unit this agent runs on.
    fn local_unit(&self) -> &UnitId;

    /// Address peers should use to reach this unit's database.
    fn private_address(&self) -> BoxFuture<'_, String>;

    /// Whether this unit currently holds the leader role.
    fn is_leader(&self) -> BoxFuture<'_, bool>;

    /// Current Leadership Record settings.
    fn leader_get(&self) -> BoxFuture<'_, WireBag>;

    /// Write Leadership Record settings. `None` clears a setting.
    ///
    /// Must fail with [`AgentError::NotLeader`](crate::error::AgentError::NotLeader)
    /// if this unit is not the leader.
    fn leader_set(&self, changes: Vec<(String, Option<String>)>) -> BoxFuture<'_, ()>;

    /// This unit's own relation bag as last published.
    fn local_bag(&self) -> BoxFuture<'_, WireBag>;

    /// Bags of every other unit in the peer group.
    fn peer_bags(&self) -> BoxFuture<'_, BTreeMap<UnitId, WireBag>>;

    /// Replace this unit's relation bag.
    fn publish(&self, bag: WireBag) -> BoxFuture<'_, ()>;

    fn status_set(&self, status: WorkloadStatus) -> BoxFuture<'_, ()>;
}

/// Write a [`LeadershipUpdate`] through the substrate.
pub async fn apply_leadership(substrate: &dyn Substrate, update: &LeadershipUpdate) -> Result<()> {
    if update.is_empty() {
        return Ok(());
    }
    let changes = update
        .changes
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect();
    substrate.leader_set(changes).await
}
