//! # PostgreSQL Replication Agent
//!
//! A per-unit agent that keeps a group of PostgreSQL units in a single
//! master / many standbys topology, and moves the master role on failover
//! (master lost) and switchover (operator handover).
//!
//! ## Architecture
//!
//! Every unit runs one agent. Agents never talk to each other directly:
//! they coordinate through a substrate that delivers lifecycle events,
//! publishes each unit's facts to its peers, and holds a leader-written
//! Leadership Record.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                         pg-replication-agent                              │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ Substrate   │───►│ Evaluator    │───►│ Rule table (tick)            │  │
//! │  │ (snapshot)  │    │ (pure)       │    │ failover / switchover / ...  │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │         ▲                                      │            │             │
//! │         │ publish + status                     ▼            ▼             │
//! │  ┌─────────────┐                     ┌──────────────┐ ┌──────────────┐   │
//! │  │ UnitStore   │◄────────────────────│ Clone engine │ │ Recovery mgr │   │
//! │  │ (SQLite)    │                     │ (basebackup) │ │ (follow)     │   │
//! │  └─────────────┘                     └──────────────┘ └──────────────┘   │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pg_replication_agent::{AgentConfig, Collaborators, Hook, MemoryCluster, ReplicationAgent};
//! use std::sync::Arc;
//!
//! # async fn example() -> pg_replication_agent::Result<()> {
//! let cluster = MemoryCluster::new();
//! let unit = Arc::new(cluster.join("postgresql/0", "10.0.0.1")?);
//! let config = AgentConfig::default();
//! let deps = Collaborators::postgres(Arc::new(config.clone()), unit.clone(), unit);
//!
//! let mut agent = ReplicationAgent::open(config, deps).await?;
//! let outcome = agent.tick(Hook::Install).await?;
//! println!("{}", outcome.status);
//! agent.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod actions;
pub mod clone;
pub mod config;
pub mod coordinator;
pub mod database;
pub mod error;
pub mod evaluator;
pub mod leadership;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod postgres;
pub mod recovery;
pub mod relation;
pub mod render;
pub mod resilience;
pub mod service;
pub mod status;
pub mod store;
pub mod substrate;
pub mod unit;

// Re-exports for convenience
pub use actions::{ActionError, SwitchoverOutcome};
pub use config::{AgentConfig, PathsConfig, StoreConfig, TimeoutsConfig};
pub use coordinator::{Collaborators, Hook, ReplicationAgent, Rule, TickOutcome};
pub use database::{Lsn, PeerEndpoint, ReplicationCredentials};
pub use error::{AgentError, Result};
pub use evaluator::{evaluate, Phase, ReplicationState};
pub use memory::{MemoryCluster, MemoryUnit};
pub use relation::{PeerFacts, PeerRegistry};
pub use status::{StatusState, WorkloadStatus};
pub use store::UnitStore;
pub use unit::UnitId;
