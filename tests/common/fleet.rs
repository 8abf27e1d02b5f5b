//! A peer group of agents over one in-memory substrate.

use super::sim::{SimBackup, SimDb, SimInstance, SimProbe, SimWorld};
use pg_replication_agent::coordinator::{Collaborators, Hook, ReplicationAgent, TickOutcome};
use pg_replication_agent::leadership::LeadershipRecord;
use pg_replication_agent::relation::PeerFacts;
use pg_replication_agent::render::FileRenderer;
use pg_replication_agent::resilience::RetryConfig;
use pg_replication_agent::{AgentConfig, MemoryCluster, MemoryUnit, UnitId, UnitStore, WorkloadStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

pub fn unit(name: &str) -> UnitId {
    UnitId::new(name).unwrap()
}

pub struct Fleet {
    pub cluster: MemoryCluster,
    pub world: SimWorld,
    dir: TempDir,
    agents: BTreeMap<UnitId, ReplicationAgent>,
    handles: BTreeMap<UnitId, Arc<MemoryUnit>>,
    joined: usize,
}

impl Fleet {
    pub fn new() -> Self {
        Self {
            cluster: MemoryCluster::new(),
            world: SimWorld::new(),
            dir: TempDir::new().unwrap(),
            agents: BTreeMap::new(),
            handles: BTreeMap::new(),
            joined: 0,
        }
    }

    /// Fleet with `n` units `postgresql/0..n`; the first is leader.
    pub fn with_units(n: usize) -> Self {
        let mut fleet = Self::new();
        for i in 0..n {
            fleet.add(&format!("postgresql/{}", i));
        }
        fleet
    }

    pub fn config_for(&self, name: &str) -> AgentConfig {
        AgentConfig::for_testing(self.dir.path().join(name.replace('/', "-")))
    }

    pub fn add(&mut self, name: &str) -> UnitId {
        let config = self.config_for(name);
        self.add_with_config(name, config)
    }

    pub fn add_with_config(&mut self, name: &str, config: AgentConfig) -> UnitId {
        self.insert(name, config, UnitStore::ephemeral())
    }

    /// Add a unit whose store is a SQLite file in the fleet directory.
    pub async fn add_durable(&mut self, name: &str) -> UnitId {
        let mut config = self.config_for(name);
        let path = self.dir.path().join(format!("{}.db", name.replace('/', "-")));
        config.store.sqlite_path = Some(path.to_string_lossy().to_string());
        let store = UnitStore::from_config(&config.store).await.unwrap();
        self.insert(name, config, store)
    }

    /// Shut an agent down and open it again from its durable store, as
    /// after a process restart.
    pub async fn restart_agent(&mut self, name: &str) {
        let id = unit(name);
        let agent = self.agents.remove(&id).expect("unknown agent");
        let config = agent.config().clone();
        let deps = agent.collaborators().clone();
        agent.shutdown().await;
        let agent = ReplicationAgent::open(config, deps)
            .await
            .unwrap()
            .with_retry(RetryConfig::testing());
        self.agents.insert(id, agent);
    }

    fn insert(&mut self, name: &str, config: AgentConfig, store: UnitStore) -> UnitId {
        self.joined += 1;
        let address = format!("10.0.0.{}", self.joined);
        let handle = Arc::new(self.cluster.join(name, &address).unwrap());
        let id = unit(name);
        self.world.add(&id, &address, config.recovery_conf_path());

        let deps = Collaborators {
            substrate: handle.clone(),
            lock: handle.clone(),
            db: Arc::new(SimDb {
                world: self.world.clone(),
                unit: id.clone(),
            }),
            peers: Arc::new(SimProbe {
                world: self.world.clone(),
            }),
            backup: Arc::new(SimBackup {
                world: self.world.clone(),
                unit: id.clone(),
            }),
            renderer: Arc::new(FileRenderer::new()),
        };
        let agent = ReplicationAgent::new(config, store, deps).with_retry(RetryConfig::testing());
        self.agents.insert(id.clone(), agent);
        self.handles.insert(id.clone(), handle);
        id
    }

    /// Destroy a unit: gone from the substrate, its server gone with it.
    pub fn remove(&mut self, name: &str) {
        let id = unit(name);
        self.cluster.remove(&id);
        self.world.remove(&id);
        self.agents.remove(&id);
        self.handles.remove(&id);
    }

    pub fn agent(&mut self, name: &str) -> &mut ReplicationAgent {
        self.agents.get_mut(&unit(name)).expect("unknown agent")
    }

    pub fn handle(&self, name: &str) -> Arc<MemoryUnit> {
        self.handles.get(&unit(name)).cloned().expect("unknown unit")
    }

    pub async fn tick(&mut self, name: &str, hook: Hook) -> TickOutcome {
        self.agent(name).tick(hook).await.unwrap()
    }

    /// Tick every unit once, in unit order.
    pub async fn round(&mut self, hook: Hook) -> BTreeMap<UnitId, TickOutcome> {
        let ids: Vec<UnitId> = self.agents.keys().cloned().collect();
        let mut outcomes = BTreeMap::new();
        for id in ids {
            let outcome = self.agents.get_mut(&id).unwrap().tick(hook).await.unwrap();
            outcomes.insert(id, outcome);
        }
        outcomes
    }

    /// Run `rounds` update-status rounds and return the last outcomes.
    pub async fn settle(&mut self, rounds: usize) -> BTreeMap<UnitId, TickOutcome> {
        let mut last = BTreeMap::new();
        for _ in 0..rounds {
            last = self.round(Hook::UpdateStatus).await;
        }
        last
    }

    /// Install then settle: the usual way a fresh peer group comes up.
    pub async fn deploy(&mut self) -> BTreeMap<UnitId, TickOutcome> {
        self.round(Hook::Install).await;
        self.settle(3).await
    }

    pub fn leadership(&self) -> LeadershipRecord {
        LeadershipRecord::from_settings(&self.cluster.leadership())
    }

    pub fn master(&self) -> Option<UnitId> {
        self.leadership().master
    }

    pub fn status(&self, name: &str) -> WorkloadStatus {
        self.cluster.status(&unit(name)).expect("no status set")
    }

    pub fn facts(&self, name: &str) -> PeerFacts {
        PeerFacts::from_wire(&self.cluster.bag(&unit(name)).expect("no bag"))
    }

    pub fn instance(&self, name: &str) -> SimInstance {
        self.world.get(&unit(name))
    }

    pub fn update_instance(&self, name: &str, f: impl FnOnce(&mut SimInstance)) {
        self.world.update(&unit(name), f);
    }

    /// Units whose server is writable.
    pub fn primaries(&self) -> Vec<UnitId> {
        self.agents
            .keys()
            .filter(|id| self.world.get(id).is_primary())
            .cloned()
            .collect()
    }

    pub fn units(&self) -> Vec<UnitId> {
        self.agents.keys().cloned().collect()
    }
}
