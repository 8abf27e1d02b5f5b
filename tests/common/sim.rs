//! Simulated PostgreSQL instances.
//!
//! One [`SimWorld`] holds an instance per unit. [`SimDb`], [`SimProbe`] and
//! [`SimBackup`] implement the database traits against it, so a peer probe
//! from one unit sees the state another unit's agent left behind.
//!
//! Recovery configuration is real: agents render it to disk with the file
//! renderer, and `start` reads it back to decide whether the instance comes
//! up in recovery and which host it streams from.

use pg_replication_agent::database::{
    BackupRequest, BaseBackup, DatabaseControl, Lsn, PeerEndpoint, PeerProbe, ReplicationCredentials,
};
use pg_replication_agent::error::AgentError;
use pg_replication_agent::substrate::BoxFuture;
use pg_replication_agent::UnitId;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// One simulated server.
#[derive(Debug, Clone)]
pub struct SimInstance {
    pub address: String,
    pub recovery_conf: PathBuf,
    pub running: bool,
    pub in_recovery: bool,
    /// Host this instance streams from, read from its recovery file at start.
    pub streaming_from: Option<String>,
    pub received: Lsn,
    pub replayed: Lsn,
    pub wal: Lsn,
    /// Report no replay position.
    pub replay_unknown: bool,
    /// Peer probes against this instance fail.
    pub unreachable: bool,
    /// Remaining WAL position queries that find this instance a little
    /// further ahead than the last one did.
    pub advancing: usize,
    pub fail_backup: bool,
    pub fail_promote: bool,
    /// `promote` succeeds but the instance never leaves recovery.
    pub promote_stuck: bool,
    pub fail_start: bool,
    pub fail_stop: bool,
    pub replication_user: Option<ReplicationCredentials>,
    pub clones: usize,
    pub promotions: usize,
    pub restarts: usize,
    pub dropped: bool,
}

impl SimInstance {
    fn new(address: &str, recovery_conf: PathBuf) -> Self {
        Self {
            address: address.to_string(),
            recovery_conf,
            running: false,
            in_recovery: false,
            streaming_from: None,
            received: Lsn(0),
            replayed: Lsn(0),
            wal: Lsn(0),
            replay_unknown: false,
            unreachable: false,
            advancing: 0,
            fail_backup: false,
            fail_promote: false,
            promote_stuck: false,
            fail_start: false,
            fail_stop: false,
            replication_user: None,
            clones: 0,
            promotions: 0,
            restarts: 0,
            dropped: false,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.running && !self.in_recovery
    }
}

/// Bytes an advancing instance writes between two queries.
pub const WAL_STEP: u64 = 16;

/// All simulated servers.
#[derive(Debug, Clone, Default)]
pub struct SimWorld {
    instances: Arc<Mutex<BTreeMap<UnitId, SimInstance>>>,
    /// Calls to `ensure_replication_user` across all units.
    pub user_updates: Arc<AtomicUsize>,
}

impl SimWorld {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<UnitId, SimInstance>> {
        self.instances.lock().unwrap()
    }

    pub fn add(&self, unit: &UnitId, address: &str, recovery_conf: PathBuf) {
        self.lock()
            .insert(unit.clone(), SimInstance::new(address, recovery_conf));
    }

    pub fn remove(&self, unit: &UnitId) {
        self.lock().remove(unit);
    }

    pub fn get(&self, unit: &UnitId) -> SimInstance {
        self.lock().get(unit).cloned().expect("unknown instance")
    }

    pub fn update(&self, unit: &UnitId, f: impl FnOnce(&mut SimInstance)) {
        let mut instances = self.lock();
        f(instances.get_mut(unit).expect("unknown instance"));
    }

    fn with<T>(&self, unit: &UnitId, f: impl FnOnce(&mut SimInstance) -> T) -> Result<T, AgentError> {
        let mut instances = self.lock();
        let instance = instances
            .get_mut(unit)
            .ok_or_else(|| AgentError::Internal(format!("no instance for {}", unit)))?;
        Ok(f(instance))
    }

    /// Bring an instance up, reading its recovery file like the server would.
    fn boot(&self, unit: &UnitId) -> Result<(), AgentError> {
        let path = self.with(unit, |i| i.recovery_conf.clone())?;
        let recovery = std::fs::read_to_string(&path).ok();
        self.with(unit, |i| {
            if i.fail_start {
                return Err(AgentError::database_msg("start", "pg_ctl start failed"));
            }
            i.running = true;
            i.in_recovery = recovery.is_some();
            i.streaming_from = recovery.as_deref().and_then(conninfo_host);
            Ok(())
        })?
    }
}

/// Host from a rendered `primary_conninfo` line.
fn conninfo_host(recovery: &str) -> Option<String> {
    let start = recovery.find("host=''")? + "host=''".len();
    let rest = &recovery[start..];
    let end = rest.find("''")?;
    Some(rest[..end].to_string())
}

/// Local control surface of one simulated server.
pub struct SimDb {
    pub world: SimWorld,
    pub unit: UnitId,
}

impl DatabaseControl for SimDb {
    fn is_running(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { self.world.with(&self.unit, |i| i.running) })
    }

    fn is_in_recovery(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.world.with(&self.unit, |i| {
                if i.running {
                    Ok(i.in_recovery)
                } else {
                    Err(AgentError::database_msg("pg_is_in_recovery", "server not running"))
                }
            })?
        })
    }

    fn start(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move { self.world.boot(&self.unit) })
    }

    fn stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.world.with(&self.unit, |i| {
                if i.fail_stop {
                    return Err(AgentError::database_msg("stop", "pg_ctl stop failed"));
                }
                i.running = false;
                i.restarts += 1;
                Ok(())
            })?
        })
    }

    fn reload(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let path = self.world.with(&self.unit, |i| i.recovery_conf.clone())?;
            let recovery = std::fs::read_to_string(&path).ok();
            self.world.with(&self.unit, |i| {
                if i.in_recovery {
                    i.streaming_from = recovery.as_deref().and_then(conninfo_host);
                }
            })
        })
    }

    fn promote(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.world.with(&self.unit, |i| {
                if i.fail_promote {
                    return Err(AgentError::database_msg("promote", "pg_ctl promote failed"));
                }
                i.promotions += 1;
                if !i.promote_stuck {
                    i.in_recovery = false;
                    i.streaming_from = None;
                    i.wal = i.wal.max(i.replayed).max(i.received);
                }
                Ok(())
            })?
        })
    }

    fn drop_cluster(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.world.with(&self.unit, |i| {
                i.running = false;
                i.dropped = true;
            })
        })
    }

    fn received_position(&self) -> BoxFuture<'_, Option<Lsn>> {
        Box::pin(async move { self.world.with(&self.unit, |i| i.in_recovery.then_some(i.received)) })
    }

    fn replayed_position(&self) -> BoxFuture<'_, Option<Lsn>> {
        Box::pin(async move {
            self.world
                .with(&self.unit, |i| (i.in_recovery && !i.replay_unknown).then_some(i.replayed))
        })
    }

    fn ensure_replication_user(&self, credentials: ReplicationCredentials) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.world.user_updates.fetch_add(1, Ordering::SeqCst);
            self.world
                .with(&self.unit, |i| i.replication_user = Some(credentials))
        })
    }
}

/// Peer queries against the simulated servers.
pub struct SimProbe {
    pub world: SimWorld,
}

impl SimProbe {
    fn reachable(&self, peer: &PeerEndpoint) -> Result<SimInstance, AgentError> {
        let instance = self
            .world
            .lock()
            .get(&peer.unit)
            .cloned()
            .ok_or_else(|| AgentError::PeerConnection {
                unit: peer.unit.to_string(),
                message: "no route to host".to_string(),
            })?;
        if instance.unreachable || !instance.running {
            return Err(AgentError::PeerConnection {
                unit: peer.unit.to_string(),
                message: "connection refused".to_string(),
            });
        }
        Ok(instance)
    }
}

impl PeerProbe for SimProbe {
    fn replayed_position(&self, peer: PeerEndpoint, _credentials: ReplicationCredentials) -> BoxFuture<'_, Lsn> {
        Box::pin(async move {
            let instance = self.reachable(&peer)?;
            if !instance.in_recovery || instance.replay_unknown {
                return Err(AgentError::database_msg("replay position", "not in recovery"));
            }
            Ok(instance.replayed)
        })
    }

    fn wal_position(&self, peer: PeerEndpoint, _credentials: ReplicationCredentials) -> BoxFuture<'_, Lsn> {
        Box::pin(async move {
            self.reachable(&peer)?;
            self.world.with(&peer.unit, |i| {
                if i.advancing > 0 {
                    i.advancing -= 1;
                    i.received = Lsn(i.received.0 + WAL_STEP);
                    i.wal = Lsn(i.wal.0 + WAL_STEP);
                }
                if i.in_recovery {
                    i.received
                } else {
                    i.wal
                }
            })
        })
    }

    fn is_replicating(
        &self,
        upstream: PeerEndpoint,
        _credentials: ReplicationCredentials,
        client_host: String,
    ) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.reachable(&upstream)?;
            let instances = self.world.lock();
            Ok(instances.values().any(|i| {
                i.address == client_host
                    && i.running
                    && i.in_recovery
                    && i.streaming_from.as_deref() == Some(upstream.host.as_str())
            }))
        })
    }
}

/// Base backup that copies positions from the upstream instance.
pub struct SimBackup {
    pub world: SimWorld,
    pub unit: UnitId,
}

impl BaseBackup for SimBackup {
    fn run(&self, request: BackupRequest) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let upstream = self.world.get(&request.upstream.unit);
            self.world.with(&self.unit, |i| {
                i.clones += 1;
                if i.fail_backup {
                    return Err(AgentError::BackupFailed {
                        upstream: request.upstream.unit.to_string(),
                        message: "pg_basebackup exited with status 1".to_string(),
                    });
                }
                let position = upstream.wal.max(upstream.received);
                i.received = position;
                i.replayed = position;
                i.wal = position;
                i.dropped = false;
                Ok(())
            })?
        })
    }
}
