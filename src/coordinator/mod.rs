// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication agent coordinator.
//!
//! The per-unit orchestrator that ties together:
//! - The event substrate via [`crate::substrate::Substrate`]
//! - State derivation via [`crate::evaluator`]
//! - Provisioning via [`crate::clone::CloneEngine`]
//! - Recovery targets via [`crate::recovery::RecoveryManager`]
//! - Service handling via [`crate::service::Service`]
//!
//! # Tick Lifecycle
//!
//! ```text
//! snapshot substrate ─► validate/diff config ─► sticky flags
//!        │
//!        ▼
//!   ┌──────────── for rule in Rule::ORDER ────────────┐
//!   │ evaluate ─► predicate? ─► handler ─► Halt? ─────┼──► break
//!   └─────────────────────────────────────────────────┘
//!        │
//!        ▼
//! publish local facts ─► flush store ─► set status
//! ```
//!
//! The peer registry and leadership record are snapshotted once. The
//! leader's own leadership writes are applied to the snapshot so later
//! rules see them; the local bag is edited in place and published once at
//! the end. Nothing else is re-read mid-tick.

mod failover;
mod promotion;
mod switchover;
mod types;

pub use failover::elect;
pub use types::{Flow, Hook, Rule, TickFacts, TickOutcome};

use crate::clone::{CloneEngine, CloneOutcome};
use crate::config::AgentConfig;
use crate::database::{BaseBackup, DatabaseControl, PeerEndpoint, PeerProbe, ReplicationCredentials};
use crate::error::{AgentError, Result};
use crate::evaluator::{self, EvaluatorInput, LocalProbe, Phase, ReplicationState};
use crate::leadership::{generate_password, LeadershipRecord, LeadershipUpdate};
use crate::lock::{LockStatus, RestartLock};
use crate::metrics;
use crate::postgres::{PgBaseBackup, PgControl, PgPeerProbe};
use crate::recovery::{self, RecoveryManager, RecoveryUpdate, Verification};
use crate::relation::{PeerFacts, PeerRegistry};
use crate::render::{ConfigRenderer, FileRenderer};
use crate::resilience::RetryConfig;
use crate::service::{self, Service};
use crate::status::{StatusBoard, StatusState, WorkloadStatus};
use crate::store::{keys, UnitStore};
use crate::substrate::{apply_leadership, Substrate};
use crate::unit::UnitId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// External collaborators of one agent.
#[derive(Clone)]
pub struct Collaborators {
    pub substrate: Arc<dyn Substrate>,
    pub lock: Arc<dyn RestartLock>,
    pub db: Arc<dyn DatabaseControl>,
    pub peers: Arc<dyn PeerProbe>,
    pub backup: Arc<dyn BaseBackup>,
    pub renderer: Arc<dyn ConfigRenderer>,
}

impl Collaborators {
    /// Real PostgreSQL collaborators for the given substrate.
    pub fn postgres(config: Arc<AgentConfig>, substrate: Arc<dyn Substrate>, lock: Arc<dyn RestartLock>) -> Self {
        Self {
            substrate,
            lock,
            db: Arc::new(PgControl::new(Arc::clone(&config))),
            peers: Arc::new(PgPeerProbe::new(Arc::clone(&config))),
            backup: Arc::new(PgBaseBackup::new(config)),
            renderer: Arc::new(FileRenderer::new()),
        }
    }
}

/// State carried through one tick.
struct Tick {
    hook: Hook,
    address: String,
    is_leader: bool,
    registry: PeerRegistry,
    /// Local facts as published when the tick began.
    published: PeerFacts,
    leadership: LeadershipRecord,
    probe: LocalProbe,
    status: StatusBoard,
    /// Some rule is queued for the restart lock.
    lock_wanted: bool,
    fired: Vec<Rule>,
    halted: bool,
}

impl Tick {
    fn local(&self) -> &UnitId {
        self.registry.local()
    }
}

/// Replication agent for one unit.
///
/// Owns the unit's durable store. Every lifecycle event is delivered as a
/// [`tick`](Self::tick); between ticks the agent holds no state beyond
/// what the store persists.
pub struct ReplicationAgent {
    config: Arc<AgentConfig>,
    store: UnitStore,
    deps: Collaborators,
    /// Retry schedule for peer probes.
    retry: RetryConfig,
    phase: Phase,
}

impl ReplicationAgent {
    pub fn new(config: AgentConfig, store: UnitStore, deps: Collaborators) -> Self {
        Self {
            config: Arc::new(config),
            store,
            deps,
            retry: RetryConfig::default(),
            phase: Phase::Stable,
        }
    }

    /// Open the durable store named by the configuration.
    pub async fn open(config: AgentConfig, deps: Collaborators) -> Result<Self> {
        let store = UnitStore::from_config(&config.store).await?;
        Ok(Self::new(config, store, deps))
    }

    /// Override the peer probe retry schedule.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Replace the configuration snapshot. Differences from the last
    /// applied snapshot are acted on in the next tick.
    pub fn set_config(&mut self, config: AgentConfig) {
        self.config = Arc::new(config);
    }

    pub fn store(&self) -> &UnitStore {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut UnitStore {
        &mut self.store
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.deps
    }

    pub fn local_unit(&self) -> &UnitId {
        self.deps.substrate.local_unit()
    }

    /// Coordination phase seen by the most recent tick.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Flush and close the durable store.
    pub async fn shutdown(mut self) {
        if let Err(e) = self.store.flush_dirty().await {
            warn!(error = %e, "Failed to flush unit store on shutdown");
        }
        self.store.close().await;
    }

    /// Run one reconciliation pass.
    ///
    /// Operator-actionable and transient conditions end the tick cleanly
    /// with a `blocked` or `waiting` status. Anything else is reported as
    /// `blocked` and returned.
    pub async fn tick(&mut self, hook: Hook) -> Result<TickOutcome> {
        let span = info_span!("tick", hook = %hook, unit = %self.local_unit());
        async move {
            let started = Instant::now();
            match self.run_tick(hook).await {
                Ok(outcome) => {
                    let label = if outcome.halted { "halted" } else { "completed" };
                    metrics::record_tick(hook.as_str(), label, started.elapsed());
                    Ok(outcome)
                }
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Tick interrupted by transient error");
                    metrics::record_error(e.error_type());
                    metrics::record_tick(hook.as_str(), "retry", started.elapsed());
                    let status = WorkloadStatus::waiting(format!("Retrying: {}", e));
                    self.abandon_tick(&status).await;
                    Ok(TickOutcome {
                        hook,
                        phase: self.phase,
                        status,
                        fired: Vec::new(),
                        halted: true,
                    })
                }
                Err(e) => {
                    error!(error = %e, "Tick failed");
                    metrics::record_error(e.error_type());
                    metrics::record_tick(hook.as_str(), "failed", started.elapsed());
                    self.abandon_tick(&WorkloadStatus::blocked(e.to_string())).await;
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Keep what a failed tick already recorded and report its status.
    async fn abandon_tick(&mut self, status: &WorkloadStatus) {
        match self.service().release_held_lock().await {
            Ok(true) => info!("Released restart lock after failed tick"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "Failed to release restart lock after failed tick"),
        }
        if let Err(e) = self.store.flush_dirty().await {
            warn!(error = %e, "Failed to flush unit store after failed tick");
        }
        if let Err(e) = self.deps.substrate.status_set(status.clone()).await {
            warn!(error = %e, "Failed to set status after failed tick");
        }
        metrics::set_workload_status(status.state.as_str());
    }

    async fn run_tick(&mut self, hook: Hook) -> Result<TickOutcome> {
        let mut t = self.snapshot(hook).await?;

        if let Err(e) = self.config.validate() {
            warn!(error = %e, "Invalid configuration");
            if let AgentError::Config(message) = e {
                t.status.blocked(message);
            } else {
                t.status.blocked(e.to_string());
            }
            t.halted = true;
            return self.finish(t).await;
        }

        if self.apply_config(&mut t)? == Flow::Halt {
            t.halted = true;
            return self.finish(t).await;
        }

        if !self.store.flag(keys::CONFIGURED) {
            if let Some(upstream) = self.store.get(keys::CLONE_FAILED) {
                t.status.blocked(format!("Failed to clone {}", upstream));
                t.halted = true;
                return self.finish(t).await;
            }
        }

        if t.registry.has_peers() {
            self.store.set_flag(keys::HAD_PEERS, true);
        }

        for rule in Rule::ORDER {
            let state = self.evaluate(&t);
            let facts = self.facts(&t, &state);
            self.phase = facts.phase;
            if !state.master_departed && self.store.get(keys::FAILOVER_SINCE).is_some() {
                info!("Failover no longer needed");
                self.store.unset(keys::FAILOVER_SINCE);
                self.store.unset(keys::FAILOVER_FORCED);
            }
            if !rule.applies(&state, &facts) {
                continue;
            }
            debug!(rule = %rule, "Rule fired");
            metrics::record_rule(rule.name());
            t.fired.push(rule);
            if self.dispatch(rule, &mut t, &state).await? == Flow::Halt {
                info!(rule = %rule, "Tick halted");
                t.halted = true;
                break;
            }
        }

        self.finish(t).await
    }

    async fn snapshot(&self, hook: Hook) -> Result<Tick> {
        let substrate = &self.deps.substrate;
        let local = substrate.local_unit().clone();
        let local_bag = substrate.local_bag().await?;
        let peer_bags = substrate.peer_bags().await?;
        let registry = PeerRegistry::from_wire(local, &local_bag, &peer_bags);
        let leadership = LeadershipRecord::from_settings(&substrate.leader_get().await?);
        let is_leader = substrate.is_leader().await?;
        let address = substrate.private_address().await?;

        let running = self.deps.db.is_running().await?;
        let in_recovery = running && self.deps.db.is_in_recovery().await?;

        debug!(
            peers = registry.peer_count(),
            is_leader,
            master = ?leadership.master.as_ref().map(UnitId::as_str),
            running,
            in_recovery,
            "Tick snapshot"
        );

        Ok(Tick {
            hook,
            address,
            is_leader,
            published: registry.local_facts().clone(),
            registry,
            leadership,
            probe: LocalProbe { running, in_recovery },
            status: StatusBoard::new(),
            lock_wanted: false,
            fired: Vec::new(),
            halted: false,
        })
    }

    /// Diff the configuration against the last applied snapshot.
    fn apply_config(&mut self, t: &mut Tick) -> Result<Flow> {
        match self.store.get_json::<AgentConfig>(keys::CONFIG_SNAPSHOT) {
            None => {
                info!(version = %self.config.version, port = self.config.port, "Recording initial configuration");
                self.store.set_json(keys::CONFIG_SNAPSHOT, &*self.config)?;
                self.store.set_flag(keys::CONFIGURED, true);
            }
            Some(previous) => {
                let changes = self.config.changes_since(&previous);
                if let Some(change) = changes.iter().find(|c| c.immutable) {
                    warn!(setting = change.setting, "Refusing to change immutable setting");
                    t.status.blocked(format!("Cannot change {} after install", change.setting));
                    return Ok(Flow::Halt);
                }
                if !changes.is_empty() {
                    let settings: Vec<&str> = changes.iter().map(|c| c.setting).collect();
                    info!(settings = %settings.join(","), "Configuration changed");
                    if changes.iter().any(|c| c.setting == "port") {
                        self.store.set_flag(keys::NEEDS_RESTART, true);
                    }
                    self.store.set_json(keys::CONFIG_SNAPSHOT, &*self.config)?;
                }
            }
        }

        if t.hook.is_operator_action() {
            if let Some(upstream) = self.store.get(keys::CLONE_FAILED).map(str::to_string) {
                info!(upstream = %upstream, "Operator action after failed clone, retrying");
                self.store.unset(keys::CLONE_FAILED);
                self.store.set_flag(keys::CONFIGURED, true);
            }
        }
        Ok(Flow::Continue)
    }

    fn evaluate(&self, t: &Tick) -> ReplicationState {
        evaluator::evaluate(&EvaluatorInput {
            registry: &t.registry,
            leadership: &t.leadership,
            had_peers: self.store.flag(keys::HAD_PEERS),
            stored_cloned: self.store.flag(keys::CLONED),
            probe: t.probe,
            manual_replication: self.config.manual_replication,
        })
    }

    fn facts(&self, t: &Tick, state: &ReplicationState) -> TickFacts {
        let anointed_gone = state
            .anointed_master
            .as_ref()
            .is_some_and(|a| a != t.local() && !t.registry.contains(a));
        TickFacts {
            is_leader: t.is_leader,
            has_password: t.leadership.replication_password.is_some(),
            configured: self.store.flag(keys::CONFIGURED),
            following: self.store.get_unit(keys::FOLLOWING),
            published_following: t.registry.local_facts().following.clone(),
            needs_restart: self.store.flag(keys::NEEDS_RESTART),
            needs_reload: self.store.flag(keys::NEEDS_RELOAD),
            confirmed: self.store.flag(keys::CONFIRMED),
            lock_wanted: t.lock_wanted,
            phase: evaluator::phase(state, &t.registry, t.is_leader),
            anointed_gone,
        }
    }

    async fn dispatch(&mut self, rule: Rule, t: &mut Tick, state: &ReplicationState) -> Result<Flow> {
        match rule {
            Rule::EnsureReplicationCredentials => self.ensure_replication_credentials(t).await,
            Rule::AppointInitialMaster => self.appoint_initial_master(t).await,
            Rule::AppointStandaloneMaster => self.appoint_standalone_master(t).await,
            Rule::PublishReplicationDetails => Ok(self.publish_replication_details(t)),
            Rule::WaitForPeers => {
                t.status.waiting("Waiting for peers");
                Ok(Flow::Continue)
            }
            Rule::WaitForMaster => {
                if let Some(master) = &state.master {
                    debug!(master = %master, "Master not yet authorizing this unit");
                }
                t.status.waiting("Waiting for master");
                Ok(Flow::Continue)
            }
            Rule::DetachFromDepartedMaster => self.detach_from_departed_master(t).await,
            Rule::CoordinateFailover => self.coordinate_failover(t, state).await,
            Rule::WaitForFailover => {
                if let Some(master) = &state.master {
                    t.status.waiting(format!("Waiting for failover from {}", master));
                }
                Ok(Flow::Continue)
            }
            Rule::RepointOldMaster => self.repoint_old_master(t, state).await,
            Rule::DrainAndPromoteAnointed => self.drain_and_promote_anointed(t, state).await,
            Rule::FinalizeSwitchover => self.finalize_switchover(t, state).await,
            Rule::PromoteMaster => self.promote_master(t).await,
            Rule::EnsureReplicationUser => self.ensure_replication_user(t).await,
            Rule::CloneMaster => self.clone_master(t, state).await,
            Rule::FollowMaster => self.follow_master(t, state).await,
            Rule::RestartService => self.restart_service(t).await,
            Rule::ReloadService => self.reload_service().await,
            Rule::StartService => self.start_service(t).await,
            Rule::PublishFollowing => {
                let following = self.store.get_unit(keys::FOLLOWING);
                info!(following = ?following.as_ref().map(UnitId::as_str), "Publishing following pointer");
                t.registry.local_facts_mut().following = following;
                Ok(Flow::Continue)
            }
            Rule::VerifyReplication => self.verify_replication(t).await,
            Rule::ReleaseRestartLock => {
                self.service().release_lock().await?;
                Ok(Flow::Continue)
            }
            Rule::SetActive => {
                // Maintenance messages describe work this tick finished.
                let settled = t
                    .status
                    .current()
                    .map_or(true, |status| status.state == StatusState::Maintenance);
                if settled {
                    t.status.set(active_status(state));
                }
                Ok(Flow::Continue)
            }
        }
    }

    /// Publish, flush and report. Runs for halted ticks too.
    async fn finish(&mut self, t: Tick) -> Result<TickOutcome> {
        let state = self.evaluate(&t);

        // Halted ticks never reach the release rule.
        if t.halted && !t.lock_wanted {
            self.service().release_lock().await?;
        }

        if t.registry.local_facts() != &t.published {
            let bag = t.registry.local_facts().to_wire();
            debug!(keys = bag.len(), "Publishing local facts");
            self.deps.substrate.publish(bag).await?;
        }

        let status = t.status.into_status().unwrap_or_else(|| active_status(&state));
        let previous = self.store.get_json::<WorkloadStatus>(keys::STATUS);
        if previous.as_ref() != Some(&status) {
            if status.is_blocked() {
                warn!(status = %status, "Status changed");
            } else {
                info!(status = %status, "Status changed");
            }
            self.store.set_json(keys::STATUS, &status)?;
        }
        self.deps.substrate.status_set(status.clone()).await?;

        let flushed = self.store.flush_dirty().await?;
        debug!(flushed, "Unit store flushed");

        metrics::set_role(state.is_master, state.is_primary, state.is_running);
        metrics::set_peer_count(t.registry.peer_count());
        metrics::set_workload_status(status.state.as_str());
        metrics::set_phase(self.phase.as_str());

        Ok(TickOutcome {
            hook: t.hook,
            phase: self.phase,
            status,
            fired: t.fired,
            halted: t.halted,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Shared helpers
    // ═══════════════════════════════════════════════════════════════════════

    fn service(&self) -> Service<'_> {
        Service::new(self.deps.db.as_ref(), self.deps.lock.as_ref())
    }

    fn credentials(&self, t: &Tick) -> Option<ReplicationCredentials> {
        t.leadership
            .replication_password
            .as_ref()
            .map(|password| ReplicationCredentials {
                username: self.config.replication_username.clone(),
                password: password.clone(),
            })
    }

    /// Connection endpoint a unit has published, if it has a host.
    fn endpoint(&self, t: &Tick, unit: &UnitId) -> Option<PeerEndpoint> {
        let facts = t.registry.facts(unit)?;
        Some(PeerEndpoint {
            unit: unit.clone(),
            host: facts.host.clone()?,
            port: facts.port.unwrap_or(self.config.port),
        })
    }

    /// Write leadership settings and apply them to this tick's snapshot.
    async fn leader_write(&self, t: &mut Tick, update: LeadershipUpdate) -> Result<()> {
        apply_leadership(self.deps.substrate.as_ref(), &update).await?;
        t.leadership.apply(&update);
        Ok(())
    }

    async fn refresh_probe(&self, t: &mut Tick) -> Result<()> {
        let running = self.deps.db.is_running().await?;
        let in_recovery = running && self.deps.db.is_in_recovery().await?;
        t.probe = LocalProbe { running, in_recovery };
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Handlers
    // ═══════════════════════════════════════════════════════════════════════

    async fn ensure_replication_credentials(&mut self, t: &mut Tick) -> Result<Flow> {
        info!("Generating replication password");
        self.leader_write(t, LeadershipUpdate::new().replication_password(generate_password()))
            .await?;
        Ok(Flow::Continue)
    }

    async fn appoint_initial_master(&mut self, t: &mut Tick) -> Result<Flow> {
        let local = t.local().clone();
        info!(master = %local, "Appointing initial master");
        self.leader_write(t, LeadershipUpdate::new().master(&local)).await?;
        self.store.set_flag(keys::CLONED, true);
        Ok(Flow::Continue)
    }

    async fn appoint_standalone_master(&mut self, t: &mut Tick) -> Result<Flow> {
        let local = t.local().clone();
        warn!(master = %local, "Last unit standing, appointing self as master");
        self.leader_write(t, LeadershipUpdate::new().master(&local).anointed_master(None))
            .await?;
        self.store.set_flag(keys::CLONED, true);
        Ok(Flow::Continue)
    }

    fn publish_replication_details(&self, t: &mut Tick) -> Flow {
        let allowed = t.registry.peer_units().cloned().collect();
        let facts = t.registry.local_facts_mut();
        facts.host = Some(t.address.clone());
        facts.port = Some(self.config.port);
        facts.allowed_units = allowed;
        Flow::Continue
    }

    async fn detach_from_departed_master(&mut self, t: &mut Tick) -> Result<Flow> {
        let local = t.local().clone();
        let manager = RecoveryManager::new(&self.config, self.deps.renderer.as_ref());
        manager.detach(&mut self.store, &local).await?;
        Ok(Flow::Continue)
    }

    async fn ensure_replication_user(&mut self, t: &mut Tick) -> Result<Flow> {
        if let Some(credentials) = self.credentials(t) {
            self.deps.db.ensure_replication_user(credentials).await?;
        }
        Ok(Flow::Continue)
    }

    async fn clone_master(&mut self, t: &mut Tick, state: &ReplicationState) -> Result<Flow> {
        let Some(master) = state.master.clone() else {
            return Ok(Flow::Continue);
        };
        let (Some(upstream), Some(credentials)) = (self.endpoint(t, &master), self.credentials(t)) else {
            t.status.waiting("Waiting for master");
            return Ok(Flow::Continue);
        };

        if self.service().request_lock().await? == LockStatus::Requested {
            t.status.waiting(format!("Waiting for permission to clone {}", master));
            t.lock_wanted = true;
            return Ok(Flow::Continue);
        }

        if t.probe.running {
            info!("Stopping PostgreSQL before clone");
            if let Err(e) = self.service().stop().await {
                error!(error = %e, "Failed to stop PostgreSQL");
                t.status.blocked("Failed to stop PostgreSQL");
                return Ok(Flow::Halt);
            }
            self.refresh_probe(t).await?;
        }

        t.status.maintenance(format!("Cloning {}", master));
        let engine = CloneEngine::new(
            &self.config,
            self.deps.db.as_ref(),
            self.deps.backup.as_ref(),
            self.deps.lock.as_ref(),
        );
        match engine
            .clone_from(&mut self.store, state.is_master, &upstream, credentials)
            .await?
        {
            CloneOutcome::Cloned => Ok(Flow::Continue),
            CloneOutcome::Failed { message } => {
                warn!(master = %master, error = %message, "Clone failed");
                t.status.blocked(format!("Failed to clone {}", master));
                Ok(Flow::Halt)
            }
        }
    }

    async fn follow_master(&mut self, t: &mut Tick, state: &ReplicationState) -> Result<Flow> {
        let Some(master) = state.master.clone() else {
            return Ok(Flow::Continue);
        };
        let (Some(upstream), Some(credentials)) = (self.endpoint(t, &master), self.credentials(t)) else {
            t.status.waiting("Waiting for master");
            return Ok(Flow::Continue);
        };
        let local = t.local().clone();
        let manager = RecoveryManager::new(&self.config, self.deps.renderer.as_ref());
        let update = manager
            .update_recovery_target(&mut self.store, &local, &upstream, &credentials)
            .await?;
        if let RecoveryUpdate::Retargeted { previous } = update {
            info!(
                master = %master,
                previous = ?previous.as_ref().map(UnitId::as_str),
                "Following master"
            );
        }
        Ok(Flow::Continue)
    }

    async fn restart_service(&mut self, t: &mut Tick) -> Result<Flow> {
        if !t.probe.running {
            return self.start_service(t).await;
        }
        if self.service().request_lock().await? == LockStatus::Requested {
            t.status.waiting("Waiting for permission to restart");
            t.lock_wanted = true;
            return Ok(Flow::Continue);
        }
        let result = Service::new(self.deps.db.as_ref(), self.deps.lock.as_ref())
            .restart(&mut self.store)
            .await;
        if let Err(e) = result {
            error!(error = %e, "Failed to restart PostgreSQL");
            t.status.blocked("Failed to restart PostgreSQL");
            return Ok(Flow::Halt);
        }
        self.refresh_probe(t).await?;
        Ok(Flow::Continue)
    }

    async fn reload_service(&mut self) -> Result<Flow> {
        if let Err(e) = Service::new(self.deps.db.as_ref(), self.deps.lock.as_ref())
            .reload(&mut self.store)
            .await
        {
            debug!(error = %e, "Reload will be retried next tick");
        }
        Ok(Flow::Continue)
    }

    async fn start_service(&mut self, t: &mut Tick) -> Result<Flow> {
        if let Err(e) = Service::new(self.deps.db.as_ref(), self.deps.lock.as_ref())
            .start(&mut self.store)
            .await
        {
            error!(error = %e, "Failed to start PostgreSQL");
            t.status.blocked("Failed to start PostgreSQL");
            return Ok(Flow::Halt);
        }
        self.refresh_probe(t).await?;
        Ok(Flow::Continue)
    }

    async fn verify_replication(&mut self, t: &mut Tick) -> Result<Flow> {
        let Some(upstream) = self.store.get_unit(keys::FOLLOWING) else {
            return Ok(Flow::Continue);
        };
        let (Some(endpoint), Some(credentials)) = (self.endpoint(t, &upstream), self.credentials(t)) else {
            return Ok(Flow::Continue);
        };
        let verification = recovery::verify_replication(
            &mut self.store,
            &self.config,
            self.deps.peers.as_ref(),
            &endpoint,
            &credentials,
            &t.address,
        )
        .await;
        match verification {
            Verification::Confirmed => {}
            Verification::Pending { .. } => {
                t.status.waiting(format!("Waiting for replication from {}", upstream));
            }
            Verification::Stalled { .. } => {
                t.status.blocked(format!("Replication from {} not flowing", upstream));
            }
        }
        Ok(Flow::Continue)
    }
}

/// Status for a unit with nothing left to do, including the old master
/// waiting on a switchover.
fn active_status(state: &ReplicationState) -> WorkloadStatus {
    match (&state.anointed_master, state.switchover && state.is_master && state.is_running) {
        (Some(anointed), true) => WorkloadStatus::waiting(format!("Handing over to {}", anointed)),
        _ => service::active_status(state),
    }
}
