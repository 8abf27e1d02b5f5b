//! Tick types and the rule table.
//!
//! # Rule Table
//!
//! Every tick walks [`Rule::ORDER`] top to bottom. Before each rule the
//! state is re-evaluated (an earlier rule may have changed leadership, the
//! store or the local server) and the rule's predicate decides whether it
//! fires. A handler may end the tick early with [`Flow::Halt`].
//!
//! ```text
//!  1 ensure_replication_credentials  leader, no password
//!  2 appoint_initial_master          leader, no master
//!  3 appoint_standalone_master       leader, had peers, none left, not master
//!  4 publish_replication_details     has peers
//!  5 wait_for_peers                  not leader, never had peers
//!  6 wait_for_master                 master peered but not yet usable
//!  7 detach_from_departed_master     master departed, still following it
//!  8 coordinate_failover             leader, master departed
//!  9 wait_for_failover               not leader, master departed
//! 10 repoint_old_master              switchover, master, not following anointed
//! 11 drain_and_promote_anointed      anointed, still following
//! 12 finalize_switchover             leader, switchover converged or abandoned
//! 13 promote_master                  master, running standby, no switchover
//! 14 ensure_replication_user         master, primary, password set
//! 15 clone_master                    configured, authorized, not cloned
//! 16 follow_master                   authorized, cloned, not master/anointed
//! 17 restart_service                 restart pending
//! 18 reload_service                  reload pending, running
//! 19 start_service                   stopped, has something to run as
//! 20 publish_following               pointer differs from published, settled
//! 21 verify_replication              standby, following, unconfirmed
//! 22 release_restart_lock            no rule wanted the lock this tick
//! 23 set_active                      no waiting or blocked status claimed
//! ```

use crate::evaluator::{Phase, ReplicationState};
use crate::status::WorkloadStatus;
use crate::unit::UnitId;
use std::fmt;

/// Lifecycle event that triggered a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    Install,
    ConfigChanged,
    Start,
    LeaderElected,
    LeaderSettingsChanged,
    PeerJoined,
    PeerChanged,
    PeerDeparted,
    UpdateStatus,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::ConfigChanged => "config-changed",
            Self::Start => "start",
            Self::LeaderElected => "leader-elected",
            Self::LeaderSettingsChanged => "leader-settings-changed",
            Self::PeerJoined => "replication-relation-joined",
            Self::PeerChanged => "replication-relation-changed",
            Self::PeerDeparted => "replication-relation-departed",
            Self::UpdateStatus => "update-status",
        }
    }

    /// Hooks that follow an operator's configuration action.
    pub fn is_operator_action(&self) -> bool {
        matches!(self, Self::Install | Self::ConfigChanged)
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the tick carries on after a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop running rules. The tick still publishes, flushes and reports.
    Halt,
}

/// Facts a predicate may consult besides the Derived Replication State.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickFacts {
    pub is_leader: bool,
    pub has_password: bool,
    pub configured: bool,
    /// Following Pointer from the durable store.
    pub following: Option<UnitId>,
    /// Following Pointer as currently published.
    pub published_following: Option<UnitId>,
    pub needs_restart: bool,
    pub needs_reload: bool,
    pub confirmed: bool,
    pub lock_wanted: bool,
    pub phase: Phase,
    /// Switchover target no longer exists.
    pub anointed_gone: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rule {
    EnsureReplicationCredentials,
    AppointInitialMaster,
    AppointStandaloneMaster,
    PublishReplicationDetails,
    WaitForPeers,
    WaitForMaster,
    DetachFromDepartedMaster,
    CoordinateFailover,
    WaitForFailover,
    RepointOldMaster,
    DrainAndPromoteAnointed,
    FinalizeSwitchover,
    PromoteMaster,
    EnsureReplicationUser,
    CloneMaster,
    FollowMaster,
    RestartService,
    ReloadService,
    StartService,
    PublishFollowing,
    VerifyReplication,
    ReleaseRestartLock,
    SetActive,
}

impl Rule {
    pub const ORDER: [Rule; 23] = [
        Rule::EnsureReplicationCredentials,
        Rule::AppointInitialMaster,
        Rule::AppointStandaloneMaster,
        Rule::PublishReplicationDetails,
        Rule::WaitForPeers,
        Rule::WaitForMaster,
        Rule::DetachFromDepartedMaster,
        Rule::CoordinateFailover,
        Rule::WaitForFailover,
        Rule::RepointOldMaster,
        Rule::DrainAndPromoteAnointed,
        Rule::FinalizeSwitchover,
        Rule::PromoteMaster,
        Rule::EnsureReplicationUser,
        Rule::CloneMaster,
        Rule::FollowMaster,
        Rule::RestartService,
        Rule::ReloadService,
        Rule::StartService,
        Rule::PublishFollowing,
        Rule::VerifyReplication,
        Rule::ReleaseRestartLock,
        Rule::SetActive,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::EnsureReplicationCredentials => "ensure_replication_credentials",
            Self::AppointInitialMaster => "appoint_initial_master",
            Self::AppointStandaloneMaster => "appoint_standalone_master",
            Self::PublishReplicationDetails => "publish_replication_details",
            Self::WaitForPeers => "wait_for_peers",
            Self::WaitForMaster => "wait_for_master",
            Self::DetachFromDepartedMaster => "detach_from_departed_master",
            Self::CoordinateFailover => "coordinate_failover",
            Self::WaitForFailover => "wait_for_failover",
            Self::RepointOldMaster => "repoint_old_master",
            Self::DrainAndPromoteAnointed => "drain_and_promote_anointed",
            Self::FinalizeSwitchover => "finalize_switchover",
            Self::PromoteMaster => "promote_master",
            Self::EnsureReplicationUser => "ensure_replication_user",
            Self::CloneMaster => "clone_master",
            Self::FollowMaster => "follow_master",
            Self::RestartService => "restart_service",
            Self::ReloadService => "reload_service",
            Self::StartService => "start_service",
            Self::PublishFollowing => "publish_following",
            Self::VerifyReplication => "verify_replication",
            Self::ReleaseRestartLock => "release_restart_lock",
            Self::SetActive => "set_active",
        }
    }

    /// Whether this rule fires for the given state.
    pub fn applies(&self, s: &ReplicationState, f: &TickFacts) -> bool {
        let automatic = !s.manual;
        match self {
            Self::EnsureReplicationCredentials => f.is_leader && !f.has_password,
            Self::AppointInitialMaster => automatic && f.is_leader && s.master.is_none(),
            Self::AppointStandaloneMaster => {
                automatic && f.is_leader && s.had_peers && !s.has_peers && s.master.is_some() && !s.is_master
            }
            Self::PublishReplicationDetails => s.has_peers,
            Self::WaitForPeers => automatic && !f.is_leader && !s.had_peers,
            Self::WaitForMaster => {
                let in_failover = s.failover || (f.is_leader && s.master_departed);
                automatic && s.master.is_some() && s.has_peers && !s.has_master && !in_failover
            }
            Self::DetachFromDepartedMaster => {
                s.master_departed && f.following.is_some() && f.following == s.master
            }
            Self::CoordinateFailover => f.is_leader && s.master_departed,
            Self::WaitForFailover => !f.is_leader && s.failover,
            Self::RepointOldMaster => {
                s.switchover && s.is_master && f.following != s.anointed_master
            }
            Self::DrainAndPromoteAnointed => s.is_anointed && f.following.is_some(),
            Self::FinalizeSwitchover => {
                f.is_leader
                    && s.anointed_master.is_some()
                    && (f.anointed_gone || (s.switchover && f.phase == Phase::SwitchoverConverging))
            }
            Self::PromoteMaster => s.is_master && s.is_running && !s.is_primary && !s.switchover,
            Self::EnsureReplicationUser => s.is_master && s.is_primary && f.has_password,
            Self::CloneMaster => {
                f.configured && s.master_authorized && !s.cloned && !s.is_master && !s.is_anointed
            }
            Self::FollowMaster => {
                s.master_authorized && s.cloned && !s.is_master && !s.is_anointed && !s.is_primary
            }
            Self::RestartService => f.configured && f.needs_restart,
            Self::ReloadService => f.needs_reload && !f.needs_restart && s.is_running,
            Self::StartService => {
                f.configured
                    && !s.is_running
                    && !f.needs_restart
                    && (s.manual || s.is_master || (s.has_master && s.cloned))
            }
            Self::PublishFollowing => {
                s.is_running && !f.needs_restart && !f.needs_reload && f.published_following != f.following
            }
            Self::VerifyReplication => {
                automatic
                    && !s.is_master
                    && s.is_running
                    && !s.is_primary
                    && f.following.is_some()
                    && !f.confirmed
                    && !f.needs_restart
            }
            Self::ReleaseRestartLock => !f.lock_wanted,
            Self::SetActive => true,
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub hook: Hook,
    pub phase: Phase,
    pub status: WorkloadStatus,
    /// Rules that fired, in order.
    pub fired: Vec<Rule>,
    pub halted: bool,
}

impl TickOutcome {
    pub fn fired(&self, rule: Rule) -> bool {
        self.fired.contains(&rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(s: &str) -> UnitId {
        UnitId::new(s).unwrap()
    }

    fn facts() -> TickFacts {
        TickFacts {
            is_leader: false,
            has_password: true,
            configured: true,
            following: None,
            published_following: None,
            needs_restart: false,
            needs_reload: false,
            confirmed: false,
            lock_wanted: false,
            phase: Phase::Stable,
            anointed_gone: false,
        }
    }

    #[test]
    fn test_order_is_complete_and_unique() {
        let mut names: Vec<&str> = Rule::ORDER.iter().map(Rule::name).collect();
        assert_eq!(names.first(), Some(&"ensure_replication_credentials"));
        assert_eq!(names.last(), Some(&"set_active"));
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Rule::ORDER.len());
    }

    #[test]
    fn test_promote_excluded_during_switchover() {
        let mut s = ReplicationState {
            master: Some(unit("postgresql/0")),
            is_master: true,
            is_running: true,
            is_primary: false,
            ..Default::default()
        };
        assert!(Rule::PromoteMaster.applies(&s, &facts()));
        s.switchover = true;
        assert!(!Rule::PromoteMaster.applies(&s, &facts()));
    }

    #[test]
    fn test_follow_excludes_anointed_and_master() {
        let mut s = ReplicationState {
            master: Some(unit("postgresql/0")),
            master_authorized: true,
            has_master: true,
            cloned: true,
            is_running: true,
            ..Default::default()
        };
        assert!(Rule::FollowMaster.applies(&s, &facts()));
        s.is_anointed = true;
        assert!(!Rule::FollowMaster.applies(&s, &facts()));
        s.is_anointed = false;
        s.is_master = true;
        assert!(!Rule::FollowMaster.applies(&s, &facts()));
    }

    #[test]
    fn test_uncloned_unit_waits_for_master_not_failover() {
        // postgresql/3 sees postgresql/1 but not the master, and never cloned.
        let mut s = ReplicationState {
            master: Some(unit("postgresql/0")),
            has_peers: true,
            had_peers: true,
            master_departed: true,
            ..Default::default()
        };
        let f = facts();
        assert!(Rule::WaitForMaster.applies(&s, &f));
        assert!(!Rule::WaitForFailover.applies(&s, &f));
        assert!(!Rule::DetachFromDepartedMaster.applies(&s, &f));

        // A leader coordinates even before it has cloned.
        let mut leader = facts();
        leader.is_leader = true;
        assert!(!Rule::WaitForMaster.applies(&s, &leader));
        assert!(Rule::CoordinateFailover.applies(&s, &leader));

        s.cloned = true;
        s.failover = true;
        assert!(!Rule::WaitForMaster.applies(&s, &f));
        assert!(Rule::WaitForFailover.applies(&s, &f));
    }

    #[test]
    fn test_manual_mode_skips_automation() {
        let s = ReplicationState {
            manual: true,
            ..Default::default()
        };
        let mut f = facts();
        f.is_leader = true;
        assert!(!Rule::AppointInitialMaster.applies(&s, &f));
        assert!(!Rule::WaitForPeers.applies(&s, &f));
        assert!(Rule::StartService.applies(&s, &f));
    }

    #[test]
    fn test_publish_following_waits_for_restart() {
        let s = ReplicationState {
            is_running: true,
            ..Default::default()
        };
        let mut f = facts();
        f.following = Some(unit("postgresql/0"));
        assert!(Rule::PublishFollowing.applies(&s, &f));
        f.needs_restart = true;
        assert!(!Rule::PublishFollowing.applies(&s, &f));
    }

    #[test]
    fn test_hook_names() {
        assert_eq!(Hook::ConfigChanged.to_string(), "config-changed");
        assert!(Hook::Install.is_operator_action());
        assert!(!Hook::UpdateStatus.is_operator_action());
    }
}
