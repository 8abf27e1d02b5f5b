// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: inject server and network failures and verify the peer
//! group degrades to an explicit status instead of guessing.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use pg_replication_agent::lock::RESTART_LOCK;
use pg_replication_agent::service::{LIVE_MASTER, LIVE_SECONDARY};
use pg_replication_agent::store::keys;
use pg_replication_agent::{ActionError, Hook, Lsn, Rule, WorkloadStatus};

/// Deploy three units, lose the master, and let every survivor detach.
async fn lose_master() -> Fleet {
    let mut fleet = Fleet::with_units(3);
    fleet.deploy().await;
    fleet.remove("postgresql/0");
    fleet.round(Hook::PeerDeparted).await;
    fleet
}

// =============================================================================
// Provisioning Failures
// =============================================================================

/// Test: A failed base backup drops the cluster and blocks until the
/// operator acts
#[tokio::test]
async fn clone_failure_blocks_until_operator_action() {
    let mut fleet = Fleet::with_units(2);
    fleet.update_instance("postgresql/1", |i| i.fail_backup = true);

    let outcomes = fleet.round(Hook::Install).await;
    let outcome = &outcomes[&unit("postgresql/1")];
    assert!(outcome.halted);
    assert_eq!(outcome.status, WorkloadStatus::blocked("Failed to clone postgresql/0"));
    assert!(fleet.instance("postgresql/1").dropped);
    // The halted tick still gives the lock back.
    assert_eq!(fleet.cluster.lock_holder(RESTART_LOCK), None);

    // Routine ticks do not retry.
    let outcome = fleet.tick("postgresql/1", Hook::UpdateStatus).await;
    assert_eq!(outcome.status, WorkloadStatus::blocked("Failed to clone postgresql/0"));
    assert!(outcome.fired.is_empty());
    assert_eq!(fleet.instance("postgresql/1").clones, 1);

    fleet.update_instance("postgresql/1", |i| i.fail_backup = false);
    let outcome = fleet.tick("postgresql/1", Hook::ConfigChanged).await;
    assert!(outcome.fired(Rule::CloneMaster));
    assert_eq!(fleet.instance("postgresql/1").clones, 2);

    fleet.settle(2).await;
    assert_eq!(fleet.status("postgresql/1"), WorkloadStatus::active(LIVE_SECONDARY));
    assert_eq!(fleet.agent("postgresql/1").store().get(keys::CLONE_FAILED), None);
}

/// Test: A server that will not stop is never cloned over
#[tokio::test]
async fn stop_failure_before_clone_blocks() {
    let mut fleet = Fleet::with_units(2);
    fleet.update_instance("postgresql/1", |i| {
        i.running = true;
        i.fail_stop = true;
    });

    let outcomes = fleet.round(Hook::Install).await;
    let outcome = &outcomes[&unit("postgresql/1")];
    assert!(outcome.halted);
    assert_eq!(outcome.status, WorkloadStatus::blocked("Failed to stop PostgreSQL"));
    assert_eq!(fleet.instance("postgresql/1").clones, 0);
    assert_eq!(fleet.cluster.lock_holder(RESTART_LOCK), None);
}

/// Test: A failed restart blocks, and the next tick starts the server
#[tokio::test]
async fn restart_failure_recovers_on_next_tick() {
    let mut fleet = Fleet::with_units(2);
    fleet.deploy().await;

    let mut config = fleet.config_for("postgresql/1");
    config.port = 5433;
    fleet.agent("postgresql/1").set_config(config);
    fleet.update_instance("postgresql/1", |i| i.fail_start = true);

    let outcome = fleet.tick("postgresql/1", Hook::ConfigChanged).await;
    assert!(outcome.halted);
    assert_eq!(outcome.status, WorkloadStatus::blocked("Failed to restart PostgreSQL"));
    assert!(!fleet.instance("postgresql/1").running);

    fleet.update_instance("postgresql/1", |i| i.fail_start = false);
    let outcome = fleet.tick("postgresql/1", Hook::UpdateStatus).await;
    assert!(fleet.instance("postgresql/1").running);
    assert!(!fleet.agent("postgresql/1").store().flag(keys::NEEDS_RESTART));
    assert_eq!(outcome.status, WorkloadStatus::active(LIVE_SECONDARY));
}

/// Test: Replication that never shows up is reported once the confirm
/// budget runs out, and clears once it flows
#[tokio::test]
async fn unconfirmed_replication_blocks_then_recovers() {
    let mut fleet = Fleet::new();
    fleet.add("postgresql/0");
    let mut config = fleet.config_for("postgresql/1");
    config.replication_confirm_ticks = 2;
    fleet.add_with_config("postgresql/1", config);

    fleet.tick("postgresql/0", Hook::Install).await;
    fleet.update_instance("postgresql/0", |i| i.unreachable = true);

    let outcome = fleet.tick("postgresql/1", Hook::Install).await;
    assert_eq!(
        outcome.status,
        WorkloadStatus::waiting("Waiting for replication from postgresql/0")
    );

    let outcome = fleet.tick("postgresql/1", Hook::UpdateStatus).await;
    assert_eq!(
        outcome.status,
        WorkloadStatus::blocked("Replication from postgresql/0 not flowing")
    );

    fleet.update_instance("postgresql/0", |i| i.unreachable = false);
    let outcome = fleet.tick("postgresql/1", Hook::UpdateStatus).await;
    assert_eq!(outcome.status, WorkloadStatus::active(LIVE_SECONDARY));
    assert!(fleet.agent("postgresql/1").store().flag(keys::CONFIRMED));
}

// =============================================================================
// Promotion Failures
// =============================================================================

/// Test: A promotion that never leaves recovery times out instead of
/// hanging the tick
#[tokio::test]
async fn stuck_promotion_times_out() {
    let mut fleet = lose_master().await;
    fleet.update_instance("postgresql/2", |i| {
        i.replayed = Lsn(500);
        i.promote_stuck = true;
    });

    let outcomes = fleet.round(Hook::UpdateStatus).await;
    assert_eq!(fleet.master(), Some(unit("postgresql/2")));

    let outcome = &outcomes[&unit("postgresql/2")];
    assert!(outcome.halted);
    assert_eq!(outcome.status, WorkloadStatus::blocked("Timed out promoting to primary"));
    assert!(fleet.primaries().is_empty());
}

/// Test: A failed promote command blocks the new master
#[tokio::test]
async fn failed_promotion_blocks() {
    let mut fleet = lose_master().await;
    fleet.update_instance("postgresql/2", |i| {
        i.replayed = Lsn(500);
        i.fail_promote = true;
    });

    let outcomes = fleet.round(Hook::UpdateStatus).await;
    let outcome = &outcomes[&unit("postgresql/2")];
    assert!(outcome.halted);
    assert_eq!(outcome.status, WorkloadStatus::blocked("Failed to promote to primary"));
    assert_eq!(fleet.instance("postgresql/2").promotions, 0);
    assert!(fleet.primaries().is_empty());
}

/// Deploy three units with a short drain budget on postgresql/2 and start
/// a switchover to it.
async fn switch_to_slow_drainer() -> Fleet {
    let mut fleet = Fleet::new();
    fleet.add("postgresql/0");
    fleet.add("postgresql/1");
    let mut config = fleet.config_for("postgresql/2");
    config.timeouts.drain = "300ms".to_string();
    fleet.add_with_config("postgresql/2", config);
    fleet.deploy().await;

    fleet
        .agent("postgresql/0")
        .switchover(Some("postgresql/2"))
        .await
        .unwrap();
    fleet
}

/// Test: An old master that keeps writing past the drain budget leaves the
/// anointed unit blocked and unpromoted
#[tokio::test]
async fn drain_timeout_blocks_anointed_unit() {
    let mut fleet = switch_to_slow_drainer().await;
    fleet.update_instance("postgresql/0", |i| i.advancing = usize::MAX);

    let outcomes = fleet.round(Hook::LeaderSettingsChanged).await;
    assert_eq!(fleet.facts("postgresql/0").following, Some(unit("postgresql/2")));

    let outcome = &outcomes[&unit("postgresql/2")];
    assert!(outcome.halted);
    assert!(outcome.fired(Rule::DrainAndPromoteAnointed));
    assert_eq!(outcome.status, WorkloadStatus::blocked("Timed out draining postgresql/0"));
    assert_eq!(fleet.instance("postgresql/2").promotions, 0);
    assert!(fleet.primaries().is_empty());
    // Several polls happened before giving up.
    assert!(fleet.instance("postgresql/0").received > Lsn(WAL_STEP));
    assert_eq!(fleet.cluster.lock_holder(RESTART_LOCK), None);
    assert_eq!(fleet.master(), Some(unit("postgresql/0")));
}

/// Test: The anointed unit waits out a brief burst of writes, then promotes
#[tokio::test]
async fn drain_waits_for_old_master_to_settle() {
    let mut fleet = switch_to_slow_drainer().await;
    fleet.update_instance("postgresql/0", |i| i.advancing = 2);

    let outcomes = fleet.round(Hook::LeaderSettingsChanged).await;
    let outcome = &outcomes[&unit("postgresql/2")];
    assert!(!outcome.halted);
    assert!(outcome.fired(Rule::DrainAndPromoteAnointed));
    assert_eq!(fleet.instance("postgresql/2").promotions, 1);
    assert_eq!(fleet.primaries(), vec![unit("postgresql/2")]);
    assert_eq!(fleet.instance("postgresql/0").advancing, 0);
}

// =============================================================================
// Election Under Partial Failure
// =============================================================================

/// Test: A peer that cannot be probed is not elected, however far ahead
/// it claims to be
#[tokio::test]
async fn unreachable_peer_excluded_from_election() {
    let mut fleet = lose_master().await;
    fleet.update_instance("postgresql/1", |i| i.replayed = Lsn(100));
    fleet.update_instance("postgresql/2", |i| {
        i.replayed = Lsn(900);
        i.unreachable = true;
    });

    fleet.round(Hook::UpdateStatus).await;
    assert_eq!(fleet.master(), Some(unit("postgresql/1")));
    assert_eq!(fleet.primaries(), vec![unit("postgresql/1")]);
}

/// Test: With nobody able to report a position the leader refuses to
/// guess
#[tokio::test]
async fn no_candidates_blocks_election() {
    let mut fleet = lose_master().await;
    fleet.update_instance("postgresql/1", |i| i.replay_unknown = true);
    fleet.update_instance("postgresql/2", |i| i.unreachable = true);

    let outcome = fleet.tick("postgresql/1", Hook::UpdateStatus).await;
    assert!(outcome.halted);
    assert!(outcome.fired(Rule::CoordinateFailover));
    assert_eq!(outcome.status, WorkloadStatus::blocked("No candidates for master found!"));
    assert_eq!(fleet.master(), Some(unit("postgresql/0")));

    // Positions come back; the next tick elects.
    fleet.update_instance("postgresql/1", |i| i.replay_unknown = false);
    fleet.tick("postgresql/1", Hook::UpdateStatus).await;
    assert_eq!(fleet.master(), Some(unit("postgresql/1")));
}

/// Test: A straggler that never ticks stalls the failover until the
/// operator forces it, and is then left out of the election
#[tokio::test]
async fn stalled_failover_proceeds_when_forced() {
    let mut fleet = Fleet::new();
    fleet.add("postgresql/0");
    let mut config = fleet.config_for("postgresql/1");
    config.timeouts.failover_quorum = "0s".to_string();
    fleet.add_with_config("postgresql/1", config);
    fleet.add("postgresql/2");
    fleet.deploy().await;

    let err = fleet.agent("postgresql/1").force_failover().await.unwrap_err();
    assert!(matches!(err, ActionError::NotLeader));
    let err = fleet.agent("postgresql/0").force_failover().await.unwrap_err();
    assert!(matches!(err, ActionError::NoFailoverInProgress));

    fleet.remove("postgresql/0");
    fleet.update_instance("postgresql/2", |i| i.replayed = Lsn(900));

    let outcome = fleet.tick("postgresql/1", Hook::PeerDeparted).await;
    assert_eq!(
        outcome.status,
        WorkloadStatus::blocked("Failover stalled waiting for postgresql/1, postgresql/2")
    );
    let outcome = fleet.tick("postgresql/1", Hook::UpdateStatus).await;
    assert_eq!(
        outcome.status,
        WorkloadStatus::blocked("Failover stalled waiting for postgresql/2")
    );
    assert_eq!(fleet.master(), Some(unit("postgresql/0")));

    fleet.agent("postgresql/1").force_failover().await.unwrap();
    let outcome = fleet.tick("postgresql/1", Hook::UpdateStatus).await;
    // postgresql/2 is further ahead but never let go of the old master.
    assert_eq!(fleet.master(), Some(unit("postgresql/1")));
    assert_eq!(outcome.status, WorkloadStatus::active(LIVE_MASTER));
    let store = fleet.agent("postgresql/1").store();
    assert_eq!(store.get(keys::FAILOVER_FORCED), None);
    assert_eq!(store.get(keys::FAILOVER_SINCE), None);

    // The straggler catches up with the new topology.
    fleet.settle(2).await;
    assert_eq!(fleet.status("postgresql/2"), WorkloadStatus::active(LIVE_SECONDARY));
    assert_eq!(fleet.facts("postgresql/2").following, Some(unit("postgresql/1")));
    assert_eq!(fleet.primaries(), vec![unit("postgresql/1")]);
}

// =============================================================================
// Process Restarts
// =============================================================================

/// Test: Durable flags survive an agent restart, so a standby is not
/// cloned twice
#[tokio::test]
async fn agent_restart_keeps_durable_state() {
    let mut fleet = Fleet::new();
    fleet.add("postgresql/0");
    fleet.add_durable("postgresql/1").await;
    fleet.deploy().await;
    assert_eq!(fleet.instance("postgresql/1").clones, 1);

    fleet.restart_agent("postgresql/1").await;
    let store = fleet.agent("postgresql/1").store();
    assert!(store.path().is_some());
    assert!(store.flag(keys::CLONED));
    assert!(store.flag(keys::HAD_PEERS));
    assert_eq!(store.get_unit(keys::FOLLOWING), Some(unit("postgresql/0")));

    let outcome = fleet.tick("postgresql/1", Hook::Start).await;
    assert!(!outcome.fired(Rule::CloneMaster));
    assert_eq!(fleet.instance("postgresql/1").clones, 1);
    assert_eq!(outcome.status, WorkloadStatus::active(LIVE_SECONDARY));
}
