//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Tick execution (count, duration, outcome)
//! - Unit role and workload status
//! - Failover elections and switchover progress
//! - Clone, promotion and restart-lock activity
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! The crate only records. Installing an exporter is the embedding
//! process's job.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed tick.
pub fn record_tick(hook: &str, outcome: &str, duration: Duration) {
    counter!("replication_ticks_total", "hook" => hook.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!("replication_tick_duration_seconds", "hook" => hook.to_string())
        .record(duration.as_secs_f64());
}

/// Record a rule firing within a tick.
pub fn record_rule(rule: &str) {
    counter!("replication_rules_fired_total", "rule" => rule.to_string()).increment(1);
}

/// Gauge for the unit's role (0=unknown, 1=standby, 2=primary, 3=master).
pub fn set_role(is_master: bool, is_primary: bool, running: bool) {
    let value = match (running, is_master, is_primary) {
        (false, _, _) => 0.0,
        (true, true, _) => 3.0,
        (true, false, true) => 2.0,
        (true, false, false) => 1.0,
    };
    gauge!("replication_role").set(value);
}

/// Gauge for the number of peers seen this tick.
pub fn set_peer_count(count: usize) {
    gauge!("replication_peers").set(count as f64);
}

/// Gauge for workload status (0=active, 1=waiting, 2=maintenance, 3=blocked).
pub fn set_workload_status(state: &str) {
    let value = match state {
        "active" => 0.0,
        "waiting" => 1.0,
        "maintenance" => 2.0,
        "blocked" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_workload_status").set(value);
}

/// Record the coordination phase observed this tick.
pub fn set_phase(phase: &str) {
    gauge!("replication_phase", "phase" => phase.to_string()).set(1.0);
}

/// Record units still following a departed master.
pub fn set_failover_stragglers(count: usize) {
    gauge!("replication_failover_stragglers").set(count as f64);
}

/// Record a failover election outcome.
pub fn record_election(outcome: &str, candidates: usize) {
    counter!("replication_elections_total", "outcome" => outcome.to_string()).increment(1);
    gauge!("replication_election_candidates").set(candidates as f64);
}

/// Record a switchover step.
pub fn record_switchover(stage: &str) {
    counter!("replication_switchover_steps_total", "stage" => stage.to_string()).increment(1);
}

/// Record a clone attempt.
pub fn record_clone(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_clones_total", "status" => status).increment(1);
    histogram!("replication_clone_duration_seconds").record(duration.as_secs_f64());
}

/// Record a promotion attempt.
pub fn record_promotion(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_promotions_total", "status" => status).increment(1);
    histogram!("replication_promotion_duration_seconds").record(duration.as_secs_f64());
}

/// Record a drain before switchover promotion.
pub fn record_drain(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_drains_total", "status" => status).increment(1);
    histogram!("replication_drain_duration_seconds").record(duration.as_secs_f64());
}

/// Record a restart-lock request.
pub fn record_lock_request(lock: &str, status: &str) {
    counter!(
        "replication_lock_requests_total",
        "lock" => lock.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a service action (start/stop/restart/reload).
pub fn record_service_action(action: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replication_service_actions_total",
        "action" => action.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a recovery target change.
pub fn record_recovery_target_change() {
    counter!("replication_recovery_target_changes_total").increment(1);
}

/// Record unit store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_store_retry(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record errors by type.
pub fn record_error(error_type: &str) {
    counter!("replication_errors_total", "error_type" => error_type.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // With no recorder installed these are no-ops; they must not panic.
    #[test]
    fn test_recording_without_recorder() {
        record_tick("update-status", "completed", Duration::from_millis(5));
        record_rule("clone_master");
        set_role(true, true, true);
        set_workload_status("active");
        set_workload_status("unknown");
        record_election("elected", 3);
        record_clone(false, Duration::from_secs(1));
        record_lock_request("restart", "granted");
        record_store_retry("store_upsert");
    }
}
