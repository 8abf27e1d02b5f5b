// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication agent.
//!
//! The agent treats configuration as an immutable snapshot: every tick is
//! handed one [`AgentConfig`], and change detection is done by diffing it
//! against the snapshot applied on the previous tick (see
//! [`AgentConfig::changes_since`]). Nothing mutates a config in place.
//!
//! # Quick Start
//!
//! ```rust
//! use pg_replication_agent::config::AgentConfig;
//!
//! let config = AgentConfig {
//!     version: "12".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! AgentConfig
//! ├── version: String              # PostgreSQL major version (immutable)
//! ├── port: u16
//! ├── manual_replication: bool     # disables all automatic replication
//! ├── streaming_replication: bool
//! ├── archive_restore_command: Option<String>
//! ├── replication_username: String
//! ├── replication_confirm_ticks: u32
//! ├── paths: PathsConfig           # data dir (immutable), binaries
//! ├── timeouts: TimeoutsConfig     # promote, drain, failover quorum
//! └── store: StoreConfig           # SQLite unit store
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! version: "12"
//! port: 5432
//! streaming_replication: true
//!
//! timeouts:
//!   promote: "5m"
//!   drain: "10m"
//!   failover_quorum: "1h"
//!
//! store:
//!   sqlite_path: "/var/lib/pg-agent/unit.db"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{AgentError, Result};

/// Major versions the agent knows how to drive.
pub const SUPPORTED_VERSIONS: &[&str] = &["9.5", "9.6", "10", "11", "12", "13", "14", "15", "16"];

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The configuration snapshot handed to each reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// PostgreSQL major version. Cannot change after install.
    #[serde(default = "default_version")]
    pub version: String,

    /// Port the local cluster listens on (published to peers).
    #[serde(default = "default_port")]
    pub port: u16,

    /// When set, this unit manages its own primary/secondary state and
    /// no cloning, following or coordination runs.
    #[serde(default)]
    pub manual_replication: bool,

    /// Stream WAL from the upstream rather than relying on archive restore only.
    #[serde(default = "default_true")]
    pub streaming_replication: bool,

    /// Command used to fetch archived WAL segments during recovery.
    #[serde(default)]
    pub archive_restore_command: Option<String>,

    /// Internal role used for base backups and streaming.
    #[serde(default = "default_replication_username")]
    pub replication_username: String,

    /// Ticks a freshly re-pointed standby may go without appearing in its
    /// upstream's replication view before the unit is marked blocked.
    #[serde(default = "default_replication_confirm_ticks")]
    pub replication_confirm_ticks: u32,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

fn default_version() -> String {
    "12".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_true() -> bool {
    true
}

fn default_replication_username() -> String {
    // Leading underscore keeps it clear of client-requested role names.
    "_replication".to_string()
}

fn default_replication_confirm_ticks() -> u32 {
    10
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            port: default_port(),
            manual_replication: false,
            streaming_replication: true,
            archive_restore_command: None,
            replication_username: default_replication_username(),
            replication_confirm_ticks: default_replication_confirm_ticks(),
            paths: PathsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Create a config for tests rooted in a scratch directory.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            paths: PathsConfig {
                data_dir: root.join("main"),
                recovery_conf: None,
                bin_dir: None,
                owner_uid: None,
                owner_gid: None,
            },
            timeouts: TimeoutsConfig::testing(),
            store: StoreConfig::in_memory(),
            ..Self::default()
        }
    }

    /// Reject values an operator has to fix.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version.as_str()) {
            return Err(AgentError::Config(format!(
                "unsupported PostgreSQL version {:?} (expected one of {})",
                self.version,
                SUPPORTED_VERSIONS.join(", ")
            )));
        }
        if self.port == 0 {
            return Err(AgentError::Config("port must be non-zero".to_string()));
        }
        if self.replication_username.is_empty() {
            return Err(AgentError::Config(
                "replication_username must not be empty".to_string(),
            ));
        }
        if self.replication_confirm_ticks == 0 {
            return Err(AgentError::Config(
                "replication_confirm_ticks must be at least 1".to_string(),
            ));
        }
        self.timeouts.validate()
    }

    /// Whether the configured version is at least `ver` (e.g. `"10"`).
    pub fn has_version(&self, ver: &str) -> bool {
        version_tuple(&self.version) >= version_tuple(ver)
    }

    /// Diff this snapshot against the previously applied one.
    pub fn changes_since(&self, previous: &AgentConfig) -> Vec<ConfigChange> {
        let mut changes = Vec::new();
        let mut check = |setting: &'static str, changed: bool, immutable: bool| {
            if changed {
                changes.push(ConfigChange { setting, immutable });
            }
        };

        check("version", self.version != previous.version, true);
        check("paths.data_dir", self.paths.data_dir != previous.paths.data_dir, true);
        check("port", self.port != previous.port, false);
        check(
            "manual_replication",
            self.manual_replication != previous.manual_replication,
            true,
        );
        check(
            "streaming_replication",
            self.streaming_replication != previous.streaming_replication,
            false,
        );
        check(
            "archive_restore_command",
            self.archive_restore_command != previous.archive_restore_command,
            false,
        );
        check(
            "replication_username",
            self.replication_username != previous.replication_username,
            false,
        );
        check("timeouts", self.timeouts != previous.timeouts, false);
        changes
    }

    /// Path of the recovery configuration file.
    pub fn recovery_conf_path(&self) -> PathBuf {
        self.paths
            .recovery_conf
            .clone()
            .unwrap_or_else(|| self.paths.data_dir.join("recovery.conf"))
    }

    /// Directory holding `pg_ctl` and `pg_basebackup`.
    pub fn bin_dir(&self) -> PathBuf {
        self.paths
            .bin_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/usr/lib/postgresql/{}/bin", self.version)))
    }
}

fn version_tuple(ver: &str) -> (u32, u32) {
    let mut parts = ver.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

/// One setting that differs between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub setting: &'static str,
    /// Settings that cannot change once the cluster exists.
    pub immutable: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PathsConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Filesystem layout of the local cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Cluster data directory. Destroyed and recreated when cloning.
    pub data_dir: PathBuf,

    /// Recovery configuration; defaults to `<data_dir>/recovery.conf`.
    #[serde(default)]
    pub recovery_conf: Option<PathBuf>,

    /// PostgreSQL binaries; defaults to `/usr/lib/postgresql/<version>/bin`.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,

    /// Owner applied to a recreated data directory.
    #[serde(default)]
    pub owner_uid: Option<u32>,

    #[serde(default)]
    pub owner_gid: Option<u32>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/postgresql/main"),
            recovery_conf: None,
            bin_dir: None,
            owner_uid: None,
            owner_gid: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TimeoutsConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Hard bounds for the waits that happen inside a single tick, plus the
/// failover quorum stall threshold.
///
/// Durations are humantime strings (`"500ms"`, `"5m"`, `"1h"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Upper bound on waiting for a promoted instance to leave recovery.
    #[serde(default = "default_promote")]
    pub promote: String,

    /// Upper bound on the switchover drain loop.
    #[serde(default = "default_drain")]
    pub drain: String,

    /// How long the leader waits for every peer to stop following a
    /// departed master before reporting the failover as stalled.
    #[serde(default = "default_failover_quorum")]
    pub failover_quorum: String,

    /// Delay between polls inside bounded waits.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

fn default_promote() -> String {
    "5m".to_string()
}

fn default_drain() -> String {
    "10m".to_string()
}

fn default_failover_quorum() -> String {
    "1h".to_string()
}

/// Longest pause allowed between two checks of a polling loop.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3600);

fn default_poll_interval() -> String {
    "1s".to_string()
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            promote: default_promote(),
            drain: default_drain(),
            failover_quorum: default_failover_quorum(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl TimeoutsConfig {
    /// Short bounds so tests fail fast.
    pub fn testing() -> Self {
        Self {
            promote: "200ms".to_string(),
            drain: "200ms".to_string(),
            failover_quorum: "1h".to_string(),
            poll_interval: "10ms".to_string(),
        }
    }

    pub fn promote(&self) -> Duration {
        humantime::parse_duration(&self.promote).unwrap_or(Duration::from_secs(300))
    }

    pub fn drain(&self) -> Duration {
        humantime::parse_duration(&self.drain).unwrap_or(Duration::from_secs(600))
    }

    pub fn failover_quorum(&self) -> Duration {
        humantime::parse_duration(&self.failover_quorum).unwrap_or(Duration::from_secs(3600))
    }

    pub fn poll_interval(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("timeouts.promote", &self.promote),
            ("timeouts.drain", &self.drain),
            ("timeouts.failover_quorum", &self.failover_quorum),
            ("timeouts.poll_interval", &self.poll_interval),
        ] {
            humantime::parse_duration(value).map_err(|e| {
                AgentError::Config(format!("{} = {:?}: {}", name, value, e))
            })?;
        }
        let interval = self.poll_interval();
        if interval.is_zero() || interval > MAX_POLL_INTERVAL {
            return Err(AgentError::Config(format!(
                "timeouts.poll_interval = {:?}: must be between 1ms and {}",
                self.poll_interval,
                humantime::format_duration(MAX_POLL_INTERVAL)
            )));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Durable unit store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database; `None` keeps state in memory only.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: Option<String>,
}

fn default_sqlite_path() -> Option<String> {
    Some("/var/lib/pg-replication-agent/unit.db".to_string())
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl StoreConfig {
    /// In-memory store for tests.
    pub fn in_memory() -> Self {
        Self { sqlite_path: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AgentConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.streaming_replication);
        assert!(!config.manual_replication);
        assert_eq!(config.replication_username, "_replication");
    }

    #[test]
    fn test_rejects_unsupported_version() {
        let config = AgentConfig {
            version: "8.4".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("8.4"));
    }

    #[test]
    fn test_rejects_bad_duration() {
        let mut config = AgentConfig::default();
        config.timeouts.drain = "forever".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.drain"));
    }

    #[test]
    fn test_rejects_zero_poll_interval() {
        let mut config = AgentConfig::default();
        config.timeouts.poll_interval = "0s".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.poll_interval"));
    }

    #[test]
    fn test_rejects_huge_poll_interval() {
        let mut config = AgentConfig::default();
        config.timeouts.poll_interval = "500years".to_string();
        assert!(config.validate().is_err());

        config.timeouts.poll_interval = "1h".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_parsing() {
        let timeouts = TimeoutsConfig::default();
        assert_eq!(timeouts.promote(), Duration::from_secs(300));
        assert_eq!(timeouts.drain(), Duration::from_secs(600));
        assert_eq!(timeouts.failover_quorum(), Duration::from_secs(3600));
        assert_eq!(timeouts.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_has_version() {
        let config = AgentConfig {
            version: "9.6".to_string(),
            ..Default::default()
        };
        assert!(config.has_version("9.2"));
        assert!(config.has_version("9.6"));
        assert!(!config.has_version("10"));
    }

    #[test]
    fn test_changes_since_flags_immutable() {
        let old = AgentConfig::default();
        let mut new = old.clone();
        new.version = "13".to_string();
        new.streaming_replication = false;
        new.manual_replication = true;

        let changes = new.changes_since(&old);
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().any(|c| c.setting == "version" && c.immutable));
        assert!(changes
            .iter()
            .any(|c| c.setting == "manual_replication" && c.immutable));
        assert!(changes
            .iter()
            .any(|c| c.setting == "streaming_replication" && !c.immutable));
    }

    #[test]
    fn test_no_changes_between_equal_snapshots() {
        let config = AgentConfig::default();
        assert!(config.changes_since(&config.clone()).is_empty());
    }

    #[test]
    fn test_recovery_conf_defaults_into_data_dir() {
        let config = AgentConfig::for_testing("/tmp/x");
        assert_eq!(config.recovery_conf_path(), PathBuf::from("/tmp/x/main/recovery.conf"));
        assert_eq!(config.bin_dir(), PathBuf::from("/usr/lib/postgresql/12/bin"));
    }

    #[test]
    fn test_config_json_roundtrip() {
        let config = AgentConfig {
            archive_restore_command: Some("wal-fetch %f %p".to_string()),
            ..AgentConfig::for_testing("/srv")
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AgentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let parsed: AgentConfig = serde_json::from_str(r#"{"port": 6432}"#).unwrap();
        assert_eq!(parsed.port, 6432);
        assert_eq!(parsed.version, "12");
        assert_eq!(parsed.timeouts, TimeoutsConfig::default());
    }
}
