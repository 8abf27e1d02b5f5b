// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable per-unit key/value state.
//!
//! Holds everything a unit must remember between ticks: the sticky
//! `had_peers` flag, whether the data directory is on the master's
//! timeline, the Following Pointer, pending restart/reload requests, the
//! last applied configuration snapshot and the last workload status.
//!
//! The store is passed explicitly into every component that needs it.
//! There is no process-wide instance.
//!
//! # Write Model
//!
//! A tick runs single-threaded, so the store is owned (`&mut self`) rather
//! than shared:
//! - `set()` / `unset()` update the in-memory cache immediately and mark
//!   the key dirty
//! - `flush_dirty()` persists all dirty keys in one pass at the end of the
//!   tick
//!
//! A crash between a write and the flush loses that tick's writes. The
//! next tick re-derives everything from the substrate and redoes the
//! idempotent step.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff, capped
//! at a handful of attempts.

use crate::error::Result;
use crate::unit::UnitId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Well-known store keys.
pub mod keys {
    /// Set once this unit has ever seen a peer.
    pub const HAD_PEERS: &str = "replication.had_peers";
    /// Data directory is on the master's timeline.
    pub const CLONED: &str = "replication.cloned";
    /// Upstream unit the recovery configuration currently targets.
    pub const FOLLOWING: &str = "replication.following";
    /// Ticks since the current upstream was chosen without confirmation.
    pub const UNCONFIRMED_TICKS: &str = "replication.unconfirmed_ticks";
    /// Replication to the current upstream has been seen flowing.
    pub const CONFIRMED: &str = "replication.confirmed";
    /// Cluster exists and its configuration has been written.
    pub const CONFIGURED: &str = "cluster.configured";
    pub const NEEDS_RESTART: &str = "cluster.needs_restart";
    pub const NEEDS_RELOAD: &str = "cluster.needs_reload";
    /// Upstream of the last failed clone; the cluster was dropped.
    pub const CLONE_FAILED: &str = "cluster.clone_failed";
    /// Unix millis at which the leader started coordinating a failover.
    pub const FAILOVER_SINCE: &str = "failover.coordinating_since";
    /// Operator asked the leader to stop waiting for stragglers.
    pub const FAILOVER_FORCED: &str = "failover.forced";
    /// JSON of the last applied `AgentConfig`.
    pub const CONFIG_SNAPSHOT: &str = "config.snapshot";
    /// JSON of the last `WorkloadStatus`.
    pub const STATUS: &str = "workload.status";
}

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_store_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-unit key/value store, optionally backed by SQLite.
pub struct UnitStore {
    /// SQLite connection pool (None for an ephemeral store)
    pool: Option<SqlitePool>,
    /// Current values
    cache: HashMap<String, String>,
    /// Keys set or removed since the last flush
    dirty: HashSet<String>,
    /// Path to database file
    path: Option<String>,
}

impl UnitStore {
    /// Open (or create) a durable store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening unit store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM kv")
            .fetch_all(&pool)
            .await?;

        let cache: HashMap<String, String> = rows.into_iter().collect();
        if !cache.is_empty() {
            debug!(count = cache.len(), "Restored unit state from previous ticks");
        }

        Ok(Self {
            pool: Some(pool),
            cache,
            dirty: HashSet::new(),
            path: Some(path_str),
        })
    }

    /// Store with no backing file. State lives as long as the value.
    pub fn ephemeral() -> Self {
        Self {
            pool: None,
            cache: HashMap::new(),
            dirty: HashSet::new(),
            path: None,
        }
    }

    /// Open according to configuration.
    pub async fn from_config(config: &crate::config::StoreConfig) -> Result<Self> {
        match &config.sqlite_path {
            Some(path) => Self::open(path).await,
            None => Ok(Self::ephemeral()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.cache.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if self.cache.get(key) == Some(&value) {
            return;
        }
        self.cache.insert(key.to_string(), value);
        self.dirty.insert(key.to_string());
    }

    pub fn unset(&mut self, key: &str) {
        if self.cache.remove(key).is_some() {
            self.dirty.insert(key.to_string());
        }
    }

    /// Boolean flags are stored as presence.
    pub fn flag(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    pub fn set_flag(&mut self, key: &str, on: bool) {
        if on {
            self.set(key, "1");
        } else {
            self.unset(key);
        }
    }

    pub fn get_unit(&self, key: &str) -> Option<UnitId> {
        self.get(key).and_then(|v| UnitId::new(v).ok())
    }

    pub fn set_unit(&mut self, key: &str, unit: Option<&UnitId>) {
        match unit {
            Some(unit) => self.set(key, unit.as_str()),
            None => self.unset(key),
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable stored value");
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .map_err(|e| crate::error::AgentError::Internal(format!("serialize {}: {}", key, e)))?;
        self.set(key, raw);
        Ok(())
    }

    /// Persist all dirty keys. Returns the number of keys written.
    pub async fn flush_dirty(&mut self) -> Result<usize> {
        if self.dirty.is_empty() {
            return Ok(0);
        }
        let Some(pool) = &self.pool else {
            let count = self.dirty.len();
            self.dirty.clear();
            return Ok(count);
        };

        let now = chrono::Utc::now().timestamp_millis();
        let dirty: Vec<String> = self.dirty.drain().collect();
        let mut flushed = 0;
        let mut failed = Vec::new();
        let mut last_error = None;

        for key in dirty {
            let result = match self.cache.get(&key) {
                Some(value) => {
                    execute_with_retry("store_upsert", || async {
                        sqlx::query(
                            r#"
                            INSERT INTO kv (key, value, updated_at)
                            VALUES (?, ?, ?)
                            ON CONFLICT(key) DO UPDATE SET
                                value = excluded.value,
                                updated_at = excluded.updated_at
                            "#,
                        )
                        .bind(&key)
                        .bind(value)
                        .bind(now)
                        .execute(pool)
                        .await
                    })
                    .await
                }
                None => {
                    execute_with_retry("store_delete", || async {
                        sqlx::query("DELETE FROM kv WHERE key = ?")
                            .bind(&key)
                            .execute(pool)
                            .await
                    })
                    .await
                }
            };

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to flush unit state");
                    failed.push(key);
                    last_error = Some(e);
                }
            }
        }

        // Retry on the next flush
        self.dirty.extend(failed);

        if let Some(e) = last_error {
            return Err(e.into());
        }
        debug!(flushed, "Flushed unit state");
        Ok(flushed)
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Database path (None for an ephemeral store).
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Flush pending writes, checkpoint WAL and close the pool.
    pub async fn close(mut self) {
        if let Err(e) = self.flush_dirty().await {
            warn!(error = %e, "Failed to flush unit state on close");
        }
        if let Some(pool) = self.pool.take() {
            let checkpoint = execute_with_retry("store_checkpoint", || async {
                sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                    .execute(&pool)
                    .await
            })
            .await;
            if let Err(e) = checkpoint {
                warn!(error = %e, "Failed to checkpoint unit store");
            }
            pool.close().await;
            debug!("Unit store closed");
        }
    }
}
