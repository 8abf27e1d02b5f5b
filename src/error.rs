// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication agent.
//!
//! Errors are categorized by their source (local database, peer, durable
//! store, substrate) and by what an operator has to do about them.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Database` | Yes | Local PostgreSQL query or control command failed |
//! | `PeerConnection` | Yes | Peer database unreachable or query failed |
//! | `Substrate` | Yes | Leadership/relation substrate call failed |
//! | `Timeout` | No | Bounded poll (promote, drain) exceeded its limit |
//! | `BackupFailed` | No | Base backup exited non-zero; local cluster is corrupt |
//! | `Store` | No | Local SQLite errors (needs operator attention) |
//! | `Config` | No | Configuration invalid |
//! | `NotLeader` | No | Leadership write attempted by a non-leader |
//! | `InvalidState` | No | Precondition violated (implementation bug) |
//! | `Io` | No | Filesystem operation failed |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Retryable errors are transient: the tick that hit them reports a
//! `waiting` status and the next tick re-examines state. Non-retryable
//! errors surface as `blocked`.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while reconciling replication state.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Local database query or control command failure.
    #[error("Database error ({operation}): {message}")]
    Database {
        operation: String,
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    /// SQLite error in the durable unit store.
    #[error("Unit store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Peer database unreachable or query failed.
    #[error("Peer connection error ({unit}): {message}")]
    PeerConnection { unit: String, message: String },

    /// The physical base backup tool failed.
    ///
    /// The local data directory is half-written at this point and must
    /// not be trusted.
    #[error("Base backup from {upstream} failed: {message}")]
    BackupFailed { upstream: String, message: String },

    /// A bounded wait ran out of time.
    #[error("Timed out after {elapsed:?} waiting for {operation}")]
    Timeout { operation: String, elapsed: Duration },

    /// Leadership settings can only be written by the leader.
    #[error("Not the leader, cannot write leadership setting {0}")]
    NotLeader(String),

    /// Event substrate call failed.
    #[error("Substrate error ({operation}): {message}")]
    Substrate { operation: String, message: String },

    /// A precondition did not hold.
    ///
    /// Raised for things like cloning while being the master, or
    /// pointing the recovery target at ourselves.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Filesystem operation failed.
    #[error("I/O error ({operation}): {source}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create a database error from an sqlx error.
    pub fn database(operation: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Database {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a database error without source
    pub fn database_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Database {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an I/O error with the operation that produced it.
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Database { .. } => true,
            Self::PeerConnection { .. } => true,
            Self::Substrate { .. } => true,
            Self::Timeout { .. } => false,
            Self::BackupFailed { .. } => false, // Local cluster is corrupt
            Self::Store(_) => false,
            Self::Config(_) => false,
            Self::NotLeader(_) => false,
            Self::InvalidState { .. } => false,
            Self::Io { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Database { .. } => "database",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::PeerConnection { .. } => "peer_connection",
            Self::BackupFailed { .. } => "backup_failed",
            Self::Timeout { .. } => "timeout",
            Self::NotLeader(_) => "not_leader",
            Self::Substrate { .. } => "substrate",
            Self::InvalidState { .. } => "invalid_state",
            Self::Io { .. } => "io",
            Self::Internal(_) => "internal",
        }
    }
}
