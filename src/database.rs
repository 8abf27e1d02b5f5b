// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database collaborator interfaces.
//!
//! Three seams separate the coordinator from PostgreSQL itself:
//!
//! - [`DatabaseControl`]: the local instance (service control, recovery
//!   state, WAL positions, administrative SQL)
//! - [`PeerProbe`]: read-only queries against peer instances
//! - [`BaseBackup`]: the physical clone tool
//!
//! The production implementations live in [`crate::postgres`]. Tests and
//! simulations substitute their own.

use crate::error::{AgentError, Result};
use crate::substrate::BoxFuture;
use crate::unit::UnitId;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A write-ahead log position.
///
/// PostgreSQL prints positions as two hex halves, `16/B374D848`. The
/// combined 64-bit value is totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Bytes between two positions (zero if `other` is ahead).
    pub fn bytes_ahead_of(&self, other: Lsn) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl FromStr for Lsn {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || AgentError::database_msg("parse wal position", format!("invalid LSN {:?}", s));
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        if hi.is_empty() || lo.is_empty() || hi.len() > 8 || lo.len() > 8 {
            return Err(invalid());
        }
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

/// How to reach a peer's database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub unit: UnitId,
    pub host: String,
    pub port: u16,
}

/// Credentials of the internal replication role.
#[derive(Clone, PartialEq, Eq)]
pub struct ReplicationCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ReplicationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Local PostgreSQL instance.
pub trait DatabaseControl: Send + Sync {
    fn is_running(&self) -> BoxFuture<'_, bool>;

    /// True while the instance is a hot standby. Only meaningful when running.
    fn is_in_recovery(&self) -> BoxFuture<'_, bool>;

    fn start(&self) -> BoxFuture<'_, ()>;

    fn stop(&self) -> BoxFuture<'_, ()>;

    fn reload(&self) -> BoxFuture<'_, ()>;

    /// Issue the promotion request. Returns once the request is accepted,
    /// not once recovery has ended.
    fn promote(&self) -> BoxFuture<'_, ()>;

    /// Remove the local cluster after it has become untrustworthy.
    fn drop_cluster(&self) -> BoxFuture<'_, ()>;

    /// Last WAL position received from upstream. `None` when not a standby.
    fn received_position(&self) -> BoxFuture<'_, Option<Lsn>>;

    /// Last WAL position replayed. `None` when not a standby.
    fn replayed_position(&self) -> BoxFuture<'_, Option<Lsn>>;

    /// Create or update the replication role.
    fn ensure_replication_user(&self, credentials: ReplicationCredentials) -> BoxFuture<'_, ()>;
}

/// Queries against peer instances, made as the replication role.
pub trait PeerProbe: Send + Sync {
    /// Replayed position of a standby peer.
    fn replayed_position(&self, peer: PeerEndpoint, credentials: ReplicationCredentials) -> BoxFuture<'_, Lsn>;

    /// Furthest WAL position the peer knows about: its write position as a
    /// primary, or the greater of received and replayed as a standby.
    fn wal_position(&self, peer: PeerEndpoint, credentials: ReplicationCredentials) -> BoxFuture<'_, Lsn>;

    /// Whether `upstream` currently streams WAL to a client at `client_host`.
    fn is_replicating(
        &self,
        upstream: PeerEndpoint,
        credentials: ReplicationCredentials,
        client_host: String,
    ) -> BoxFuture<'_, bool>;
}

/// A physical base backup request.
#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub upstream: PeerEndpoint,
    pub credentials: ReplicationCredentials,
    pub target_dir: PathBuf,
}

/// Physical clone tool.
pub trait BaseBackup: Send + Sync {
    /// Copy the upstream's cluster into the (empty) target directory.
    ///
    /// Fails with [`AgentError::BackupFailed`] if the tool exits non-zero.
    fn run(&self, request: BackupRequest) -> BoxFuture<'_, ()>;
}
