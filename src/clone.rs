// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cloning/Provisioning Engine.
//!
//! Re-initializes the local data directory from an upstream unit with a
//! physical base backup. Destructive, so the preconditions are checked
//! rather than trusted:
//!
//! 1. the restart lock is held by this unit
//! 2. this unit is not the master
//! 3. no server is running on the data directory
//!
//! A violated precondition is a bug in the caller and comes back as
//! [`AgentError::InvalidState`].
//!
//! # Failure
//!
//! If the backup tool fails the data directory is half-written. The engine
//! drops the local cluster, forgets it was configured, records which
//! upstream failed, and returns [`CloneOutcome::Failed`] so the coordinator
//! can report `blocked` and end the tick cleanly.

use crate::config::AgentConfig;
use crate::database::{BackupRequest, BaseBackup, DatabaseControl, PeerEndpoint, ReplicationCredentials};
use crate::error::{AgentError, Result};
use crate::lock::{RestartLock, RESTART_LOCK};
use crate::store::{keys, UnitStore};
use std::path::Path;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Result of a clone attempt that ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneOutcome {
    Cloned,
    /// Local cluster dropped; an operator or a config change must intervene.
    Failed { message: String },
}

pub struct CloneEngine<'a> {
    config: &'a AgentConfig,
    db: &'a dyn DatabaseControl,
    backup: &'a dyn BaseBackup,
    lock: &'a dyn RestartLock,
}

impl<'a> CloneEngine<'a> {
    pub fn new(
        config: &'a AgentConfig,
        db: &'a dyn DatabaseControl,
        backup: &'a dyn BaseBackup,
        lock: &'a dyn RestartLock,
    ) -> Self {
        Self {
            config,
            db,
            backup,
            lock,
        }
    }

    /// Clone `upstream` into the local data directory.
    #[instrument(skip_all, fields(upstream = %upstream.unit))]
    pub async fn clone_from(
        &self,
        store: &mut UnitStore,
        is_master: bool,
        upstream: &PeerEndpoint,
        credentials: ReplicationCredentials,
    ) -> Result<CloneOutcome> {
        if is_master {
            return Err(AgentError::InvalidState {
                expected: "standby".to_string(),
                actual: "master".to_string(),
            });
        }
        if !self.lock.is_granted(RESTART_LOCK).await? {
            return Err(AgentError::InvalidState {
                expected: "restart lock held".to_string(),
                actual: "lock not granted".to_string(),
            });
        }
        if self.db.is_running().await? {
            return Err(AgentError::InvalidState {
                expected: "server stopped".to_string(),
                actual: "server running".to_string(),
            });
        }

        let data_dir = &self.config.paths.data_dir;
        self.reset_data_dir(data_dir).await?;

        info!(data_dir = %data_dir.display(), "Cloning upstream");
        let started = Instant::now();
        let request = BackupRequest {
            upstream: upstream.clone(),
            credentials,
            target_dir: data_dir.clone(),
        };

        match self.backup.run(request).await {
            Ok(()) => {
                crate::metrics::record_clone(true, started.elapsed());
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "Clone complete");
                store.set_flag(keys::CLONED, true);
                store.set_flag(keys::CONFIGURED, true);
                store.set_unit(keys::FOLLOWING, Some(&upstream.unit));
                store.unset(keys::CONFIRMED);
                store.unset(keys::UNCONFIRMED_TICKS);
                store.unset(keys::CLONE_FAILED);
                Ok(CloneOutcome::Cloned)
            }
            Err(e) => {
                crate::metrics::record_clone(false, started.elapsed());
                error!(error = %e, "Clone failed, dropping local cluster");
                if let Err(drop_err) = self.db.drop_cluster().await {
                    warn!(error = %drop_err, "Failed to drop cluster after failed clone");
                }
                store.set_flag(keys::CONFIGURED, false);
                store.set_flag(keys::CLONED, false);
                store.unset(keys::FOLLOWING);
                store.set(keys::CLONE_FAILED, upstream.unit.as_str());
                Ok(CloneOutcome::Failed {
                    message: e.to_string(),
                })
            }
        }
    }

    /// Remove and recreate the data directory, mode 0700.
    async fn reset_data_dir(&self, data_dir: &Path) -> Result<()> {
        match tokio::fs::remove_dir_all(data_dir).await {
            Ok(()) => info!(data_dir = %data_dir.display(), "Removed data directory in preparation for clone"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(AgentError::io("remove data directory", e)),
        }
        tokio::fs::create_dir_all(data_dir)
            .await
            .map_err(|e| AgentError::io("create data directory", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700))
                .await
                .map_err(|e| AgentError::io("chmod data directory", e))?;
            if let (Some(uid), Some(gid)) = (self.config.paths.owner_uid, self.config.paths.owner_gid) {
                std::os::unix::fs::chown(data_dir, Some(uid), Some(gid))
                    .map_err(|e| AgentError::io("chown data directory", e))?;
            }
        }
        Ok(())
    }
}
