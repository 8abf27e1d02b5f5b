// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Recovery-Target Manager.
//!
//! Owns the Following Pointer and the recovery configuration that makes a
//! standby stream from its upstream.
//!
//! # Target Changes
//!
//! ```text
//! same upstream    → re-render (host/port may have moved)
//!                    content changed → needs_reload
//! new upstream     → re-render, Following Pointer := upstream,
//!                    needs_restart, replication unconfirmed
//! ```
//!
//! The pointer is stored locally at once but published to peers only after
//! the restart has happened (see the coordinator's publish step), so peers
//! never see a target that is not live yet.
//!
//! # Verification
//!
//! After a (re)start the upstream's replication view must show this unit
//! streaming. Each tick without confirmation is counted. Past
//! `replication_confirm_ticks` the unit reports `blocked` instead of
//! waiting quietly forever.

use crate::config::AgentConfig;
use crate::database::{PeerEndpoint, PeerProbe, ReplicationCredentials};
use crate::error::{AgentError, Result};
use crate::render::{ConfigRenderer, RenderRequest, RECOVERY_TEMPLATE, STANDBY_SIGNAL_TEMPLATE};
use crate::store::{keys, UnitStore};
use crate::unit::UnitId;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument, warn};

/// What `update_recovery_target` changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryUpdate {
    /// Same upstream, identical file.
    Unchanged,
    /// Same upstream, file content changed. Reload pending.
    Rewritten,
    /// New upstream. Restart pending.
    Retargeted { previous: Option<UnitId> },
}

/// Outcome of one verification check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Confirmed,
    Pending { ticks: u32 },
    Stalled { ticks: u32 },
}

/// Quote a libpq connection string value.
fn conninfo_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Build the recovery settings for following `upstream` (or nothing).
pub fn recovery_parameters(
    config: &AgentConfig,
    local: &UnitId,
    upstream: Option<&PeerEndpoint>,
    credentials: Option<&ReplicationCredentials>,
) -> BTreeMap<String, String> {
    let mut data = BTreeMap::new();
    if !config.has_version("12") {
        data.insert("standby_mode".to_string(), "on".to_string());
    }
    data.insert("recovery_target_timeline".to_string(), "latest".to_string());

    if let (Some(upstream), Some(credentials), true) = (upstream, credentials, config.streaming_replication) {
        let conninfo = [
            ("host", upstream.host.clone()),
            ("port", upstream.port.to_string()),
            ("user", credentials.username.clone()),
            ("password", credentials.password.clone()),
            ("application_name", local.to_string()),
        ]
        .iter()
        .map(|(k, v)| format!("{}={}", k, conninfo_value(v)))
        .collect::<Vec<_>>()
        .join(" ");
        data.insert("primary_conninfo".to_string(), conninfo);
    }

    if let Some(command) = &config.archive_restore_command {
        data.insert("restore_command".to_string(), command.clone());
    }
    data
}

pub struct RecoveryManager<'a> {
    config: &'a AgentConfig,
    renderer: &'a dyn ConfigRenderer,
}

impl<'a> RecoveryManager<'a> {
    pub fn new(config: &'a AgentConfig, renderer: &'a dyn ConfigRenderer) -> Self {
        Self { config, renderer }
    }

    fn owner(&self) -> Option<(u32, u32)> {
        match (self.config.paths.owner_uid, self.config.paths.owner_gid) {
            (Some(uid), Some(gid)) => Some((uid, gid)),
            _ => None,
        }
    }

    /// Render the recovery file (and standby signal where needed).
    /// Returns true if anything on disk changed.
    async fn render(&self, data: BTreeMap<String, String>) -> Result<bool> {
        let mut changed = self
            .renderer
            .render(RenderRequest {
                template: RECOVERY_TEMPLATE,
                path: self.config.recovery_conf_path(),
                data,
                mode: 0o600,
                owner: self.owner(),
            })
            .await?;

        if self.config.has_version("12") {
            changed |= self
                .renderer
                .render(RenderRequest {
                    template: STANDBY_SIGNAL_TEMPLATE,
                    path: self.config.paths.data_dir.join("standby.signal"),
                    data: BTreeMap::new(),
                    mode: 0o600,
                    owner: self.owner(),
                })
                .await?;
        }
        Ok(changed)
    }

    /// Point this unit's recovery configuration at `upstream`.
    #[instrument(skip_all, fields(upstream = %upstream.unit))]
    pub async fn update_recovery_target(
        &self,
        store: &mut UnitStore,
        local: &UnitId,
        upstream: &PeerEndpoint,
        credentials: &ReplicationCredentials,
    ) -> Result<RecoveryUpdate> {
        if upstream.unit == *local {
            return Err(AgentError::InvalidState {
                expected: "upstream is another unit".to_string(),
                actual: format!("upstream is {}", local),
            });
        }

        let following = store.get_unit(keys::FOLLOWING);
        let data = recovery_parameters(self.config, local, Some(upstream), Some(credentials));
        let changed = self.render(data).await?;

        if following.as_ref() == Some(&upstream.unit) {
            debug!("Continuing to follow upstream");
            if changed {
                info!("Recovery configuration changed, reload required");
                store.set_flag(keys::NEEDS_RELOAD, true);
                return Ok(RecoveryUpdate::Rewritten);
            }
            return Ok(RecoveryUpdate::Unchanged);
        }

        info!(previous = ?following.as_ref().map(UnitId::as_str), "Following new upstream");
        crate::metrics::record_recovery_target_change();
        store.set_unit(keys::FOLLOWING, Some(&upstream.unit));
        store.set_flag(keys::NEEDS_RESTART, true);
        store.set_flag(keys::NEEDS_RELOAD, false);
        reset_confirmation(store);
        Ok(RecoveryUpdate::Retargeted { previous: following })
    }

    /// Stop following anything. Used when the upstream has departed.
    /// Returns false if nothing was followed.
    pub async fn detach(&self, store: &mut UnitStore, local: &UnitId) -> Result<bool> {
        let Some(previous) = store.get_unit(keys::FOLLOWING) else {
            return Ok(false);
        };
        warn!(previous = %previous, "Detaching from departed upstream");
        let data = recovery_parameters(self.config, local, None, None);
        self.render(data).await?;
        store.unset(keys::FOLLOWING);
        store.set_flag(keys::NEEDS_RESTART, true);
        store.set_flag(keys::NEEDS_RELOAD, false);
        reset_confirmation(store);
        Ok(true)
    }

    /// Remove recovery files once this unit is primary.
    pub async fn clear(&self, store: &mut UnitStore) -> Result<()> {
        self.renderer.remove(self.config.recovery_conf_path()).await?;
        if self.config.has_version("12") {
            self.renderer
                .remove(self.config.paths.data_dir.join("standby.signal"))
                .await?;
        }
        store.unset(keys::FOLLOWING);
        store.set_flag(keys::NEEDS_RELOAD, false);
        reset_confirmation(store);
        Ok(())
    }
}

fn reset_confirmation(store: &mut UnitStore) {
    store.unset(keys::CONFIRMED);
    store.unset(keys::UNCONFIRMED_TICKS);
}

/// Check that `upstream` streams to this unit, counting unconfirmed ticks.
pub async fn verify_replication(
    store: &mut UnitStore,
    config: &AgentConfig,
    probe: &dyn PeerProbe,
    upstream: &PeerEndpoint,
    credentials: &ReplicationCredentials,
    client_host: &str,
) -> Verification {
    let flowing = match probe
        .is_replicating(upstream.clone(), credentials.clone(), client_host.to_string())
        .await
    {
        Ok(flowing) => flowing,
        Err(e) => {
            warn!(upstream = %upstream.unit, error = %e, "Unable to query replication state");
            false
        }
    };

    if flowing {
        info!(upstream = %upstream.unit, "Replication confirmed");
        store.set_flag(keys::CONFIRMED, true);
        store.unset(keys::UNCONFIRMED_TICKS);
        return Verification::Confirmed;
    }

    let ticks = store.get_u64(keys::UNCONFIRMED_TICKS).unwrap_or(0) as u32 + 1;
    store.set(keys::UNCONFIRMED_TICKS, ticks.to_string());
    if ticks >= config.replication_confirm_ticks {
        warn!(upstream = %upstream.unit, ticks, "Replication not flowing");
        Verification::Stalled { ticks }
    } else {
        debug!(upstream = %upstream.unit, ticks, "Replication not yet confirmed");
        Verification::Pending { ticks }
    }
}
