//! Typed view of the Leadership Record.
//!
//! The record lives in the substrate as string settings, readable by every
//! unit and writable only by the leader. `master` is authoritative for who
//! accepts writes. `anointed_master` is set only while a switchover is in
//! flight.

use crate::relation::WireBag;
use crate::unit::UnitId;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;

/// Leadership setting names.
pub mod keys {
    pub const MASTER: &str = "master";
    pub const ANOINTED_MASTER: &str = "anointed_master";
    pub const REPLICATION_PASSWORD: &str = "replication_password";
}

/// Length of the generated replication password.
pub const PASSWORD_LENGTH: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadershipRecord {
    pub master: Option<UnitId>,
    pub anointed_master: Option<UnitId>,
    pub replication_password: Option<String>,
}

impl LeadershipRecord {
    pub fn from_settings(settings: &WireBag) -> Self {
        Self {
            master: parse_unit(settings, keys::MASTER),
            anointed_master: parse_unit(settings, keys::ANOINTED_MASTER),
            replication_password: settings
                .get(keys::REPLICATION_PASSWORD)
                .filter(|p| !p.is_empty())
                .cloned(),
        }
    }

    /// A switchover is in flight.
    pub fn switchover_pending(&self) -> bool {
        match (&self.anointed_master, &self.master) {
            (Some(anointed), Some(master)) => anointed != master,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Apply an update locally, so the leader sees its own writes within
    /// the tick that made them.
    pub fn apply(&mut self, update: &LeadershipUpdate) {
        for (key, value) in &update.changes {
            match *key {
                keys::MASTER => self.master = value.as_deref().and_then(|v| UnitId::new(v).ok()),
                keys::ANOINTED_MASTER => {
                    self.anointed_master = value.as_deref().and_then(|v| UnitId::new(v).ok())
                }
                keys::REPLICATION_PASSWORD => self.replication_password = value.clone(),
                _ => {}
            }
        }
    }
}

fn parse_unit(settings: &WireBag, key: &str) -> Option<UnitId> {
    let raw = settings.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())?;
    match UnitId::new(raw) {
        Ok(unit) => Some(unit),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring malformed leadership setting");
            None
        }
    }
}

/// A batch of leadership writes. `None` clears a setting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadershipUpdate {
    pub changes: Vec<(&'static str, Option<String>)>,
}

impl LeadershipUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn master(mut self, unit: &UnitId) -> Self {
        self.changes.push((keys::MASTER, Some(unit.to_string())));
        self
    }

    pub fn anointed_master(mut self, unit: Option<&UnitId>) -> Self {
        self.changes
            .push((keys::ANOINTED_MASTER, unit.map(UnitId::to_string)));
        self
    }

    pub fn replication_password(mut self, password: String) -> Self {
        self.changes.push((keys::REPLICATION_PASSWORD, Some(password)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Generate a fresh replication password.
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}
