// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Peer-group-wide mutual exclusion ("restart permission").
//!
//! A serial coordinator: at most one unit holds a given lock at a time.
//! `acquire()` never blocks. It answers `Granted` or `Requested`, and a unit
//! that was told `Requested` asks again on its next tick.
//!
//! # Grant Rule
//!
//! 1. A unit that already holds the lock keeps it.
//! 2. If another unit holds it, the caller is queued.
//! 3. Otherwise the lock goes to the head of the queue (the caller, if the
//!    queue is empty).
//!
//! Releasing also withdraws a pending request, so a unit that stops
//! needing the lock does not stall the queue. `release_if_held` gives back
//! a grant without touching the queue.

use crate::substrate::BoxFuture;
use crate::unit::UnitId;
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Name of the lock guarding every disruptive operation.
pub const RESTART_LOCK: &str = "restart";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Granted,
    Requested,
}

impl LockStatus {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Requested => "requested",
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<UnitId>,
    queue: VecDeque<UnitId>,
}

/// Grant bookkeeping for all named locks in a peer group.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: BTreeMap<String, LockState>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, lock: &str, unit: &UnitId) -> LockStatus {
        let state = self.locks.entry(lock.to_string()).or_default();

        if state.holder.as_ref() == Some(unit) {
            return LockStatus::Granted;
        }

        if !state.queue.contains(unit) {
            state.queue.push_back(unit.clone());
        }

        if state.holder.is_some() {
            return LockStatus::Requested;
        }

        if state.queue.front() == Some(unit) {
            state.queue.pop_front();
            state.holder = Some(unit.clone());
            debug!(lock, unit = %unit, "Lock granted");
            LockStatus::Granted
        } else {
            LockStatus::Requested
        }
    }

    /// Release a held lock or withdraw a pending request.
    pub fn release(&mut self, lock: &str, unit: &UnitId) {
        if let Some(state) = self.locks.get_mut(lock) {
            if state.holder.as_ref() == Some(unit) {
                state.holder = None;
                debug!(lock, unit = %unit, "Lock released");
            }
            state.queue.retain(|queued| queued != unit);
        }
    }

    /// Drop every grant and request held by a departed unit.
    pub fn release_all(&mut self, unit: &UnitId) {
        let names: Vec<String> = self.locks.keys().cloned().collect();
        for name in names {
            self.release(&name, unit);
        }
    }

    pub fn holder(&self, lock: &str) -> Option<&UnitId> {
        self.locks.get(lock).and_then(|s| s.holder.as_ref())
    }

    pub fn is_granted(&self, lock: &str, unit: &UnitId) -> bool {
        self.holder(lock) == Some(unit)
    }
}

/// Per-unit handle onto the peer group's lock service.
pub trait RestartLock: Send + Sync {
    fn acquire(&self, lock: &'static str) -> BoxFuture<'_, LockStatus>;

    fn release(&self, lock: &'static str) -> BoxFuture<'_, ()>;

    fn is_granted(&self, lock: &'static str) -> BoxFuture<'_, bool>;

    /// Give `lock` back if this unit holds it. A queued request keeps its
    /// place. Returns whether anything was released.
    fn release_if_held(&self, lock: &'static str) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            if !self.is_granted(lock).await? {
                return Ok(false);
            }
            self.release(lock).await?;
            Ok(true)
        })
    }
}
