//! Workload status: the only channel an operator sees.
//!
//! A tick collects status updates on a [`StatusBoard`]. Later updates
//! replace earlier ones, except that `blocked` is sticky for the rest of
//! the tick: once something is known to need an operator, a later
//! "waiting" from an unrelated rule must not hide it.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Maintenance,
    Blocked,
    Waiting,
    Active,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Maintenance => "maintenance",
            Self::Blocked => "blocked",
            Self::Waiting => "waiting",
            Self::Active => "active",
        }
    }
}

impl fmt::Display for StatusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub state: StatusState,
    pub message: String,
}

impl WorkloadStatus {
    pub fn new(state: StatusState, message: impl Into<String>) -> Self {
        Self {
            state,
            message: message.into(),
        }
    }

    pub fn blocked(message: impl Into<String>) -> Self {
        Self::new(StatusState::Blocked, message)
    }

    pub fn waiting(message: impl Into<String>) -> Self {
        Self::new(StatusState::Waiting, message)
    }

    pub fn maintenance(message: impl Into<String>) -> Self {
        Self::new(StatusState::Maintenance, message)
    }

    pub fn active(message: impl Into<String>) -> Self {
        Self::new(StatusState::Active, message)
    }

    pub fn is_blocked(&self) -> bool {
        self.state == StatusState::Blocked
    }
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.state, self.message)
    }
}

/// Status accumulated over one tick.
#[derive(Debug, Default)]
pub struct StatusBoard {
    current: Option<WorkloadStatus>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, status: WorkloadStatus) {
        if self.is_blocked() {
            return;
        }
        self.current = Some(status);
    }

    pub fn blocked(&mut self, message: impl Into<String>) {
        self.set(WorkloadStatus::blocked(message));
    }

    pub fn waiting(&mut self, message: impl Into<String>) {
        self.set(WorkloadStatus::waiting(message));
    }

    pub fn maintenance(&mut self, message: impl Into<String>) {
        self.set(WorkloadStatus::maintenance(message));
    }

    pub fn is_blocked(&self) -> bool {
        self.current.as_ref().is_some_and(WorkloadStatus::is_blocked)
    }

    /// Nothing has claimed the status this tick.
    pub fn is_unset(&self) -> bool {
        self.current.is_none()
    }

    pub fn current(&self) -> Option<&WorkloadStatus> {
        self.current.as_ref()
    }

    pub fn into_status(self) -> Option<WorkloadStatus> {
        self.current
    }
}
