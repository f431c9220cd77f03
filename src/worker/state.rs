//! Worker state machine.

use serde::{Deserialize, Serialize};

/// Slot index of a worker in the pool. Stable across respawns.
pub type WorkerId = usize;

/// State of a pool worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Process launched, waiting for `ready`.
    Starting,
    /// Idle and able to take a job.
    Ready,
    /// Running exactly one job.
    Busy,
    /// `shutdown` sent, waiting for the process to go away.
    Terminating,
    /// No live process in this slot.
    Terminated,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Starting, Ready) | (Starting, Terminating) | (Starting, Terminated) |
            (Ready, Busy) | (Ready, Terminating) | (Ready, Terminated) |
            (Busy, Ready) | (Busy, Terminating) | (Busy, Terminated) |
            (Terminating, Terminated) |
            // Respawn into the same slot
            (Terminated, Starting)
        )
    }

    /// Whether the slot counts toward usable pool capacity.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Ready | Self::Busy)
    }

    /// Whether a process is (or may still be) alive in this slot.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        write!(f, "{s}")
    }
}
