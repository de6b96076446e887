//! Poll loop state.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// State of a worker's poll loop.
///
/// The loop cycles `Idle -> Polling -> Dispatching -> Idle`; any state may move
/// to `Stopped`, which is terminal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Waiting for capacity or sitting out a backoff delay.
    #[default]
    Idle,
    /// A fetch-and-lock call is in flight.
    Polling,
    /// Handing freshly leased tasks to the executor.
    Dispatching,
    /// Cancelled; no further polls will be made.
    Stopped,
}

impl WorkerState {
    /// Returns true if the loop has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(&self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Idle, Polling) | (Polling, Idle) | (Polling, Dispatching) | (Dispatching, Idle) => {
                true
            }
            _ => false,
        }
    }

    /// Validate and perform a transition.
    pub fn transition(self, next: WorkerState) -> Result<WorkerState, CoreError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(CoreError::InvalidStateTransition {
                from: format!("{self:?}"),
                to: format!("{next:?}"),
            })
        }
    }
}
