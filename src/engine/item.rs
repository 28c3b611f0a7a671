//! Per-item execution state

use serde::{Deserialize, Serialize};

/// Lifecycle of one work item inside the scheduler.
///
/// `Pending -> Executing -> {Succeeded | RetryScheduled -> Executing | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ItemState {
    /// Waiting for a slot or a rate-limit permit
    #[default]
    Pending,
    /// An attempt is in flight
    Executing,
    /// Waiting out a backoff before the next attempt
    RetryScheduled,
    /// Terminal: the operation succeeded
    Succeeded,
    /// Terminal: failed permanently or ran out of attempts
    Failed,
}

impl ItemState {
    /// Whether the state is final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemState::Succeeded | ItemState::Failed)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: ItemState) -> bool {
        use ItemState::*;
        matches!(
            (self, next),
            (Pending, Executing)
                | (Pending, Failed)
                | (Executing, Succeeded)
                | (Executing, RetryScheduled)
                | (Executing, Failed)
                | (RetryScheduled, Executing)
                | (RetryScheduled, Failed)
        )
    }

    /// Move to `next`, returning the previous state on an illegal transition.
    pub fn advance(&mut self, next: ItemState) -> Result<(), ItemState> {
        if self.can_transition_to(next) {
            *self = next;
            Ok(())
        } else {
            Err(*self)
        }
    }
}
