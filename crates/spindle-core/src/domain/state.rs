//! Message processing state machine.

use serde::{Deserialize, Serialize};

/// Where a consumed message is in its processing lifecycle.
///
/// State transitions:
/// - Received -> Running -> Succeeded
/// - Received -> Running -> Retrying (a delayed copy was enqueued)
/// - Received -> Running -> DeadLettered (retries exhausted or predicate declined)
/// - Received -> Skipped (a before-process hook short-circuited)
/// - Received -> DeadLettered (unknown actor, or a hook failed the message)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageState {
    Received,
    Running,
    Succeeded,
    Skipped,
    Retrying,
    DeadLettered,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageState::Received | MessageState::Running)
    }

    /// Terminal states whose broker delivery is acked rather than nacked.
    pub fn acks_delivery(self) -> bool {
        matches!(
            self,
            MessageState::Succeeded | MessageState::Skipped | MessageState::Retrying
        )
    }
}
