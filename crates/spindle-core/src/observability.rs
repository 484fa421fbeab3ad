use serde::{Deserialize, Serialize};

/// Message counts of the three physical queues behind one logical queue.
///
/// Counts are ready messages only: deliveries held unacked by a consumer are
/// not included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: u32,
    pub delayed: u32,
    pub dead: u32,
}

impl QueueCounts {
    /// Messages still waiting to be processed (dead letters excluded).
    pub fn pending(&self) -> u32 {
        self.queued.saturating_add(self.delayed)
    }
}
