//! ResultBackend port - 実行結果の保存先
//!
//! Any key/value store with per-key TTL, atomic get/delete and a per-group
//! record can back the result tracker. Writes are last-write-wins; nothing
//! here needs cross-key transactions.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::{GroupId, MessageId, Outcome};
use crate::error::SpindleError;

/// Polling interval of the default `wait`.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[async_trait]
pub trait ResultBackend: Send + Sync {
    async fn store(
        &self,
        message_id: MessageId,
        outcome: Outcome,
        ttl: Duration,
    ) -> Result<(), SpindleError>;

    /// `Ok(None)` when nothing was ever stored (or it expired). With
    /// `forget`, a present entry is replaced by `Outcome::Forgotten` after it
    /// has been read.
    async fn get(&self, message_id: MessageId, forget: bool)
    -> Result<Option<Outcome>, SpindleError>;

    /// Block until an outcome is present, or fail with `ResultTimeout`.
    ///
    /// Waits are per message. A group has no outcome of its own: waiting for
    /// one means waiting for each member id under a shared deadline, which is
    /// what `CollectionResults::wait` does.
    ///
    /// The default polls `get`; backends with a native wait primitive should
    /// override it.
    async fn wait(
        &self,
        message_id: MessageId,
        timeout: Duration,
        forget: bool,
    ) -> Result<Outcome, SpindleError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.get(message_id, forget).await? {
                return Ok(outcome);
            }
            if Instant::now() >= deadline {
                return Err(SpindleError::ResultTimeout(message_id.to_string()));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(remaining)).await;
        }
    }

    /// Drop the value of a stored outcome, keeping its completion visible.
    async fn forget(&self, message_id: MessageId) -> Result<(), SpindleError> {
        self.get(message_id, true).await.map(|_| ())
    }

    async fn set_group_message_ids(
        &self,
        group_id: GroupId,
        message_ids: &[MessageId],
        ttl: Duration,
    ) -> Result<(), SpindleError>;

    /// Fails with `MessageIdsMissing` if never stored or already deleted.
    async fn get_group_message_ids(
        &self,
        group_id: GroupId,
    ) -> Result<Vec<MessageId>, SpindleError>;

    async fn delete_group_message_ids(&self, group_id: GroupId) -> Result<(), SpindleError>;

    /// Atomically bump the completion counter of a group; returns the new value.
    async fn increment_group_completion(
        &self,
        group_id: GroupId,
        ttl: Duration,
    ) -> Result<u64, SpindleError>;
}
