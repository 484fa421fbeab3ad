//! Results - 結果ストアの読み取りビュー
//!
//! - `MessageResult`: 1 メッセージの結果
//! - `CollectionResults`: パイプライン / グループの結果（順序付き）
//! - `ResultHandle`: `Pipeline::result` の戻り値（末尾がグループなら一覧）
//!
//! Reads never touch the broker. A read either finds an outcome, or fails
//! with `ResultMissing` (non-blocking) / `ResultTimeout` (blocking).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;

use crate::domain::{MessageId, Outcome};
use crate::error::SpindleError;
use crate::ports::ResultBackend;

/// Blocking reads give up after this long unless told otherwise.
pub const DEFAULT_RESULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How to read a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetOptions {
    pub block: bool,
    /// Only used when blocking; `None` means [`DEFAULT_RESULT_TIMEOUT`].
    pub timeout: Option<Duration>,
    /// Replace the stored value by a tombstone once read.
    pub forget: bool,
    /// Turn a stored failure into `SpindleError::ErrorStored`.
    pub raise_on_error: bool,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            block: false,
            timeout: None,
            forget: false,
            raise_on_error: true,
        }
    }
}

impl GetOptions {
    pub fn blocking() -> Self {
        Self {
            block: true,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.block = true;
        self.timeout = Some(timeout);
        self
    }

    pub fn forgetting(mut self) -> Self {
        self.forget = true;
        self
    }

    pub fn without_raising(mut self) -> Self {
        self.raise_on_error = false;
        self
    }

    fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(DEFAULT_RESULT_TIMEOUT)
    }
}

/// Map a stored outcome to the value handed to callers.
fn into_value(outcome: Outcome, raise_on_error: bool) -> Result<Option<Value>, SpindleError> {
    match outcome {
        Outcome::Success(value) => Ok(Some(value)),
        Outcome::Forgotten => Ok(None),
        Outcome::Failure(failure) if raise_on_error => {
            Err(SpindleError::ErrorStored(failure.error))
        }
        Outcome::Failure(_) => Ok(None),
    }
}

async fn read(
    backend: &dyn ResultBackend,
    message_id: MessageId,
    options: &GetOptions,
    deadline: Instant,
) -> Result<Outcome, SpindleError> {
    if options.block {
        let timeout = deadline.saturating_duration_since(Instant::now());
        backend.wait(message_id, timeout, options.forget).await
    } else {
        backend
            .get(message_id, options.forget)
            .await?
            .ok_or_else(|| SpindleError::ResultMissing(message_id.to_string()))
    }
}

/// Result of a single message.
#[derive(Clone)]
pub struct MessageResult {
    backend: Arc<dyn ResultBackend>,
    message_id: MessageId,
}

impl MessageResult {
    pub fn new(backend: Arc<dyn ResultBackend>, message_id: MessageId) -> Self {
        Self { backend, message_id }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// The raw stored outcome.
    pub async fn outcome(&self, options: GetOptions) -> Result<Outcome, SpindleError> {
        let deadline = Instant::now() + options.timeout();
        read(self.backend.as_ref(), self.message_id, &options, deadline).await
    }

    /// `None` for a forgotten result, or for a failure read without raising.
    pub async fn get(&self, options: GetOptions) -> Result<Option<Value>, SpindleError> {
        into_value(self.outcome(options).await?, options.raise_on_error)
    }

    /// Block until the message finished, without reading its value.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), SpindleError> {
        self.backend
            .wait(self.message_id, timeout.unwrap_or(DEFAULT_RESULT_TIMEOUT), false)
            .await
            .map(|_| ())
    }

    /// Stored in any form, tombstones included.
    pub async fn completed(&self) -> Result<bool, SpindleError> {
        Ok(self.backend.get(self.message_id, false).await?.is_some())
    }
}

impl std::fmt::Debug for MessageResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageResult")
            .field("message_id", &self.message_id)
            .finish_non_exhaustive()
    }
}

/// Ordered results of several messages.
#[derive(Clone)]
pub struct CollectionResults {
    backend: Arc<dyn ResultBackend>,
    message_ids: Vec<MessageId>,
}

impl CollectionResults {
    pub fn new(backend: Arc<dyn ResultBackend>, message_ids: Vec<MessageId>) -> Self {
        Self { backend, message_ids }
    }

    pub fn message_ids(&self) -> &[MessageId] {
        &self.message_ids
    }

    pub fn len(&self) -> usize {
        self.message_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.message_ids.is_empty()
    }

    /// One value per message, in order. A blocking read shares a single
    /// deadline across every message.
    pub async fn get(&self, options: GetOptions) -> Result<Vec<Option<Value>>, SpindleError> {
        let deadline = Instant::now() + options.timeout();
        let mut values = Vec::with_capacity(self.message_ids.len());
        for message_id in &self.message_ids {
            let outcome = read(self.backend.as_ref(), *message_id, &options, deadline).await?;
            values.push(into_value(outcome, options.raise_on_error)?);
        }
        Ok(values)
    }

    /// Block until every message finished.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), SpindleError> {
        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_RESULT_TIMEOUT);
        for message_id in &self.message_ids {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.backend.wait(*message_id, remaining, false).await?;
        }
        Ok(())
    }

    pub async fn completed_count(&self) -> Result<usize, SpindleError> {
        let mut count = 0;
        for message_id in &self.message_ids {
            if self.backend.get(*message_id, false).await?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn completed(&self) -> Result<bool, SpindleError> {
        Ok(self.completed_count().await? == self.message_ids.len())
    }
}

impl std::fmt::Debug for CollectionResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionResults")
            .field("message_ids", &self.message_ids)
            .finish_non_exhaustive()
    }
}

/// What `Pipeline::result` points at.
#[derive(Debug, Clone)]
pub enum ResultHandle {
    Message(MessageResult),
    Group(CollectionResults),
}

impl ResultHandle {
    /// A trailing group reads as an array, `null` standing in for values
    /// that are not available.
    pub async fn get(&self, options: GetOptions) -> Result<Option<Value>, SpindleError> {
        match self {
            ResultHandle::Message(result) => result.get(options).await,
            ResultHandle::Group(results) => {
                let values = results.get(options).await?;
                Ok(Some(Value::Array(
                    values.into_iter().map(|value| value.unwrap_or(Value::Null)).collect(),
                )))
            }
        }
    }

    pub async fn completed(&self) -> Result<bool, SpindleError> {
        match self {
            ResultHandle::Message(result) => result.completed().await,
            ResultHandle::Group(results) => results.completed().await,
        }
    }

    pub async fn wait(&self, timeout: Option<Duration>) -> Result<(), SpindleError> {
        match self {
            ResultHandle::Message(result) => result.wait(timeout).await,
            ResultHandle::Group(results) => results.wait(timeout).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ActorError;
    use crate::impls::LocalBackend;
    use serde_json::json;

    const TTL: Duration = Duration::from_secs(60);

    fn backend() -> Arc<dyn ResultBackend> {
        Arc::new(LocalBackend::new())
    }

    #[tokio::test]
    async fn missing_results_fail_without_blocking() {
        let result = MessageResult::new(backend(), MessageId::generate());
        let err = result.get(GetOptions::default()).await.unwrap_err();
        assert!(matches!(err, SpindleError::ResultMissing(_)));
        assert!(!result.completed().await.unwrap());
    }

    #[tokio::test]
    async fn blocking_reads_time_out() {
        let result = MessageResult::new(backend(), MessageId::generate());
        let options = GetOptions::default().with_timeout(Duration::from_millis(20));
        let err = result.get(options).await.unwrap_err();
        assert!(matches!(err, SpindleError::ResultTimeout(_)));
    }

    #[tokio::test]
    async fn stored_failures_raise_unless_told_otherwise() {
        let backend = backend();
        let message_id = MessageId::generate();
        let error = ActorError::new("ValueError", "bad input");
        backend.store(message_id, Outcome::failure(&error), TTL).await.unwrap();

        let result = MessageResult::new(backend, message_id);
        match result.get(GetOptions::default()).await {
            Err(SpindleError::ErrorStored(repr)) => assert_eq!(repr, error.repr()),
            other => panic!("expected a stored error, got {other:?}"),
        }
        assert_eq!(result.get(GetOptions::default().without_raising()).await.unwrap(), None);
        assert!(result.outcome(GetOptions::default()).await.unwrap().is_failure());
    }

    #[tokio::test]
    async fn forgetting_reads_leave_the_message_completed() {
        let backend = backend();
        let message_id = MessageId::generate();
        backend.store(message_id, Outcome::Success(json!(3)), TTL).await.unwrap();

        let result = MessageResult::new(backend, message_id);
        assert_eq!(result.get(GetOptions::default().forgetting()).await.unwrap(), Some(json!(3)));
        assert_eq!(result.get(GetOptions::default()).await.unwrap(), None);
        assert!(result.completed().await.unwrap());
    }

    #[tokio::test]
    async fn collections_count_completed_members() {
        let backend = backend();
        let ids: Vec<_> = (0..3).map(|_| MessageId::generate()).collect();
        let results = CollectionResults::new(Arc::clone(&backend), ids.clone());
        assert_eq!(results.completed_count().await.unwrap(), 0);

        for (n, message_id) in ids.iter().enumerate() {
            backend.store(*message_id, Outcome::Success(json!(n)), TTL).await.unwrap();
            assert_eq!(results.completed_count().await.unwrap(), n + 1);
        }
        assert!(results.completed().await.unwrap());
        assert_eq!(
            results.get(GetOptions::blocking()).await.unwrap(),
            vec![Some(json!(0)), Some(json!(1)), Some(json!(2))]
        );
    }

    #[tokio::test]
    async fn group_handles_read_as_arrays() {
        let backend = backend();
        let ids = vec![MessageId::generate(), MessageId::generate()];
        backend.store(ids[0], Outcome::Success(json!(1)), TTL).await.unwrap();
        backend.store(ids[1], Outcome::Forgotten, TTL).await.unwrap();

        let handle = ResultHandle::Group(CollectionResults::new(backend, ids));
        assert_eq!(handle.get(GetOptions::default()).await.unwrap(), Some(json!([1, null])));
    }
}
