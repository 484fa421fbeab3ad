use thiserror::Error;

use crate::ports::amqp::AmqpError;

/// Errors surfaced by the broker adapter, the worker and the result views.
///
/// Handler failures are not part of this enum: they travel as
/// [`ActorError`](crate::domain::ActorError) values and end up stored as
/// outcomes.
#[derive(Debug, Error)]
pub enum SpindleError {
    /// The broker link was lost and the bounded retry budget ran out.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("timed out while waiting for queue {0} to drain")]
    QueueJoinTimeout(String),

    #[error("actor not found: {0}")]
    ActorNotFound(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("result missing for message {0}")]
    ResultMissing(String),

    #[error("timed out waiting for result of {0}")]
    ResultTimeout(String),

    #[error("message ids missing for group {0}")]
    MessageIdsMissing(String),

    /// A stored failure read with `raise_on_error`.
    #[error("{0}")]
    ErrorStored(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<AmqpError> for SpindleError {
    fn from(err: AmqpError) -> Self {
        SpindleError::ConnectionClosed(err.to_string())
    }
}
