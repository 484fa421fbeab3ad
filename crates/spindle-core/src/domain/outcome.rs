//! Outcome model: what the result tracker stores per message.

use serde::{Deserialize, Serialize};

use super::errors::{ActorError, FailureKind};

/// A stored failure: the kind plus the error representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub error: String,
}

impl Failure {
    pub fn from_error(error: &ActorError) -> Self {
        Self {
            kind: error.kind(),
            error: error.repr(),
        }
    }

    pub fn is_parent_failed(&self) -> bool {
        self.kind == FailureKind::ParentFailed
    }
}

/// A result entry keyed by message id.
///
/// `Forgotten` is the tombstone left behind by a forgetting read: the value is
/// gone but the message still counts as completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Success(serde_json::Value),
    Failure(Failure),
    Forgotten,
}

impl Outcome {
    pub fn failure(error: &ActorError) -> Self {
        Outcome::Failure(Failure::from_error(error))
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failure(_))
    }
}
