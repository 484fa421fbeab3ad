//! Errors - actor failures and their classification.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// FailureKind は実行失敗の分類
///
/// - `Failed`: an ordinary handler failure.
/// - `RateLimitExceeded`: the handler hit a rate limit; logged as a warning
///   but otherwise retried like any other failure.
/// - `TimeLimitExceeded`: the attempt was aborted by the worker time limit.
/// - `ParentFailed`: synthetic failure inherited from an upstream step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Failed,
    RateLimitExceeded,
    TimeLimitExceeded,
    ParentFailed,
}

/// An error returned by an actor handler.
///
/// `name` is the error class (`"ValueError"`, `"RuntimeError"`, ...) so retry
/// predicates can match on it, `message` is free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorError {
    kind: FailureKind,
    name: String,
    message: String,
}

impl ActorError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Failed,
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn rate_limit_exceeded(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::RateLimitExceeded,
            name: "RateLimitExceeded".to_string(),
            message: message.into(),
        }
    }

    pub fn time_limit_exceeded(limit: Duration) -> Self {
        Self {
            kind: FailureKind::TimeLimitExceeded,
            name: "TimeLimitExceeded".to_string(),
            message: format!("exceeded time limit of {}ms", limit.as_millis()),
        }
    }

    pub fn parent_failed(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::ParentFailed,
            name: "ParentFailed".to_string(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind == FailureKind::RateLimitExceeded
    }

    /// `Name("message")`, or `Name()` when there is no message.
    pub fn repr(&self) -> String {
        if self.message.is_empty() {
            format!("{}()", self.name)
        } else {
            format!("{}({:?})", self.name, self.message)
        }
    }
}

impl fmt::Display for ActorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr())
    }
}

impl std::error::Error for ActorError {}
