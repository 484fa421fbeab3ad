//! Domain model (ids, messages, actors, outcomes, retry decisions).
//!
//! Everything here is a plain value or a pure function: no broker access,
//! no clocks, no I/O.

pub mod actor;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod message;
pub mod outcome;
pub mod retry;
pub mod state;

pub use actor::{
    Actor, ActorBuilder, DEFAULT_QUEUE_NAME, FnHandler, Handler, handler_fn, validate_queue_name,
};
pub use decision::{AttemptState, Decider, Decision, DefaultDecider, RetryWhen};
pub use errors::{ActorError, FailureKind};
pub use ids::{GroupId, Id, IdMarker, MessageId, PipelineId};
pub use message::{GroupInfo, Message, MessageOptions, PipeTarget};
pub use outcome::{Failure, Outcome};
pub use retry::{DEFAULT_MAX_BACKOFF, DEFAULT_MIN_BACKOFF, RetryPolicy};
pub use state::MessageState;
