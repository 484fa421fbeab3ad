//! Actors: named handlers plus their declared default options.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::decision::RetryWhen;
use super::errors::ActorError;
use super::message::{Message, MessageOptions};
use crate::error::SpindleError;

pub const DEFAULT_QUEUE_NAME: &str = "default";

/// The unit of work behind an actor.
///
/// Handlers receive owned args so the future can outlive the message it was
/// decoded from.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, ActorError>;
}

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActorError>> + Send + 'static,
{
    async fn call(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value, ActorError> {
        (self.0)(args, kwargs).await
    }
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// let add = handler_fn(|args, _kwargs| async move {
///     let sum: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
///     Ok(serde_json::json!(sum))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Vec<Value>, Map<String, Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActorError>> + Send + 'static,
{
    FnHandler(f)
}

/// Queue names follow `[A-Za-z_][A-Za-z0-9._-]*`.
pub fn validate_queue_name(queue_name: &str) -> Result<(), SpindleError> {
    let mut chars = queue_name.chars();
    let valid_head = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid_head && valid_tail {
        Ok(())
    } else {
        Err(SpindleError::Configuration(format!(
            "Queue names must start with a letter or an underscore followed by any number \
             of letters, digits, dashes, dots or underscores: {queue_name:?}"
        )))
    }
}

/// A registered, named handler.
#[derive(Clone)]
pub struct Actor {
    actor_name: String,
    queue_name: String,
    handler: Arc<dyn Handler>,
    options: BTreeMap<String, Value>,
    retry_when: Option<RetryWhen>,
}

impl Actor {
    pub fn builder(actor_name: impl Into<String>, handler: impl Handler + 'static) -> ActorBuilder {
        ActorBuilder {
            actor_name: actor_name.into(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            handler: Arc::new(handler),
            options: BTreeMap::new(),
            retry_when: None,
        }
    }

    pub fn actor_name(&self) -> &str {
        &self.actor_name
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }

    pub fn options(&self) -> &BTreeMap<String, Value> {
        &self.options
    }

    pub fn option(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.option(key).and_then(Value::as_u64)
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.option(key).and_then(Value::as_bool)
    }

    pub fn priority(&self) -> Option<u8> {
        self.option_u64("priority").and_then(|p| u8::try_from(p).ok())
    }

    pub fn retry_when(&self) -> Option<&RetryWhen> {
        self.retry_when.as_ref()
    }

    /// Build a message for this actor with positional args.
    pub fn message(&self, args: Vec<Value>) -> Message {
        self.message_with(args, Map::new(), MessageOptions::default())
    }

    pub fn message_with(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: MessageOptions,
    ) -> Message {
        Message::new(&self.queue_name, &self.actor_name, args, kwargs, options)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Actor({})", self.actor_name)
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor")
            .field("actor_name", &self.actor_name)
            .field("queue_name", &self.queue_name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

pub struct ActorBuilder {
    actor_name: String,
    queue_name: String,
    handler: Arc<dyn Handler>,
    options: BTreeMap<String, Value>,
    retry_when: Option<RetryWhen>,
}

impl ActorBuilder {
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// Set a declared option. Whether the key is recognised is checked when
    /// the actor is declared on a broker.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn retry_when(
        mut self,
        predicate: impl Fn(u32, &ActorError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_when = Some(RetryWhen::new(predicate));
        self
    }

    pub fn build(self) -> Result<Actor, SpindleError> {
        if self.actor_name.is_empty() {
            return Err(SpindleError::Configuration("actor name must not be empty".to_string()));
        }
        validate_queue_name(&self.queue_name)?;
        Ok(Actor {
            actor_name: self.actor_name,
            queue_name: self.queue_name,
            handler: self.handler,
            options: self.options,
            retry_when: self.retry_when,
        })
    }
}
