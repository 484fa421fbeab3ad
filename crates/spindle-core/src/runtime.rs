use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::domain::{Actor, ActorError, Message};
use crate::error::SpindleError;

/// Declared actors by name.
///
/// `BrokerBuilder::build` fills it, then the broker shares it read-only
/// with every worker task.
#[derive(Debug, Default)]
pub struct ActorRegistry {
    actors: HashMap<String, Actor>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self {
            actors: HashMap::new(),
        }
    }

    /// Register an actor. Actor names are unique per broker.
    pub fn register(&mut self, actor: Actor) -> Result<(), SpindleError> {
        if self.actors.contains_key(actor.actor_name()) {
            return Err(SpindleError::Configuration(format!(
                "an actor named {:?} is already declared",
                actor.actor_name()
            )));
        }
        self.actors.insert(actor.actor_name().to_string(), actor);
        Ok(())
    }

    pub fn get(&self, actor_name: &str) -> Option<&Actor> {
        self.actors.get(actor_name)
    }

    pub fn contains(&self, actor_name: &str) -> bool {
        self.actors.contains_key(actor_name)
    }

    pub fn actors(&self) -> impl Iterator<Item = &Actor> {
        self.actors.values()
    }

    /// Sorted actor names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

/// Runtime executes a message by dispatching to its actor.
pub struct Runtime {
    registry: Arc<ActorRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<ActorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ActorRegistry {
        &self.registry
    }

    pub fn actor(&self, actor_name: &str) -> Result<&Actor, SpindleError> {
        self.registry
            .get(actor_name)
            .ok_or_else(|| SpindleError::ActorNotFound(actor_name.to_string()))
    }

    /// Execute one attempt of `message`.
    ///
    /// With a `time_limit` the attempt future is dropped once the limit
    /// elapses, and the attempt fails with `TimeLimitExceeded`.
    pub async fn execute(
        &self,
        actor: &Actor,
        message: &Message,
        time_limit: Option<Duration>,
    ) -> Result<Value, ActorError> {
        let call = actor
            .handler()
            .call(message.args().to_vec(), message.kwargs().clone());
        match time_limit {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or_else(|_| Err(ActorError::time_limit_exceeded(limit))),
            None => call.await,
        }
    }
}
