//! BrokerBuilder - ブローカーの構築とワイヤリング
//!
//! # Fail-fast 設計
//! - アクター名の重複は `actor()` の時点でエラー
//! - build() 時に全アクターのオプションが認識済みかチェック
//! - expect_actors() で期待したアクターが登録されていなければエラー
//!
//! Actors are registered in `build()`, once the chain is final, so every
//! middleware sees each `before_declare_actor` / `after_declare_actor`.

use std::sync::Arc;

use crate::broker::Broker;
use crate::domain::Actor;
use crate::error::SpindleError;
use crate::middleware::{Middleware, MiddlewareChain, Results};
use crate::ports::{AmqpConnector, Clock, ResultBackend, SystemClock};
use crate::runtime::{ActorRegistry, Runtime};

use super::BrokerConfig;

/// # 使用例
/// ```ignore
/// let broker = Broker::builder(Arc::new(InMemoryAmqp::new()))
///     .config(config)
///     .results(Arc::new(LocalBackend::new()))?
///     .actor(add)?
///     .expect_actors(&["add"])
///     .build()?;
/// ```
pub struct BrokerBuilder {
    connector: Arc<dyn AmqpConnector>,
    config: BrokerConfig,
    clock: Arc<dyn Clock>,
    middleware: MiddlewareChain,
    actors: Vec<Actor>,
    expected_actors: Option<Vec<String>>,
}

impl BrokerBuilder {
    /// Default configuration, `[age_limit, pipelines]`, system clock.
    pub fn new(connector: Arc<dyn AmqpConnector>) -> Self {
        Self {
            connector,
            config: BrokerConfig::default(),
            clock: Arc::new(SystemClock),
            middleware: MiddlewareChain::with_defaults(),
            actors: Vec::new(),
            expected_actors: None,
        }
    }

    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Declare an actor. Its queue is declared along with it.
    pub fn actor(mut self, actor: Actor) -> Result<Self, SpindleError> {
        if self.is_declared(actor.actor_name()) {
            return Err(SpindleError::Configuration(format!(
                "an actor named {:?} is already declared",
                actor.actor_name()
            )));
        }
        self.actors.push(actor);
        Ok(self)
    }

    fn is_declared(&self, actor_name: &str) -> bool {
        self.actors.iter().any(|actor| actor.actor_name() == actor_name)
    }

    /// Replace the whole chain.
    pub fn middleware(
        mut self,
        middleware: impl IntoIterator<Item = Arc<dyn Middleware>>,
    ) -> Result<Self, SpindleError> {
        let mut chain = MiddlewareChain::new();
        for m in middleware {
            chain.push(m)?;
        }
        self.middleware = chain;
        Ok(self)
    }

    pub fn add_middleware(mut self, middleware: Arc<dyn Middleware>) -> Result<Self, SpindleError> {
        self.middleware.push(middleware)?;
        Ok(self)
    }

    pub fn add_middleware_before(
        mut self,
        anchor: &str,
        middleware: Arc<dyn Middleware>,
    ) -> Result<Self, SpindleError> {
        self.middleware.insert_before(anchor, middleware)?;
        Ok(self)
    }

    pub fn add_middleware_after(
        mut self,
        anchor: &str,
        middleware: Arc<dyn Middleware>,
    ) -> Result<Self, SpindleError> {
        self.middleware.insert_after(anchor, middleware)?;
        Ok(self)
    }

    /// Store results in `backend`.
    ///
    /// Results must be stored before pipelines look them up, so the
    /// middleware goes right before `pipelines` when the chain has it.
    pub fn results(self, backend: Arc<dyn ResultBackend>) -> Result<Self, SpindleError> {
        self.results_middleware(Results::new(backend))
    }

    /// Like [`results`](Self::results) with a preconfigured middleware.
    pub fn results_middleware(self, results: Results) -> Result<Self, SpindleError> {
        let results: Arc<dyn Middleware> = Arc::new(results);
        if self.middleware.contains("pipelines") {
            self.add_middleware_before("pipelines", results)
        } else {
            self.add_middleware(results)
        }
    }

    pub fn expect_actors(mut self, actor_names: &[&str]) -> Self {
        self.expected_actors = Some(actor_names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Broker, SpindleError> {
        self.config.validate()?;

        let recognized = self.middleware.recognized_actor_options();
        for actor in &self.actors {
            let invalid: Vec<&str> = actor
                .options()
                .keys()
                .map(String::as_str)
                .filter(|key| !recognized.contains(key))
                .collect();
            if !invalid.is_empty() {
                return Err(SpindleError::Configuration(format!(
                    "Invalid options for actor {}: {invalid:?}. Either you misspelled an \
                     option or you are missing a middleware to support it.",
                    actor.actor_name()
                )));
            }
        }

        if let Some(expected_actors) = &self.expected_actors {
            let missing: Vec<&str> = expected_actors
                .iter()
                .map(String::as_str)
                .filter(|name| !self.is_declared(name))
                .collect();
            if !missing.is_empty() {
                return Err(SpindleError::Configuration(format!(
                    "Missing actors: {missing:?}. These actors were expected but not declared."
                )));
            }
        }

        let mut registry = ActorRegistry::new();
        for actor in self.actors {
            self.middleware.before_declare_actor(&actor);
            let declared = actor.clone();
            registry.register(actor)?;
            self.middleware.after_declare_actor(&declared);
        }

        Ok(Broker::new(
            self.config,
            self.connector,
            Runtime::new(Arc::new(registry)),
            self.middleware,
            self.clock,
        ))
    }
}
