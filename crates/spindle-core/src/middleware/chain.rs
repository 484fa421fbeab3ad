//! MiddlewareChain - 順序付きのミドルウェアリスト
//!
//! Hooks run in chain order. A failing hook is logged and the next one runs.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::{AgeLimit, BeforeProcess, HookContext, Middleware, Pipelines};
use crate::broker::{Broker, MessageProxy};
use crate::domain::{Actor, ActorError, GroupId, GroupInfo, Message, MessageId};
use crate::error::SpindleError;
use crate::ports::ResultBackend;

/// Actor options the engine itself reads (retries, time limit, priority,
/// piping).
pub const ENGINE_ACTOR_OPTIONS: &[&str] = &[
    "priority",
    "max_retries",
    "min_backoff",
    "max_backoff",
    "max_age",
    "time_limit",
    "pipe_ignore",
];

type HookFuture<'a> = Pin<Box<dyn Future<Output = Result<(), SpindleError>> + Send + 'a>>;

#[derive(Default, Clone)]
pub struct MiddlewareChain {
    entries: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// `[age_limit, pipelines]`
    pub fn with_defaults() -> Self {
        Self {
            entries: vec![Arc::new(AgeLimit::new()), Arc::new(Pipelines::new())],
        }
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) -> Result<(), SpindleError> {
        self.ensure_unique(middleware.name())?;
        self.entries.push(middleware);
        Ok(())
    }

    pub fn insert_before(
        &mut self,
        anchor: &str,
        middleware: Arc<dyn Middleware>,
    ) -> Result<(), SpindleError> {
        self.ensure_unique(middleware.name())?;
        let index = self.position(anchor)?;
        self.entries.insert(index, middleware);
        Ok(())
    }

    pub fn insert_after(
        &mut self,
        anchor: &str,
        middleware: Arc<dyn Middleware>,
    ) -> Result<(), SpindleError> {
        self.ensure_unique(middleware.name())?;
        let index = self.position(anchor)?;
        self.entries.insert(index + 1, middleware);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|m| m.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Engine options plus every option a middleware declares.
    pub fn recognized_actor_options(&self) -> BTreeSet<&str> {
        let mut options: BTreeSet<&str> = ENGINE_ACTOR_OPTIONS.iter().copied().collect();
        for middleware in &self.entries {
            options.extend(middleware.actor_options().iter().copied());
        }
        options
    }

    /// The backend of the first middleware that stores results.
    pub fn result_backend(&self) -> Option<Arc<dyn ResultBackend>> {
        self.entries.iter().find_map(|m| m.result_backend())
    }

    /// The ttl of stored results: the first middleware override, or the
    /// broker configuration.
    pub fn result_ttl(&self, broker: &Broker) -> Duration {
        self.entries
            .iter()
            .find_map(|m| m.result_ttl())
            .unwrap_or_else(|| broker.config().results.result_ttl())
    }

    fn ensure_unique(&self, name: &str) -> Result<(), SpindleError> {
        if self.contains(name) {
            return Err(SpindleError::Configuration(format!(
                "middleware {name:?} is already in the chain"
            )));
        }
        Ok(())
    }

    fn position(&self, anchor: &str) -> Result<usize, SpindleError> {
        self.entries
            .iter()
            .position(|m| m.name() == anchor)
            .ok_or_else(|| {
                SpindleError::Configuration(format!("middleware {anchor:?} not found in the chain"))
            })
    }

    async fn emit<'a, F>(&'a self, hook: &'static str, call: F)
    where
        F: Fn(&'a dyn Middleware) -> HookFuture<'a>,
    {
        for middleware in &self.entries {
            if let Err(err) = call(middleware.as_ref()).await {
                warn!(
                    middleware = middleware.name(),
                    hook,
                    error = %err,
                    "Middleware hook failed."
                );
            }
        }
    }

    fn emit_sync<F>(&self, hook: &'static str, call: F)
    where
        F: Fn(&dyn Middleware) -> Result<(), SpindleError>,
    {
        for middleware in &self.entries {
            if let Err(err) = call(middleware.as_ref()) {
                warn!(
                    middleware = middleware.name(),
                    hook,
                    error = %err,
                    "Middleware hook failed."
                );
            }
        }
    }

    pub(crate) fn before_declare_actor(&self, actor: &Actor) {
        self.emit_sync("before_declare_actor", |m| m.before_declare_actor(actor));
    }

    pub(crate) fn after_declare_actor(&self, actor: &Actor) {
        self.emit_sync("after_declare_actor", |m| m.after_declare_actor(actor));
    }

    pub(crate) async fn before_declare_queue(&self, ctx: &HookContext<'_>, queue_name: &str) {
        self.emit("before_declare_queue", |m| m.before_declare_queue(ctx, queue_name))
            .await;
    }

    pub(crate) async fn after_declare_queue(&self, ctx: &HookContext<'_>, queue_name: &str) {
        self.emit("after_declare_queue", |m| m.after_declare_queue(ctx, queue_name))
            .await;
    }

    pub(crate) async fn after_declare_delay_queue(&self, ctx: &HookContext<'_>, queue_name: &str) {
        self.emit("after_declare_delay_queue", |m| {
            m.after_declare_delay_queue(ctx, queue_name)
        })
        .await;
    }

    pub(crate) async fn before_enqueue(
        &self,
        ctx: &HookContext<'_>,
        message: &Message,
        delay: Option<Duration>,
    ) {
        self.emit("before_enqueue", |m| m.before_enqueue(ctx, message, delay))
            .await;
    }

    pub(crate) async fn after_enqueue(
        &self,
        ctx: &HookContext<'_>,
        message: &Message,
        delay: Option<Duration>,
    ) {
        self.emit("after_enqueue", |m| m.after_enqueue(ctx, message, delay))
            .await;
    }

    pub(crate) async fn before_delay_message(&self, ctx: &HookContext<'_>, proxy: &MessageProxy) {
        self.emit("before_delay_message", |m| m.before_delay_message(ctx, proxy))
            .await;
    }

    /// The first middleware answering anything but `Proceed` wins.
    pub(crate) async fn before_process_message(
        &self,
        ctx: &HookContext<'_>,
        proxy: &MessageProxy,
    ) -> BeforeProcess {
        for middleware in &self.entries {
            match middleware.before_process_message(ctx, proxy).await {
                Ok(BeforeProcess::Proceed) => {}
                Ok(answer) => {
                    debug!(
                        middleware = middleware.name(),
                        message_id = %proxy.message().message_id(),
                        ?answer,
                        "Processing short-circuited."
                    );
                    return answer;
                }
                Err(err) => {
                    warn!(
                        middleware = middleware.name(),
                        hook = "before_process_message",
                        error = %err,
                        "Middleware hook failed."
                    );
                }
            }
        }
        BeforeProcess::Proceed
    }

    pub(crate) async fn after_process_message(
        &self,
        ctx: &HookContext<'_>,
        proxy: &MessageProxy,
        outcome: &Result<Value, ActorError>,
    ) {
        self.emit("after_process_message", |m| {
            m.after_process_message(ctx, proxy, outcome)
        })
        .await;
    }

    pub(crate) async fn after_skip_message(&self, ctx: &HookContext<'_>, proxy: &MessageProxy) {
        self.emit("after_skip_message", |m| m.after_skip_message(ctx, proxy))
            .await;
    }

    pub(crate) async fn before_ack(&self, ctx: &HookContext<'_>, proxy: &MessageProxy) {
        self.emit("before_ack", |m| m.before_ack(ctx, proxy)).await;
    }

    pub(crate) async fn after_ack(&self, ctx: &HookContext<'_>, proxy: &MessageProxy) {
        self.emit("after_ack", |m| m.after_ack(ctx, proxy)).await;
    }

    pub(crate) async fn before_nack(&self, ctx: &HookContext<'_>, proxy: &MessageProxy) {
        self.emit("before_nack", |m| m.before_nack(ctx, proxy)).await;
    }

    pub(crate) async fn after_nack(&self, ctx: &HookContext<'_>, proxy: &MessageProxy) {
        self.emit("after_nack", |m| m.after_nack(ctx, proxy)).await;
    }

    pub(crate) async fn after_enqueue_pipe_target(
        &self,
        ctx: &HookContext<'_>,
        group_info: Option<&GroupInfo>,
    ) {
        self.emit("after_enqueue_pipe_target", |m| {
            m.after_enqueue_pipe_target(ctx, group_info)
        })
        .await;
    }

    pub(crate) async fn before_build_group_pipeline(
        &self,
        ctx: &HookContext<'_>,
        group_id: GroupId,
        message_ids: &[MessageId],
    ) {
        self.emit("before_build_group_pipeline", |m| {
            m.before_build_group_pipeline(ctx, group_id, message_ids)
        })
        .await;
    }

    pub(crate) async fn before_worker_boot(&self, ctx: &HookContext<'_>) {
        self.emit("before_worker_boot", |m| m.before_worker_boot(ctx)).await;
    }

    pub(crate) async fn after_worker_boot(&self, ctx: &HookContext<'_>) {
        self.emit("after_worker_boot", |m| m.after_worker_boot(ctx)).await;
    }

    pub(crate) async fn before_worker_shutdown(&self, ctx: &HookContext<'_>) {
        self.emit("before_worker_shutdown", |m| m.before_worker_shutdown(ctx))
            .await;
    }

    pub(crate) async fn after_worker_shutdown(&self, ctx: &HookContext<'_>) {
        self.emit("after_worker_shutdown", |m| m.after_worker_shutdown(ctx))
            .await;
    }

    pub(crate) async fn before_worker_thread_shutdown(&self, ctx: &HookContext<'_>) {
        self.emit("before_worker_thread_shutdown", |m| {
            m.before_worker_thread_shutdown(ctx)
        })
        .await;
    }

    pub(crate) async fn before_consumer_thread_shutdown(&self, ctx: &HookContext<'_>) {
        self.emit("before_consumer_thread_shutdown", |m| {
            m.before_consumer_thread_shutdown(ctx)
        })
        .await;
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
