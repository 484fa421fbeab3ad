//! Middleware - メッセージのライフサイクルに差し込むフック
//!
//! # 設計原則
//! - チェーンは設定時に組み立て、`BrokerBuilder::build` で一度だけ検証する
//! - 実行時にチェーンを書き換えない
//! - フックの失敗はログに残して無視する（本来の結果を隠さない）
//!
//! `before_process_message` is the only hook whose answer matters: it
//! returns a [`BeforeProcess`] tri-state instead of raising a skip signal.

pub mod age_limit;
pub mod chain;
pub mod pipelines;
pub mod results;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::broker::{Broker, ContextKey, MessageProxy};
use crate::domain::{Actor, ActorError, GroupId, GroupInfo, Message, MessageId};
use crate::error::SpindleError;
use crate::ports::ResultBackend;

pub use self::age_limit::AgeLimit;
pub use self::chain::{ENGINE_ACTOR_OPTIONS, MiddlewareChain};
pub use self::pipelines::Pipelines;
pub use self::results::Results;

/// Answer of the before-process chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeforeProcess {
    /// Run the handler.
    Proceed,
    /// Do not run the handler; the message is acked.
    Skip,
    /// Do not run the handler; the message is terminally failed.
    Fail(String),
}

/// Where a hook is being called from.
#[derive(Clone, Copy)]
pub struct HookContext<'a> {
    pub broker: &'a Broker,
    pub context: &'a ContextKey,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    /// Unique within a chain; anchors `insert_before` / `insert_after`.
    fn name(&self) -> &str;

    /// Actor options this middleware understands.
    fn actor_options(&self) -> &[&'static str] {
        &[]
    }

    /// The result backend, for middleware that stores results.
    fn result_backend(&self) -> Option<Arc<dyn ResultBackend>> {
        None
    }

    /// How long results written on behalf of this middleware live, when it
    /// overrides the broker configuration.
    fn result_ttl(&self) -> Option<Duration> {
        None
    }

    /// `BrokerBuilder::build` is about to register `actor`.
    fn before_declare_actor(&self, _actor: &Actor) -> Result<(), SpindleError> {
        Ok(())
    }

    fn after_declare_actor(&self, _actor: &Actor) -> Result<(), SpindleError> {
        Ok(())
    }

    /// `Q` and its companions are about to be declared on the broker.
    ///
    /// Queue declaration hooks fire each time the topology is declared,
    /// which includes the redeclaration after a reconnect.
    async fn before_declare_queue(
        &self,
        _ctx: &HookContext<'_>,
        _queue_name: &str,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn after_declare_queue(
        &self,
        _ctx: &HookContext<'_>,
        _queue_name: &str,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    /// `queue_name` is the `Q.DQ` name.
    async fn after_declare_delay_queue(
        &self,
        _ctx: &HookContext<'_>,
        _queue_name: &str,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn before_enqueue(
        &self,
        _ctx: &HookContext<'_>,
        _message: &Message,
        _delay: Option<Duration>,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn after_enqueue(
        &self,
        _ctx: &HookContext<'_>,
        _message: &Message,
        _delay: Option<Duration>,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    /// A delay-queue consumer is holding the message until its eta.
    async fn before_delay_message(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn before_process_message(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
    ) -> Result<BeforeProcess, SpindleError> {
        Ok(BeforeProcess::Proceed)
    }

    async fn after_process_message(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
        _outcome: &Result<Value, ActorError>,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn after_skip_message(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn before_ack(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn after_ack(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn before_nack(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn after_nack(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    /// A pipe target was enqueued; `group_info` is set when it was the
    /// successor of a whole group.
    async fn after_enqueue_pipe_target(
        &self,
        _ctx: &HookContext<'_>,
        _group_info: Option<&GroupInfo>,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    /// A pipeline containing `group_id` followed by another step is being
    /// built. `message_ids` are the group members' terminal message ids.
    async fn before_build_group_pipeline(
        &self,
        _ctx: &HookContext<'_>,
        _group_id: GroupId,
        _message_ids: &[MessageId],
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn before_worker_boot(&self, _ctx: &HookContext<'_>) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn after_worker_boot(&self, _ctx: &HookContext<'_>) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn before_worker_shutdown(&self, _ctx: &HookContext<'_>) -> Result<(), SpindleError> {
        Ok(())
    }

    async fn after_worker_shutdown(&self, _ctx: &HookContext<'_>) -> Result<(), SpindleError> {
        Ok(())
    }

    /// A worker task is about to exit.
    async fn before_worker_thread_shutdown(
        &self,
        _ctx: &HookContext<'_>,
    ) -> Result<(), SpindleError> {
        Ok(())
    }

    /// A consumer task is about to exit.
    async fn before_consumer_thread_shutdown(
        &self,
        _ctx: &HookContext<'_>,
    ) -> Result<(), SpindleError> {
        Ok(())
    }
}
