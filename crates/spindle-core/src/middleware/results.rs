//! Results - アクターの結果を ResultBackend に保存する
//!
//! # 動作
//! - 成功: `store_results` が有効なら値を保存
//! - 失敗: メッセージが終端失敗（dead-letter）になった時だけ保存
//! - 終端失敗時は下流の全メッセージに `ParentFailed` を保存
//!
//! Actor options `store_results` and `result_ttl` (milliseconds) override the
//! middleware settings, which in turn default to the broker configuration.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{HookContext, Middleware};
use crate::broker::{Broker, MessageProxy};
use crate::domain::{Actor, ActorError, GroupId, GroupInfo, MessageId, Outcome, PipeTarget};
use crate::error::SpindleError;
use crate::ports::ResultBackend;

pub struct Results {
    backend: Arc<dyn ResultBackend>,
    store_results: Option<bool>,
    result_ttl: Option<Duration>,
}

impl Results {
    pub fn new(backend: Arc<dyn ResultBackend>) -> Self {
        Self {
            backend,
            store_results: None,
            result_ttl: None,
        }
    }

    /// Store results of actors that do not set `store_results` themselves.
    pub fn store_results(mut self, store_results: bool) -> Self {
        self.store_results = Some(store_results);
        self
    }

    pub fn result_ttl(mut self, result_ttl: Duration) -> Self {
        self.result_ttl = Some(result_ttl);
        self
    }

    fn stores(&self, broker: &Broker, actor: &Actor) -> bool {
        actor
            .option_bool("store_results")
            .or(self.store_results)
            .unwrap_or(broker.config().results.store_results)
    }

    fn ttl(&self, broker: &Broker, actor: Option<&Actor>) -> Duration {
        actor
            .and_then(|actor| actor.option_u64("result_ttl"))
            .map(Duration::from_millis)
            .or(self.result_ttl)
            .unwrap_or_else(|| broker.config().results.result_ttl())
    }

    /// Ids of every downstream message whose actor stores results.
    fn downstream_message_ids(
        &self,
        broker: &Broker,
        pipe_target: Option<&PipeTarget>,
    ) -> HashSet<MessageId> {
        let mut message_ids = HashSet::new();
        let mut pending: Vec<&PipeTarget> = pipe_target.into_iter().collect();
        while let Some(target) = pending.pop() {
            for message in target.messages() {
                if let Ok(actor) = broker.get_actor(message.actor_name()) {
                    if self.stores(broker, actor) {
                        message_ids.insert(message.message_id());
                    }
                }
                if let Some(next) = &message.options().pipe_target {
                    pending.push(next);
                }
            }
        }
        message_ids
    }
}

#[async_trait]
impl Middleware for Results {
    fn name(&self) -> &str {
        "results"
    }

    fn actor_options(&self) -> &[&'static str] {
        &["store_results", "result_ttl"]
    }

    fn result_backend(&self) -> Option<Arc<dyn ResultBackend>> {
        Some(Arc::clone(&self.backend))
    }

    fn result_ttl(&self) -> Option<Duration> {
        self.result_ttl
    }

    async fn after_process_message(
        &self,
        ctx: &HookContext<'_>,
        proxy: &MessageProxy,
        outcome: &Result<Value, ActorError>,
    ) -> Result<(), SpindleError> {
        let broker = ctx.broker;
        let message = proxy.message();
        let actor = broker.get_actor(message.actor_name())?;
        let ttl = self.ttl(broker, Some(actor));

        if self.stores(broker, actor) {
            match outcome {
                Ok(value) => {
                    self.backend
                        .store(message.message_id(), Outcome::Success(value.clone()), ttl)
                        .await?;
                }
                Err(err) if proxy.failed() => {
                    self.backend
                        .store(message.message_id(), Outcome::failure(err), ttl)
                        .await?;
                }
                Err(_) => {}
            }
        }

        // 自分が保存しなくても、下流で保存するメッセージは無効化する
        if proxy.failed() {
            let cause = match outcome {
                Err(err) => format!("{message} failed because of {}", err.repr()),
                Ok(_) => format!("{message} failed"),
            };
            let parent_failed = Outcome::failure(&ActorError::parent_failed(cause));
            let pipe_target = message.options().pipe_target.as_ref();
            for message_id in self.downstream_message_ids(broker, pipe_target) {
                debug!(%message_id, parent = %message.message_id(), "Storing parent failure.");
                self.backend.store(message_id, parent_failed.clone(), ttl).await?;
            }
        }
        Ok(())
    }

    /// The group results were handed to the successor: forget them.
    async fn after_enqueue_pipe_target(
        &self,
        _ctx: &HookContext<'_>,
        group_info: Option<&GroupInfo>,
    ) -> Result<(), SpindleError> {
        let Some(group_info) = group_info else {
            return Ok(());
        };
        let message_ids = self.backend.get_group_message_ids(group_info.group_id).await?;
        for message_id in message_ids {
            self.backend.forget(message_id).await?;
        }
        debug!(group_id = %group_info.group_id, "Forgot group results.");
        self.backend.delete_group_message_ids(group_info.group_id).await
    }

    async fn before_build_group_pipeline(
        &self,
        ctx: &HookContext<'_>,
        group_id: GroupId,
        message_ids: &[MessageId],
    ) -> Result<(), SpindleError> {
        let ttl = self.ttl(ctx.broker, None);
        self.backend.set_group_message_ids(group_id, message_ids, ttl).await
    }
}
