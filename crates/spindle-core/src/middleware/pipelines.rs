//! Pipelines - 成功したメッセージの pipe_target を enqueue する
//!
//! # 動作
//! - 単一メッセージ: 結果を引数の末尾に追加して enqueue
//! - グループ（fan-out）: 各メンバーに同じ結果を追加して enqueue
//! - グループメンバーの終端（fan-in）: 完了カウンタを進め、最後のメンバーが
//!   全メンバーの結果をまとめて後続に渡す
//!
//! A successor that ignores its input (`pipe_ignore` on the successor
//! message or its actor) is enqueued with its own args unchanged.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::{HookContext, Middleware};
use crate::broker::{Broker, MessageProxy};
use crate::domain::{ActorError, GroupInfo, Message, Outcome, PipeTarget};
use crate::error::SpindleError;

#[derive(Debug, Default)]
pub struct Pipelines;

impl Pipelines {
    pub fn new() -> Self {
        Self
    }
}

/// Whether `successor` drops the result of its predecessor.
pub(crate) fn ignores_input(broker: &Broker, successor: &Message) -> bool {
    successor.options().pipe_ignore.unwrap_or(false)
        || broker
            .get_actor(successor.actor_name())
            .ok()
            .and_then(|actor| actor.option_bool("pipe_ignore"))
            .unwrap_or(false)
}

async fn enqueue_successors(
    ctx: &HookContext<'_>,
    target: &PipeTarget,
    result: &Value,
) -> Result<(), SpindleError> {
    for successor in target.messages() {
        let successor = if ignores_input(ctx.broker, successor) {
            successor.clone()
        } else {
            successor.with_appended_arg(result.clone())
        };
        debug!(message_id = %successor.message_id(), "Enqueueing pipe target.");
        ctx.broker.enqueue_in(ctx.context, &successor, None).await?;
    }
    Ok(())
}

impl Pipelines {
    /// Count a finished group member; the last one feeds the successor.
    async fn complete_group_member(
        &self,
        ctx: &HookContext<'_>,
        group_info: &GroupInfo,
        target: &PipeTarget,
    ) -> Result<(), SpindleError> {
        let backend = ctx.broker.result_backend().ok_or_else(|| {
            SpindleError::Configuration("group pipelines need a result backend".to_string())
        })?;
        // メンバーの結果と同じ寿命にする
        let ttl = ctx.broker.middleware().result_ttl(ctx.broker);
        let completed = backend
            .increment_group_completion(group_info.group_id, ttl)
            .await?;
        debug!(
            group_id = %group_info.group_id,
            completed,
            size = group_info.size,
            "Group member completed."
        );
        if completed < group_info.size as u64 {
            return Ok(());
        }

        let every_successor_ignores = target
            .messages()
            .into_iter()
            .all(|successor| ignores_input(ctx.broker, successor));
        let results = if every_successor_ignores {
            Value::Null
        } else {
            let message_ids = backend.get_group_message_ids(group_info.group_id).await?;
            let mut results = Vec::with_capacity(message_ids.len());
            for message_id in message_ids {
                match backend.get(message_id, false).await? {
                    Some(Outcome::Success(value)) => results.push(value),
                    _ => return Err(SpindleError::ResultMissing(message_id.to_string())),
                }
            }
            Value::Array(results)
        };

        enqueue_successors(ctx, target, &results).await?;
        ctx.broker
            .middleware()
            .after_enqueue_pipe_target(ctx, Some(group_info))
            .await;
        Ok(())
    }
}

#[async_trait]
impl Middleware for Pipelines {
    fn name(&self) -> &str {
        "pipelines"
    }

    fn actor_options(&self) -> &[&'static str] {
        &["pipe_ignore"]
    }

    async fn after_process_message(
        &self,
        ctx: &HookContext<'_>,
        proxy: &MessageProxy,
        outcome: &Result<Value, ActorError>,
    ) -> Result<(), SpindleError> {
        let Ok(result) = outcome else {
            return Ok(());
        };
        if proxy.failed() {
            return Ok(());
        }
        let message = proxy.message();
        let Some(target) = &message.options().pipe_target else {
            return Ok(());
        };

        match &message.options().group_info {
            Some(group_info) => self.complete_group_member(ctx, group_info, target).await,
            None => {
                enqueue_successors(ctx, target, result).await?;
                ctx.broker
                    .middleware()
                    .after_enqueue_pipe_target(ctx, None)
                    .await;
                Ok(())
            }
        }
    }
}
