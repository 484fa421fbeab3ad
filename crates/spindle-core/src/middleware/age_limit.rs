//! AgeLimit - 古すぎるメッセージを実行せずにスキップする
//!
//! The limit is read from the message's `max_age` option, then the actor's,
//! then the broker's retry configuration. Age is measured from the message
//! timestamp, so retried copies keep ageing.

use async_trait::async_trait;
use tracing::warn;

use super::{BeforeProcess, HookContext, Middleware};
use crate::broker::MessageProxy;
use crate::error::SpindleError;

#[derive(Debug, Default)]
pub struct AgeLimit;

impl AgeLimit {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for AgeLimit {
    fn name(&self) -> &str {
        "age_limit"
    }

    fn actor_options(&self) -> &[&'static str] {
        &["max_age"]
    }

    async fn before_process_message(
        &self,
        ctx: &HookContext<'_>,
        proxy: &MessageProxy,
    ) -> Result<BeforeProcess, SpindleError> {
        let message = proxy.message();
        let actor = ctx.broker.get_actor(message.actor_name())?;
        let max_age = message
            .options()
            .max_age
            .or_else(|| actor.option_u64("max_age"))
            .or(ctx.broker.config().retries.max_age_ms);
        let Some(max_age) = max_age else {
            return Ok(BeforeProcess::Proceed);
        };

        let age = ctx.broker.clock().now_millis() - message.message_timestamp();
        if age >= 0 && age.unsigned_abs() >= max_age {
            warn!(
                message_id = %message.message_id(),
                age_ms = age,
                max_age_ms = max_age,
                "Message has exceeded its age limit."
            );
            return Ok(BeforeProcess::Skip);
        }
        Ok(BeforeProcess::Proceed)
    }
}
