//! One message, one attempt: hooks, execution, retry decision.
//!
//! 処理の流れ: lookup → before_process → execute → decide → after_process
//! Retries and dead-letter decisions are made before `after_process_message`
//! runs, so middleware sees whether the message failed for good.

use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::broker::{Broker, ContextKey, MessageProxy};
use crate::domain::{
    Actor, ActorError, AttemptState, Decider, Decision, MessageState, RetryPolicy,
};
use crate::middleware::{BeforeProcess, HookContext};

/// Run `proxy` through the pipeline and report the state to settle it with.
pub(crate) async fn process(
    broker: &Broker,
    ctx: &ContextKey,
    proxy: &MessageProxy,
    decider: &dyn Decider,
) -> MessageState {
    let hook_ctx = HookContext {
        broker,
        context: ctx,
    };
    let message = proxy.message();
    let actor = match broker.get_actor(message.actor_name()) {
        Ok(actor) => actor,
        Err(err) => {
            error!(
                message_id = %message.message_id(),
                error = %err,
                "Received message for an undefined actor."
            );
            proxy.fail();
            return MessageState::DeadLettered;
        }
    };

    match broker.middleware().before_process_message(&hook_ctx, proxy).await {
        BeforeProcess::Proceed => {}
        BeforeProcess::Skip => {
            broker.middleware().after_skip_message(&hook_ctx, proxy).await;
            return MessageState::Skipped;
        }
        BeforeProcess::Fail(reason) => {
            proxy.fail();
            let outcome = Err(ActorError::new("Rejected", reason));
            broker
                .middleware()
                .after_process_message(&hook_ctx, proxy, &outcome)
                .await;
            return MessageState::DeadLettered;
        }
    }

    let time_limit = message
        .options()
        .time_limit
        .or_else(|| actor.option_u64("time_limit"))
        .map(Duration::from_millis)
        .unwrap_or_else(|| broker.config().default_time_limit());

    debug!(message_id = %message.message_id(), actor = actor.actor_name(), "Processing message.");
    let outcome = broker.runtime().execute(actor, message, Some(time_limit)).await;

    let state = match &outcome {
        Ok(_) => MessageState::Succeeded,
        Err(err) => {
            if err.is_rate_limit() {
                warn!(
                    message_id = %message.message_id(),
                    error = %err,
                    "Rate limit exceeded."
                );
            } else {
                error!(
                    message_id = %message.message_id(),
                    error = %err,
                    "Failed to process message."
                );
            }
            retry_or_dead_letter(broker, ctx, proxy, actor, err, decider).await
        }
    };

    broker
        .middleware()
        .after_process_message(&hook_ctx, proxy, &outcome)
        .await;

    if proxy.failed() {
        MessageState::DeadLettered
    } else {
        state
    }
}

/// Limits resolve as message option, then actor option, then broker default.
fn attempt_state(broker: &Broker, proxy: &MessageProxy, actor: &Actor) -> AttemptState {
    let options = proxy.message().options();
    let defaults = &broker.config().retries;
    let actor_u32 = |key: &str| actor.option_u64(key).and_then(|v| u32::try_from(v).ok());

    let min_backoff = options
        .min_backoff
        .or_else(|| actor.option_u64("min_backoff"))
        .unwrap_or(defaults.min_backoff_ms);
    let max_backoff = options
        .max_backoff
        .or_else(|| actor.option_u64("max_backoff"))
        .unwrap_or(defaults.max_backoff_ms);
    let age_ms = broker.clock().now_millis() - proxy.message().message_timestamp();

    AttemptState {
        retries: options.retries.unwrap_or(0),
        age: Duration::from_millis(u64::try_from(age_ms).unwrap_or(0)),
        max_retries: options
            .max_retries
            .or_else(|| actor_u32("max_retries"))
            .or(defaults.max_retries),
        max_age: options
            .max_age
            .or_else(|| actor.option_u64("max_age"))
            .map(Duration::from_millis)
            .or_else(|| defaults.max_age()),
        backoff: RetryPolicy::new(
            Duration::from_millis(min_backoff),
            Duration::from_millis(max_backoff),
        ),
        retry_when: actor.retry_when().cloned(),
    }
}

async fn retry_or_dead_letter(
    broker: &Broker,
    ctx: &ContextKey,
    proxy: &MessageProxy,
    actor: &Actor,
    err: &ActorError,
    decider: &dyn Decider,
) -> MessageState {
    let attempt = attempt_state(broker, proxy, actor);
    let message = proxy.message();
    match decider.decide(&attempt, err) {
        Decision::Retry { delay, reason } => {
            let retry = message.with_options(|options| options.retries = Some(attempt.retries + 1));
            match broker.enqueue_in(ctx, &retry, Some(delay)).await {
                Ok(_) => {
                    info!(message_id = %message.message_id(), %reason, "Retrying message.");
                    MessageState::Retrying
                }
                Err(enqueue_err) => {
                    error!(
                        message_id = %message.message_id(),
                        error = %enqueue_err,
                        "Failed to enqueue retry."
                    );
                    proxy.fail();
                    MessageState::DeadLettered
                }
            }
        }
        Decision::DeadLetter { reason } => {
            warn!(message_id = %message.message_id(), %reason, "Retries exceeded for message.");
            proxy.fail();
            MessageState::DeadLettered
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::app::BrokerConfig;
    use crate::domain::{DefaultDecider, Message, handler_fn};
    use crate::error::SpindleError;
    use crate::impls::InMemoryAmqp;
    use crate::middleware::Middleware;

    struct Rejecting;

    #[async_trait]
    impl Middleware for Rejecting {
        fn name(&self) -> &str {
            "rejecting"
        }

        async fn before_process_message(
            &self,
            _ctx: &HookContext<'_>,
            _proxy: &MessageProxy,
        ) -> Result<BeforeProcess, SpindleError> {
            Ok(BeforeProcess::Fail("not today".to_string()))
        }
    }

    fn failing(calls: Arc<AtomicUsize>) -> Actor {
        Actor::builder(
            "fail",
            handler_fn(move |_args, _kwargs| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(ActorError::new("RuntimeError", "boom"))
                }
            }),
        )
        .option("max_retries", 1)
        .build()
        .unwrap()
    }

    fn proxy(message: Message) -> MessageProxy {
        MessageProxy::new(message, 1, 0)
    }

    async fn run(broker: &Broker, proxy: &MessageProxy) -> MessageState {
        process(broker, &ContextKey::Worker(0), proxy, &DefaultDecider::default()).await
    }

    #[tokio::test]
    async fn failures_are_retried_through_the_delay_queue() {
        let amqp = InMemoryAmqp::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = Broker::builder(Arc::new(amqp.clone()))
            .actor(failing(Arc::clone(&calls)))
            .unwrap()
            .build()
            .unwrap();
        let message = broker.get_actor("fail").unwrap().message(vec![json!(1)]);

        let first = proxy(message.clone());
        let state = run(&broker, &first).await;
        assert_eq!(state, MessageState::Retrying);
        assert!(!first.failed());
        assert_eq!(amqp.queue_len("default.DQ"), 1);

        let retried = Message::decode(&amqp.queue_bodies("default.DQ")[0]).unwrap();
        assert_eq!(retried.options().retries, Some(1));
        assert_eq!(retried.message_id(), message.message_id());

        let second = proxy(retried);
        let state = run(&broker, &second).await;
        assert_eq!(state, MessageState::DeadLettered);
        assert!(second.failed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_actors_are_dead_lettered() {
        let broker = Broker::builder(Arc::new(InMemoryAmqp::new())).build().unwrap();
        let message =
            Message::new("default", "ghost", vec![], Default::default(), Default::default());

        let proxy = proxy(message);
        let state = run(&broker, &proxy).await;
        assert_eq!(state, MessageState::DeadLettered);
        assert!(proxy.failed());
    }

    #[tokio::test]
    async fn rejected_messages_never_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let broker = Broker::builder(Arc::new(InMemoryAmqp::new()))
            .add_middleware(Arc::new(Rejecting))
            .unwrap()
            .actor(failing(Arc::clone(&calls)))
            .unwrap()
            .build()
            .unwrap();
        let message = broker.get_actor("fail").unwrap().message(vec![]);

        let state = run(&broker, &proxy(message)).await;
        assert_eq!(state, MessageState::DeadLettered);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn message_time_limit_wins_over_the_default() {
        let config = BrokerConfig {
            default_time_limit_ms: 60_000,
            ..BrokerConfig::default()
        };
        let sleepy = Actor::builder(
            "sleepy",
            handler_fn(|_args, _kwargs| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }),
        )
        .build()
        .unwrap();
        let broker = Broker::builder(Arc::new(InMemoryAmqp::new()))
            .config(config)
            .actor(sleepy)
            .unwrap()
            .build()
            .unwrap();
        let message = broker
            .get_actor("sleepy")
            .unwrap()
            .message(vec![])
            .with_options(|options| options.time_limit = Some(20));

        let proxy = proxy(message);
        let state = run(&broker, &proxy).await;
        assert_eq!(state, MessageState::DeadLettered);
    }
}
