//! Middleware hooks that fail must not change what happens to a message.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use spindle_core::broker::MessageProxy;
use spindle_core::domain::{ActorError, Message};
use spindle_core::impls::{InMemoryAmqp, LocalBackend};
use spindle_core::middleware::{HookContext, Middleware, Results};
use spindle_core::results::GetOptions;
use spindle_core::{Broker, SpindleError, Worker};

use common::{add, eventually, fast_config, worker_config};

/// Fails every hook it implements, counting the failures.
#[derive(Default)]
struct Broken {
    failures: AtomicUsize,
}

impl Broken {
    fn fail(&self, hook: &str) -> Result<(), SpindleError> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        Err(SpindleError::Configuration(format!("{hook} is broken")))
    }
}

#[async_trait]
impl Middleware for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn before_enqueue(
        &self,
        _ctx: &HookContext<'_>,
        _message: &Message,
        _delay: Option<Duration>,
    ) -> Result<(), SpindleError> {
        self.fail("before_enqueue")
    }

    async fn after_process_message(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
        _outcome: &Result<Value, ActorError>,
    ) -> Result<(), SpindleError> {
        self.fail("after_process_message")
    }

    async fn before_ack(
        &self,
        _ctx: &HookContext<'_>,
        _proxy: &MessageProxy,
    ) -> Result<(), SpindleError> {
        self.fail("before_ack")
    }
}

#[tokio::test]
async fn failing_hooks_do_not_mask_the_outcome() {
    let amqp = InMemoryAmqp::new();
    let broken = Arc::new(Broken::default());
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .add_middleware_before("age_limit", broken.clone())
            .unwrap()
            .results_middleware(Results::new(Arc::new(LocalBackend::new())).store_results(true))
            .unwrap()
            .actor(add().build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    assert_eq!(broker.middleware().names()[0], "broken");

    let worker = Worker::start(Arc::clone(&broker), worker_config(1)).await.unwrap();
    let message = broker.send("add", vec![json!(2), json!(3)]).await.unwrap();

    let result = broker.result(&message).unwrap();
    assert_eq!(result.get(GetOptions::blocking()).await.unwrap(), Some(json!(5)));
    eventually("the delivery to be acked", || async {
        broken.failures.load(Ordering::SeqCst) >= 3
    })
    .await;
    worker.stop().await;

    assert_eq!(amqp.queue_len("default"), 0);
    assert_eq!(amqp.queue_len("default.XQ"), 0);
    let counts = broker.get_queue_message_counts("default").await.unwrap();
    assert_eq!(counts.pending(), 0);
}
