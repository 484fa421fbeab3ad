//! End-to-end worker flows against the in-memory broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rstest::rstest;
use serde_json::{Map, Value, json};
use spindle_core::app::{BrokerConfig, WorkerConfig};
use spindle_core::domain::{Actor, ActorError, Message, MessageOptions, handler_fn};
use spindle_core::impls::InMemoryAmqp;
use spindle_core::ports::FixedClock;
use spindle_core::{Broker, SpindleError, Worker};

use common::{call_count, calls, eventually, failing, fast_config, recorder, worker_config};

#[tokio::test]
async fn sent_messages_are_processed() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    assert_eq!(amqp.connection_count(), 0);

    let worker = Worker::start(Arc::clone(&broker), worker_config(2)).await.unwrap();
    broker.send("record", vec![json!("hello")]).await.unwrap();

    eventually("the message to run", || async { call_count(&calls) == 1 }).await;
    worker.stop().await;
    assert_eq!(calls.lock().unwrap()[0], vec![json!("hello")]);
    assert_eq!(amqp.queue_len("default"), 0);
}

#[tokio::test]
async fn failing_messages_are_retried_then_dead_lettered() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(
                failing("fail", "RuntimeError", &calls)
                    .option("max_retries", 3)
                    .build()
                    .unwrap(),
            )
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(1)).await.unwrap();
    broker.send("fail", vec![]).await.unwrap();

    eventually("the message to be dead-lettered", || async {
        amqp.queue_len("default.XQ") == 1
    })
    .await;
    worker.stop().await;
    assert_eq!(call_count(&calls), 4);
    let counts = broker.get_queue_message_counts("default").await.unwrap();
    assert_eq!((counts.queued, counts.delayed, counts.dead), (0, 0, 1));
}

#[rstest]
#[case::value_errors_are_not_retried("ValueError", 1)]
#[case::runtime_errors_are_retried_three_times("RuntimeError", 4)]
#[tokio::test]
async fn retry_when_overrides_the_retry_count(
    #[case] error_name: &'static str,
    #[case] attempts: usize,
) {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let actor = failing("fail", error_name, &calls)
        .option("max_retries", 100)
        .retry_when(|retries, error| retries < 3 && error.name() == "RuntimeError")
        .build()
        .unwrap();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(actor)
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(1)).await.unwrap();
    broker.send("fail", vec![]).await.unwrap();

    eventually("the message to be dead-lettered", || async {
        amqp.queue_len("default.XQ") == 1
    })
    .await;
    worker.stop().await;
    assert_eq!(call_count(&calls), attempts);
}

#[tokio::test]
async fn shorter_delays_run_first() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(2)).await.unwrap();
    let actor = broker.get_actor("record").unwrap();
    broker
        .enqueue_with_delay(&actor.message(vec![json!("slow")]), Duration::from_millis(1500))
        .await
        .unwrap();
    broker
        .enqueue_with_delay(&actor.message(vec![json!("fast")]), Duration::from_millis(1000))
        .await
        .unwrap();
    assert_eq!(amqp.queue_len("default.DQ") + call_count(&calls), 2);

    eventually("both delayed messages to run", || async { call_count(&calls) == 2 }).await;
    worker.stop().await;
    let order: Vec<Value> = calls.lock().unwrap().iter().map(|args| args[0].clone()).collect();
    assert_eq!(order, vec![json!("fast"), json!("slow")]);
}

#[tokio::test]
async fn messages_for_unknown_actors_are_dead_lettered() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(1)).await.unwrap();
    eventually("the queue to be declared", || async {
        amqp.queue_arguments("default").is_some()
    })
    .await;

    let ghost = Message::new("default", "ghost", vec![], Map::new(), MessageOptions::default());
    amqp.publish_raw("default", ghost.encode().unwrap());

    eventually("the message to be dead-lettered", || async {
        amqp.queue_len("default.XQ") == 1
    })
    .await;
    worker.stop().await;
    assert_eq!(call_count(&calls), 0);
}

#[tokio::test]
async fn higher_priorities_are_processed_first() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let config = BrokerConfig {
        max_priority: Some(10),
        ..fast_config()
    };
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(config)
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let actor = broker.get_actor("record").unwrap();
    for priority in 0..10u8 {
        let message = actor
            .message(vec![json!(priority)])
            .with_options(|options| options.priority = Some(priority));
        broker.enqueue(&message).await.unwrap();
    }

    let worker_config = WorkerConfig {
        queue_prefetch: Some(1),
        ..worker_config(1)
    };
    let worker = Worker::start(Arc::clone(&broker), worker_config).await.unwrap();
    eventually("every message to run", || async { call_count(&calls) == 10 }).await;
    worker.stop().await;

    let order: Vec<Value> = calls.lock().unwrap().iter().map(|args| args[0].clone()).collect();
    let expected: Vec<Value> = (0..10u8).rev().map(|priority| json!(priority)).collect();
    assert_eq!(order, expected);
}

#[tokio::test]
async fn paused_workers_hold_messages_until_resumed() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(2)).await.unwrap();
    worker.pause();
    assert!(worker.is_paused());

    broker.send("record", vec![json!(1)]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(call_count(&calls), 0);

    worker.resume();
    eventually("the held message to run", || async { call_count(&calls) == 1 }).await;
    worker.stop().await;
}

#[tokio::test]
async fn messages_past_their_max_age_are_skipped() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let clock = Arc::new(FixedClock::new(Utc::now() + chrono::Duration::hours(1)));
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .clock(clock.clone())
            .actor(recorder("record", &calls).option("max_age", 1000).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(1)).await.unwrap();
    broker.send("record", vec![]).await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), worker.join())
        .await
        .unwrap()
        .unwrap();
    worker.stop().await;
    assert_eq!(call_count(&calls), 0);
    assert_eq!(amqp.queue_len("default.XQ"), 0);
}

#[tokio::test]
async fn time_limited_messages_fail() {
    let amqp = InMemoryAmqp::new();
    let sleepy = Actor::builder(
        "sleepy",
        handler_fn(|_args, _kwargs| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }),
    )
    .option("time_limit", 20)
    .build()
    .unwrap();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(sleepy)
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(1)).await.unwrap();
    broker.send("sleepy", vec![]).await.unwrap();

    eventually("the message to be dead-lettered", || async {
        amqp.queue_len("default.XQ") == 1
    })
    .await;
    worker.stop().await;
}

#[tokio::test]
async fn join_waits_for_every_message() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(4)).await.unwrap();
    for n in 0..5 {
        broker.send("record", vec![json!(n)]).await.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(5), worker.join())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call_count(&calls), 5);
    worker.stop().await;
}

#[tokio::test]
async fn workers_reject_undeclared_queues() {
    let broker = Arc::new(
        Broker::builder(Arc::new(InMemoryAmqp::new()))
            .actor(recorder("record", &calls()).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let config = WorkerConfig {
        queues: Some(vec!["elsewhere".to_string()]),
        ..worker_config(1)
    };
    let err = Worker::start(broker, config).await.unwrap_err();
    assert!(matches!(err, SpindleError::Configuration(_)));
}

#[tokio::test]
async fn rate_limited_messages_are_retried_like_failures() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let attempts = Arc::clone(&calls);
    let throttled = Actor::builder(
        "throttled",
        handler_fn(move |args, _kwargs| {
            let attempts = Arc::clone(&attempts);
            async move {
                attempts.lock().unwrap().push(args);
                Err::<Value, _>(ActorError::rate_limit_exceeded("too many requests"))
            }
        }),
    )
    .option("max_retries", 2)
    .build()
    .unwrap();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(throttled)
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(1)).await.unwrap();
    broker.send("throttled", vec![]).await.unwrap();

    eventually("the message to be dead-lettered", || async {
        amqp.queue_len("default.XQ") == 1
    })
    .await;
    worker.stop().await;
    assert_eq!(call_count(&calls), 3);
    assert_eq!(amqp.queue_len("default"), 0);
}

#[tokio::test]
async fn workers_reconnect_after_the_broker_drops_connections() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(2)).await.unwrap();
    broker.send("record", vec![json!("before")]).await.unwrap();
    eventually("the first message to run", || async { call_count(&calls) == 1 }).await;
    let connections = amqp.connection_count();

    amqp.drop_connections();
    broker.send("record", vec![json!("after")]).await.unwrap();

    eventually("the second message to run", || async { call_count(&calls) == 2 }).await;
    worker.stop().await;
    assert!(amqp.connection_count() > connections);
    assert_eq!(calls.lock().unwrap()[1], vec![json!("after")]);
    assert_eq!(amqp.queue_len("default"), 0);
}

#[tokio::test]
async fn consumers_keep_retrying_while_connections_are_refused() {
    let amqp = InMemoryAmqp::new();
    let calls = calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(amqp.clone()))
            .config(fast_config())
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(1)).await.unwrap();
    eventually("the queue to be declared", || async {
        amqp.queue_arguments("default").is_some()
    })
    .await;

    amqp.refuse_connections(true);
    amqp.drop_connections();
    let err = broker.send("record", vec![json!(1)]).await.unwrap_err();
    assert!(matches!(err, SpindleError::ConnectionClosed(_)));
    tokio::time::sleep(Duration::from_millis(150)).await;

    amqp.refuse_connections(false);
    broker.send("record", vec![json!(2)]).await.unwrap();
    eventually("the message sent after recovery to run", || async {
        call_count(&calls) == 1
    })
    .await;
    worker.stop().await;
    assert_eq!(calls.lock().unwrap()[0], vec![json!(2)]);
}
