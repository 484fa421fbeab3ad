//! Shared fixtures for the end-to-end tests.

#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use spindle_core::app::{BrokerConfig, RetriesConfig, WorkerConfig};
use spindle_core::domain::{Actor, ActorError, handler_fn};

/// Broker settings with short polls and millisecond backoffs.
pub fn fast_config() -> BrokerConfig {
    BrokerConfig {
        consumer_poll_interval_ms: 5,
        retries: RetriesConfig {
            min_backoff_ms: 10,
            max_backoff_ms: 40,
            ..RetriesConfig::default()
        },
        ..BrokerConfig::default()
    }
}

pub fn worker_config(worker_threads: usize) -> WorkerConfig {
    WorkerConfig {
        worker_threads,
        worker_timeout_ms: 50,
        ..WorkerConfig::default()
    }
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub type Calls = Arc<Mutex<Vec<Vec<Value>>>>;

pub fn calls() -> Calls {
    Arc::new(Mutex::new(Vec::new()))
}

/// Records the args of every call and returns them as an array.
pub fn recorder(actor_name: &str, calls: &Calls) -> spindle_core::domain::ActorBuilder {
    let calls = Arc::clone(calls);
    Actor::builder(
        actor_name,
        handler_fn(move |args, _kwargs| {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().unwrap().push(args.clone());
                Ok(Value::Array(args))
            }
        }),
    )
}

/// Sums integer args.
pub fn add() -> spindle_core::domain::ActorBuilder {
    Actor::builder(
        "add",
        handler_fn(|args, _kwargs| async move {
            let sum: i64 = args
                .iter()
                .map(|arg| match arg {
                    Value::Array(items) => items.iter().filter_map(Value::as_i64).sum(),
                    other => other.as_i64().unwrap_or(0),
                })
                .sum();
            Ok(json!(sum))
        }),
    )
}

/// Always fails with `error_name`, counting attempts.
pub fn failing(
    actor_name: &str,
    error_name: &'static str,
    calls: &Calls,
) -> spindle_core::domain::ActorBuilder {
    let calls = Arc::clone(calls);
    Actor::builder(
        actor_name,
        handler_fn(move |args, _kwargs| {
            let calls = Arc::clone(&calls);
            async move {
                calls.lock().unwrap().push(args);
                Err::<Value, _>(ActorError::new(error_name, "boom"))
            }
        }),
    )
}

pub fn call_count(calls: &Calls) -> usize {
    calls.lock().unwrap().len()
}
