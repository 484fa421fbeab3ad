//! Pipelines, groups and their results, end to end.

mod common;

use std::sync::Arc;

use serde_json::{Value, json};
use spindle_core::domain::Outcome;
use spindle_core::impls::{InMemoryAmqp, LocalBackend};
use spindle_core::middleware::Results;
use spindle_core::ports::ResultBackend;
use spindle_core::results::{GetOptions, MessageResult, ResultHandle};
use spindle_core::{Broker, Group, Pipeline, SpindleError, Worker};

use common::{
    Calls, add, call_count, calls, eventually, failing, fast_config, recorder, worker_config,
};

struct Fixture {
    broker: Arc<Broker>,
    backend: Arc<LocalBackend>,
    worker: Worker,
    calls: Calls,
    failures: Calls,
}

/// `add`, `record` and `fail` actors storing every result.
async fn fixture() -> Fixture {
    let backend = Arc::new(LocalBackend::new());
    let calls = calls();
    let failures = common::calls();
    let broker = Arc::new(
        Broker::builder(Arc::new(InMemoryAmqp::new()))
            .config(fast_config())
            .results_middleware(Results::new(backend.clone()).store_results(true))
            .unwrap()
            .actor(add().build().unwrap())
            .unwrap()
            .actor(recorder("record", &calls).build().unwrap())
            .unwrap()
            .actor(failing("fail", "RuntimeError", &failures).build().unwrap())
            .unwrap()
            .build()
            .unwrap(),
    );
    let worker = Worker::start(Arc::clone(&broker), worker_config(4)).await.unwrap();
    Fixture {
        broker,
        backend,
        worker,
        calls,
        failures,
    }
}

fn message(broker: &Broker, actor_name: &str, args: Vec<Value>) -> spindle_core::Message {
    broker.get_actor(actor_name).unwrap().message(args)
}

#[tokio::test]
async fn pipeline_steps_receive_the_previous_result() {
    let fx = fixture().await;
    let pipe = message(&fx.broker, "add", vec![json!(1), json!(2)])
        | message(&fx.broker, "add", vec![json!(3)])
        | message(&fx.broker, "add", vec![json!(4)]);
    pipe.run(&fx.broker).await.unwrap();

    let last = pipe.result(&fx.broker).unwrap();
    assert_eq!(last.get(GetOptions::blocking()).await.unwrap(), Some(json!(10)));
    let every_step = pipe.results(&fx.broker).unwrap();
    assert_eq!(
        every_step.get(GetOptions::blocking()).await.unwrap(),
        vec![Some(json!(3)), Some(json!(6)), Some(json!(10))]
    );
    fx.worker.stop().await;
}

#[tokio::test]
async fn nested_pipelines_run_in_flattened_order() {
    let fx = fixture().await;
    let inner = message(&fx.broker, "record", vec![json!("b")])
        | message(&fx.broker, "record", vec![json!("c")]);
    let pipe = Pipeline::new([
        message(&fx.broker, "record", vec![json!("a")]).into(),
        spindle_core::composition::Composable::from(inner),
        message(&fx.broker, "record", vec![json!("d")]).into(),
    ]);
    assert_eq!(pipe.len(), 4);
    pipe.run(&fx.broker).await.unwrap();

    eventually("every step to run", || async { call_count(&fx.calls) == 4 }).await;
    let heads: Vec<Value> = fx.calls.lock().unwrap().iter().map(|args| args[0].clone()).collect();
    assert_eq!(heads, vec![json!("a"), json!("b"), json!("c"), json!("d")]);
    fx.worker.stop().await;
}

#[tokio::test]
async fn failures_propagate_as_parent_failed() {
    let fx = fixture().await;
    let pipe = message(&fx.broker, "fail", vec![])
        | message(&fx.broker, "add", vec![json!(1)])
        | message(&fx.broker, "add", vec![json!(2)]);
    pipe.run(&fx.broker).await.unwrap();

    let ids = pipe.message_ids();
    let backend: Arc<dyn ResultBackend> = fx.backend.clone();
    let mut kinds = Vec::new();
    for message_id in ids {
        let outcome = MessageResult::new(Arc::clone(&backend), message_id)
            .outcome(GetOptions::blocking())
            .await
            .unwrap();
        let Outcome::Failure(failure) = outcome else {
            panic!("expected a failure, got {outcome:?}");
        };
        kinds.push(failure.is_parent_failed());
    }
    assert_eq!(kinds, vec![false, true, true]);

    let err = pipe
        .result(&fx.broker)
        .unwrap()
        .get(GetOptions::blocking())
        .await
        .unwrap_err();
    assert!(matches!(err, SpindleError::ErrorStored(ref text) if text.contains("ParentFailed")));
    assert_eq!(call_count(&fx.failures), 1);
    fx.worker.stop().await;
}

#[tokio::test]
async fn failures_propagate_into_trailing_groups() {
    let fx = fixture().await;
    let group = Group::new([
        message(&fx.broker, "add", vec![json!(1)]),
        message(&fx.broker, "add", vec![json!(2)]),
    ])
    .unwrap();
    let pipe = message(&fx.broker, "fail", vec![]) | group.clone();
    pipe.run(&fx.broker).await.unwrap();

    let members = group.results(&fx.broker).unwrap();
    let values = members
        .get(GetOptions::blocking().without_raising())
        .await
        .unwrap();
    assert_eq!(values, vec![None, None]);
    assert!(members.completed().await.unwrap());
    assert_eq!(call_count(&fx.calls), 0);
    fx.worker.stop().await;
}

#[tokio::test]
async fn group_results_count_completed_members() {
    let fx = fixture().await;
    fx.worker.pause();
    let group = Group::new([
        message(&fx.broker, "add", vec![json!(1)]),
        message(&fx.broker, "add", vec![json!(2)]),
        message(&fx.broker, "add", vec![json!(3)]),
    ])
    .unwrap();
    group.run(&fx.broker).await.unwrap();

    let results = group.results(&fx.broker).unwrap();
    assert_eq!(results.completed_count().await.unwrap(), 0);
    assert!(!results.completed().await.unwrap());

    fx.worker.resume();
    assert_eq!(
        results.get(GetOptions::blocking()).await.unwrap(),
        vec![Some(json!(1)), Some(json!(2)), Some(json!(3))]
    );
    assert_eq!(results.completed_count().await.unwrap(), 3);
    assert!(results.completed().await.unwrap());
    fx.worker.stop().await;
}

#[tokio::test]
async fn waiting_on_a_group_waits_for_every_member() {
    let fx = fixture().await;
    fx.worker.pause();
    let group = Group::new([
        message(&fx.broker, "add", vec![json!(1)]),
        message(&fx.broker, "add", vec![json!(2)]),
    ])
    .unwrap();
    group.run(&fx.broker).await.unwrap();
    let results = group.results(&fx.broker).unwrap();

    let err = results
        .wait(Some(std::time::Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(matches!(err, SpindleError::ResultTimeout(_)));

    fx.worker.resume();
    results
        .wait(Some(std::time::Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(results.completed_count().await.unwrap(), 2);
    fx.worker.stop().await;
}

#[tokio::test]
async fn forgetting_reads_return_values_once() {
    let fx = fixture().await;
    let group = Group::new([
        message(&fx.broker, "add", vec![json!(5)]),
        message(&fx.broker, "add", vec![json!(6)]),
    ])
    .unwrap();
    group.run(&fx.broker).await.unwrap();
    let results = group.results(&fx.broker).unwrap();

    assert_eq!(
        results.get(GetOptions::blocking().forgetting()).await.unwrap(),
        vec![Some(json!(5)), Some(json!(6))]
    );
    assert_eq!(results.get(GetOptions::default()).await.unwrap(), vec![None, None]);
    assert!(results.completed().await.unwrap());
    fx.worker.stop().await;
}

#[tokio::test]
async fn groups_fan_in_to_their_successor() {
    let fx = fixture().await;
    let group = Group::new([
        message(&fx.broker, "add", vec![json!(1)]),
        message(&fx.broker, "add", vec![json!(2)]),
    ])
    .unwrap();
    let group_id = group.group_id();
    let member_ids = group.message_ids().to_vec();
    let pipe = group | message(&fx.broker, "record", vec![]);
    pipe.run(&fx.broker).await.unwrap();

    let last = pipe.result(&fx.broker).unwrap();
    assert!(matches!(last, ResultHandle::Message(_)));
    assert_eq!(
        last.get(GetOptions::blocking()).await.unwrap(),
        Some(json!([[1, 2]]))
    );
    assert_eq!(fx.calls.lock().unwrap()[0], vec![json!([1, 2])]);

    eventually("the member ids to be deleted", || async {
        matches!(
            fx.backend.get_group_message_ids(group_id).await,
            Err(SpindleError::MessageIdsMissing(_))
        )
    })
    .await;
    for message_id in member_ids {
        let forgotten = MessageResult::new(fx.backend.clone(), message_id)
            .get(GetOptions::default())
            .await
            .unwrap();
        assert_eq!(forgotten, None);
    }
    fx.worker.stop().await;
}

#[tokio::test]
async fn messages_fan_out_to_a_trailing_group() {
    let fx = fixture().await;
    let group = Group::new([
        message(&fx.broker, "record", vec![json!("a")]),
        message(&fx.broker, "record", vec![json!("b")]),
    ])
    .unwrap();
    let pipe = message(&fx.broker, "add", vec![json!(1), json!(2)]) | group;
    pipe.run(&fx.broker).await.unwrap();

    let last = pipe.result(&fx.broker).unwrap();
    assert_eq!(
        last.get(GetOptions::blocking()).await.unwrap(),
        Some(json!([["a", 3], ["b", 3]]))
    );
    fx.worker.stop().await;
}

#[tokio::test]
async fn ignoring_successors_keep_their_own_args() {
    let fx = fixture().await;
    let ignoring = message(&fx.broker, "record", vec![json!("x")])
        .with_options(|options| options.pipe_ignore = Some(true));
    let pipe = message(&fx.broker, "add", vec![json!(1), json!(2)]) | ignoring;
    pipe.run(&fx.broker).await.unwrap();

    let last = pipe.result(&fx.broker).unwrap();
    assert_eq!(last.get(GetOptions::blocking()).await.unwrap(), Some(json!(["x"])));
    fx.worker.stop().await;
}

#[tokio::test]
async fn nested_groups_are_rejected() {
    let fx = fixture().await;
    let inner = Group::new([message(&fx.broker, "add", vec![json!(1)])]).unwrap();
    let err = Group::new([
        spindle_core::composition::Composable::from(message(&fx.broker, "add", vec![json!(2)])),
        inner.into(),
    ])
    .unwrap_err();
    assert!(matches!(err, SpindleError::Configuration(_)));
    fx.worker.stop().await;
}
