//! Worker - メッセージを消費して処理する
//!
//! # 構成
//! - consumer タスク: 論理キューごとに `Q` と `Q.DQ` の 2 本
//! - worker タスク: `worker_threads` 本。work queue から優先度順に取り出して処理
//!
//! Shutdown follows two signals: workers stop first, then consumers settle
//! whatever the workers handed back and close their channels. Messages that
//! were fetched but never processed are redelivered by the broker.

mod consumer_loop;
mod process;
mod work_queue;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::app::WorkerConfig;
use crate::broker::topology::delay_queue_name;
use crate::broker::{Broker, ContextKey};
use crate::domain::{Decider, DefaultDecider};
use crate::error::SpindleError;
use crate::middleware::HookContext;

use self::consumer_loop::{AckRequest, ConsumerLoop, Job};
use self::work_queue::{PauseGate, WorkQueue, WorkTracker};

/// Worker handle.
/// - `stop()` で全タスクを止めて終了を待つ
/// - `join()` でキューが空になるまで待てる
pub struct Worker {
    broker: Arc<Broker>,
    queues: Vec<String>,
    work: Arc<WorkQueue<Job>>,
    tracker: Arc<WorkTracker>,
    paused: Arc<PauseGate>,
    worker_shutdown: watch::Sender<bool>,
    consumer_shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    consumers: Vec<JoinHandle<()>>,
}

impl Worker {
    pub async fn start(broker: Arc<Broker>, config: WorkerConfig) -> Result<Self, SpindleError> {
        Self::start_with_decider(broker, config, Arc::new(DefaultDecider::default())).await
    }

    pub async fn start_with_decider(
        broker: Arc<Broker>,
        config: WorkerConfig,
        decider: Arc<dyn Decider>,
    ) -> Result<Self, SpindleError> {
        config.validate()?;
        let queues = resolve_queues(&broker, &config)?;

        let hook_ctx = HookContext {
            broker: &broker,
            context: &ContextKey::Client,
        };
        broker.middleware().before_worker_boot(&hook_ctx).await;

        let work = Arc::new(WorkQueue::new());
        let tracker = Arc::new(WorkTracker::default());
        let paused = Arc::new(PauseGate::default());
        let (worker_shutdown, worker_rx) = watch::channel(false);
        let (consumer_shutdown, consumer_rx) = watch::channel(false);

        let mut consumers = Vec::with_capacity(queues.len() * 2);
        for queue_name in &queues {
            for (physical, prefetch) in [
                (queue_name.clone(), config.queue_prefetch()),
                (delay_queue_name(queue_name), config.delay_prefetch),
            ] {
                let consumer = ConsumerLoop {
                    broker: Arc::clone(&broker),
                    queue_name: physical,
                    prefetch,
                    timeout: config.worker_timeout(),
                    work: Arc::clone(&work),
                    tracker: Arc::clone(&tracker),
                };
                consumers.push(tokio::spawn(consumer.run(consumer_rx.clone())));
            }
        }

        let mut workers = Vec::with_capacity(config.worker_threads);
        for worker_id in 0..config.worker_threads {
            let broker = Arc::clone(&broker);
            let work = Arc::clone(&work);
            let paused = Arc::clone(&paused);
            let decider = Arc::clone(&decider);
            let rx = worker_rx.clone();
            workers.push(tokio::spawn(async move {
                worker_loop(worker_id, broker, work, paused, decider, rx).await;
            }));
        }

        broker.middleware().after_worker_boot(&hook_ctx).await;
        info!(worker_threads = config.worker_threads, queues = ?queues, "Worker started.");

        Ok(Self {
            broker: Arc::clone(&broker),
            queues,
            work,
            tracker,
            paused,
            worker_shutdown,
            consumer_shutdown,
            workers,
            consumers,
        })
    }

    /// Logical queues this worker consumes.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Stop taking new messages; consumers keep prefetching.
    pub fn pause(&self) {
        self.paused.pause();
        info!("Worker paused.");
    }

    pub fn resume(&self) {
        self.paused.resume();
        info!("Worker resumed.");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_paused()
    }

    /// Wait until nothing is in flight and every consumed queue is empty,
    /// observed twice in a row.
    pub async fn join(&self) -> Result<(), SpindleError> {
        let mut idle_observations = 0;
        loop {
            self.tracker.wait_idle().await;
            let mut pending = 0u32;
            for queue_name in &self.queues {
                let counts = self.broker.get_queue_message_counts(queue_name).await?;
                pending = pending.saturating_add(counts.pending());
            }
            if pending == 0 && self.tracker.outstanding() == 0 && self.work.len() == 0 {
                idle_observations += 1;
                if idle_observations >= 2 {
                    return Ok(());
                }
            } else {
                idle_observations = 0;
            }
            tokio::time::sleep(self.broker.config().poll_interval()).await;
        }
    }

    pub async fn stop(self) {
        let hook_ctx = HookContext {
            broker: &self.broker,
            context: &ContextKey::Client,
        };
        self.broker
            .middleware()
            .before_worker_shutdown(&hook_ctx)
            .await;

        // ignore send error: receivers may already be dropped
        let _ = self.worker_shutdown.send(true);
        self.work.close();
        for handle in self.workers {
            if let Err(err) = handle.await {
                error!(error = %err, "Worker task panicked.");
            }
        }

        let _ = self.consumer_shutdown.send(true);
        for handle in self.consumers {
            if let Err(err) = handle.await {
                error!(error = %err, "Consumer task panicked.");
            }
        }

        self.broker
            .middleware()
            .after_worker_shutdown(&hook_ctx)
            .await;
        info!("Worker stopped.");
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("queues", &self.queues)
            .field("workers", &self.workers.len())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

/// Every declared queue, or the configured subset of them.
fn resolve_queues(broker: &Broker, config: &WorkerConfig) -> Result<Vec<String>, SpindleError> {
    let declared = broker.get_declared_queues();
    match &config.queues {
        None => Ok(declared.into_iter().collect()),
        Some(queues) => {
            let unknown: Vec<&str> = queues
                .iter()
                .map(String::as_str)
                .filter(|queue_name| !declared.contains(*queue_name))
                .collect();
            if !unknown.is_empty() {
                return Err(SpindleError::Configuration(format!(
                    "worker queues {unknown:?} are not declared on the broker"
                )));
            }
            Ok(queues.clone())
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    broker: Arc<Broker>,
    work: Arc<WorkQueue<Job>>,
    paused: Arc<PauseGate>,
    decider: Arc<dyn Decider>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ctx = ContextKey::Worker(worker_id);
    loop {
        // shutdown が来ていたら抜ける
        if *shutdown.borrow() {
            break;
        }

        let entry = tokio::select! {
            _ = shutdown.changed() => break,
            entry = async {
                paused.wait_resumed().await;
                work.pop().await
            } => entry,
        };
        let Some(entry) = entry else {
            break;
        };
        if paused.is_paused() {
            work.requeue(entry);
            continue;
        }

        let Job { proxy, acks } = entry.item;
        let state = process::process(&broker, &ctx, &proxy, decider.as_ref()).await;
        debug!(worker_id, message_id = %proxy.message().message_id(), ?state, "Message processed.");

        let ack = state.acks_delivery();
        if acks.send(AckRequest { proxy, ack }).is_err() {
            warn!(worker_id, "Consumer is gone; the message will be redelivered.");
        }
    }

    let hook_ctx = HookContext {
        broker: &broker,
        context: &ctx,
    };
    broker
        .middleware()
        .before_worker_thread_shutdown(&hook_ctx)
        .await;
    broker.release_channel(&ctx).await;
    debug!(worker_id, "Worker task stopped.");
}
