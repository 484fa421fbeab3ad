//! ConsumerLoop - 1 つの物理キューを消費するタスク
//!
//! # 動作
//! - `Q`: 受信したメッセージを優先度付きで work queue に積む
//! - `Q.DQ`: eta まで手元に保持し、期限が来たら `Q` に enqueue してから ack
//! - worker からの ack / nack 要求をこのタスクのチャネルで処理する
//!
//! The consumer owns its channel: acks and nacks for its deliveries are only
//! ever sent from this task. A connection error restarts the consumer after a
//! backoff; deliveries held at that point are redelivered by the broker.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::work_queue::{WorkQueue, WorkTracker};
use crate::broker::topology::{base_queue_name, is_delay_queue};
use crate::broker::{Broker, Consumer, ContextKey, MessageProxy};
use crate::error::SpindleError;
use crate::middleware::HookContext;

const RECONNECT_MIN_BACKOFF: Duration = Duration::from_millis(100);
const RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry interval of a delayed message that could not be moved.
const REDELIVERY_RETRY: Duration = Duration::from_secs(1);

/// A delivery handed to the workers.
pub(crate) struct Job {
    pub(crate) proxy: MessageProxy,
    pub(crate) acks: mpsc::UnboundedSender<AckRequest>,
}

/// Sent back by a worker once it is done with a job.
pub(crate) struct AckRequest {
    pub(crate) proxy: MessageProxy,
    pub(crate) ack: bool,
}

/// Delay-queue message waiting for its eta.
struct Delayed {
    due: Instant,
    seq: u64,
    proxy: MessageProxy,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reverse ordering: earlier times have higher priority
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum Event {
    Shutdown,
    Settle(AckRequest),
    Due,
    Delivery(Result<Option<MessageProxy>, SpindleError>),
}

pub(crate) struct ConsumerLoop {
    pub(crate) broker: Arc<Broker>,
    /// Physical queue name (`Q` or `Q.DQ`).
    pub(crate) queue_name: String,
    pub(crate) prefetch: u16,
    pub(crate) timeout: Duration,
    pub(crate) work: Arc<WorkQueue<Job>>,
    pub(crate) tracker: Arc<WorkTracker>,
}

impl ConsumerLoop {
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let ctx = ContextKey::Consumer(self.queue_name.clone());
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let mut delayed = BinaryHeap::new();
        let mut backoff = RECONNECT_MIN_BACKOFF;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let consumer = match self
                .broker
                .consume(&self.queue_name, self.prefetch, self.timeout)
                .await
            {
                Ok(consumer) => consumer,
                Err(err) => {
                    warn!(
                        queue = %self.queue_name,
                        error = %err,
                        "Consumer could not connect. Retrying in {}ms.",
                        backoff.as_millis()
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RECONNECT_MAX_BACKOFF);
                    continue;
                }
            };
            backoff = RECONNECT_MIN_BACKOFF;
            debug!(queue = %self.queue_name, consumer_id = consumer.id(), "Consumer started.");

            let stopped = self
                .consume(&ctx, &consumer, &ack_tx, &mut ack_rx, &mut delayed, &mut shutdown)
                .await;

            if let Err(err) = stopped {
                warn!(
                    queue = %self.queue_name,
                    error = %err,
                    "Consumer lost its connection. Restarting."
                );
                // 保持中の遅延メッセージはブローカーが再配送する
                self.tracker.done_many(delayed.len());
                delayed.clear();
                if let Err(err) = consumer.close().await {
                    debug!(
                        queue = %self.queue_name,
                        error = %err,
                        "Ignoring error while closing consumer."
                    );
                }
                continue;
            }

            // 停止: worker は先に止まっているので、残りの ack 要求を処理する
            while let Ok(request) = ack_rx.try_recv() {
                if let Err(err) = self.settle(&ctx, &consumer, request).await {
                    debug!(
                        queue = %self.queue_name,
                        error = %err,
                        "Could not settle message during shutdown."
                    );
                }
            }
            self.tracker.done_many(delayed.len());
            delayed.clear();
            if let Err(err) = consumer.close().await {
                debug!(
                    queue = %self.queue_name,
                    error = %err,
                    "Ignoring error while closing consumer."
                );
            }
            break;
        }

        let hook_ctx = HookContext {
            broker: &self.broker,
            context: &ctx,
        };
        self.broker
            .middleware()
            .before_consumer_thread_shutdown(&hook_ctx)
            .await;
        self.broker.release_channel(&ctx).await;
        debug!(queue = %self.queue_name, "Consumer stopped.");
    }

    /// `Ok` on shutdown, `Err` when the consumer has to be reopened.
    async fn consume(
        &self,
        ctx: &ContextKey,
        consumer: &Consumer,
        ack_tx: &mpsc::UnboundedSender<AckRequest>,
        ack_rx: &mut mpsc::UnboundedReceiver<AckRequest>,
        delayed: &mut BinaryHeap<Delayed>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), SpindleError> {
        let mut seq = 0u64;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            let next_due = delayed.peek().map(|entry| entry.due);
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => Event::Shutdown,
                Some(request) = ack_rx.recv() => Event::Settle(request),
                _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)),
                    if next_due.is_some() => Event::Due,
                delivery = consumer.next() => Event::Delivery(delivery),
            };

            match event {
                Event::Shutdown => return Ok(()),
                Event::Settle(request) => self.settle(ctx, consumer, request).await?,
                Event::Due => {
                    if let Some(entry) = delayed.pop() {
                        if let Some(entry) = self.redeliver(ctx, consumer, entry).await? {
                            delayed.push(entry);
                        }
                    }
                }
                Event::Delivery(delivery) => {
                    let Some(proxy) = delivery? else {
                        continue;
                    };
                    self.tracker.begin();
                    if is_delay_queue(&self.queue_name) {
                        let hook_ctx = HookContext {
                            broker: &self.broker,
                            context: ctx,
                        };
                        self.broker
                            .middleware()
                            .before_delay_message(&hook_ctx, &proxy)
                            .await;
                        let eta = proxy.message().options().eta.unwrap_or(0);
                        let now = self.broker.clock().now_millis();
                        let wait = u64::try_from(eta - now).unwrap_or(0);
                        seq += 1;
                        delayed.push(Delayed {
                            due: Instant::now() + Duration::from_millis(wait),
                            seq,
                            proxy,
                        });
                    } else {
                        let priority = proxy.message().options().priority.unwrap_or_else(|| {
                            self.broker
                                .get_actor(proxy.message().actor_name())
                                .ok()
                                .and_then(|actor| actor.priority())
                                .unwrap_or(0)
                        });
                        self.work.push(
                            priority,
                            Job {
                                proxy,
                                acks: ack_tx.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Move a due message to its main queue, then ack it here.
    ///
    /// Returns the entry to hold again when the move failed.
    async fn redeliver(
        &self,
        ctx: &ContextKey,
        consumer: &Consumer,
        entry: Delayed,
    ) -> Result<Option<Delayed>, SpindleError> {
        let message = entry.proxy.message();
        let ready = message
            .with_queue_name(base_queue_name(message.queue_name()))
            .with_options(|options| options.eta = None);

        match self.broker.enqueue_in(ctx, &ready, None).await {
            Ok(_) => {
                self.settle(ctx, consumer, AckRequest { proxy: entry.proxy, ack: true })
                    .await?;
                Ok(None)
            }
            Err(SpindleError::ActorNotFound(actor_name)) => {
                warn!(
                    message_id = %message.message_id(),
                    actor = %actor_name,
                    "Delayed message for an undefined actor."
                );
                self.settle(ctx, consumer, AckRequest { proxy: entry.proxy, ack: false })
                    .await?;
                Ok(None)
            }
            Err(err) => {
                warn!(
                    message_id = %message.message_id(),
                    error = %err,
                    "Failed to move delayed message."
                );
                Ok(Some(Delayed {
                    due: Instant::now() + REDELIVERY_RETRY,
                    ..entry
                }))
            }
        }
    }

    async fn settle(
        &self,
        ctx: &ContextKey,
        consumer: &Consumer,
        request: AckRequest,
    ) -> Result<(), SpindleError> {
        let hook_ctx = HookContext {
            broker: &self.broker,
            context: ctx,
        };
        let middleware = self.broker.middleware();
        let proxy = &request.proxy;
        let settled = if request.ack {
            middleware.before_ack(&hook_ctx, proxy).await;
            let acked = consumer.ack(proxy).await;
            if acked.is_ok() {
                middleware.after_ack(&hook_ctx, proxy).await;
            }
            acked
        } else {
            middleware.before_nack(&hook_ctx, proxy).await;
            let nacked = consumer.nack(proxy).await;
            if nacked.is_ok() {
                middleware.after_nack(&hook_ctx, proxy).await;
            }
            nacked
        };
        self.tracker.done();
        settled
    }
}
