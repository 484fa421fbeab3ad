//! Broker - AMQP ブローカーアダプタ
//!
//! # 責務
//! - 接続の遅延確立と、切断時の再接続
//! - 実行コンテキストごとのチャネル管理（`ContextKey`）
//! - キュー宣言（`Q` / `Q.DQ` / `Q.XQ`）と enqueue（再試行付き）
//! - キューの状態取得・purge・join
//!
//! # 不変条件
//! - 最初の enqueue / consume まで接続しない
//! - enqueue は最大 `MAX_ENQUEUE_ATTEMPTS` 回試行し、尽きたら `ConnectionClosed`
//! - キュー集合が変わるか再接続したら、次の利用時に全キューを再宣言する
//! - client チャネルは操作ごとに貸し出し、並行する操作で共有しない

pub mod channels;
pub mod consumer;
pub mod topology;

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::app::{BrokerBuilder, BrokerConfig};
use crate::domain::{Actor, Message, validate_queue_name};
use crate::error::SpindleError;
use crate::middleware::{HookContext, MiddlewareChain};
use crate::observability::QueueCounts;
use crate::ports::{
    AmqpChannel, AmqpConnection, AmqpConnector, AmqpError, BasicProperties, Clock, ResultBackend,
};
use crate::results::MessageResult;
use crate::runtime::{ActorRegistry, Runtime};

pub(crate) use self::channels::ChannelPool;
pub use self::channels::ContextKey;
pub use self::consumer::{Consumer, MessageProxy};
use self::topology::{base_queue_name, dead_letter_queue_name, delay_queue_name};

/// Publish attempts per enqueue, reconnecting in between.
pub const MAX_ENQUEUE_ATTEMPTS: usize = 6;

/// How `Broker::join` decides a queue is drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOptions {
    /// Consecutive empty observations required.
    pub min_successes: u32,
    /// Sleep between observations.
    pub idle_time: Duration,
    pub timeout: Option<Duration>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            min_successes: 10,
            idle_time: Duration::from_millis(100),
            timeout: None,
        }
    }
}

impl JoinOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct Broker {
    config: BrokerConfig,
    connector: Arc<dyn AmqpConnector>,
    connection: Mutex<Option<Arc<dyn AmqpConnection>>>,
    channels: ChannelPool,
    queues: RwLock<BTreeSet<String>>,
    queues_declared: AtomicBool,
    runtime: Runtime,
    middleware: MiddlewareChain,
    clock: Arc<dyn Clock>,
}

impl Broker {
    pub fn builder(connector: Arc<dyn AmqpConnector>) -> BrokerBuilder {
        BrokerBuilder::new(connector)
    }

    /// Does not connect; the first operation that needs the broker does.
    pub(crate) fn new(
        config: BrokerConfig,
        connector: Arc<dyn AmqpConnector>,
        runtime: Runtime,
        middleware: MiddlewareChain,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queues = runtime
            .registry()
            .actors()
            .map(|actor| actor.queue_name().to_string())
            .collect();
        Self {
            config,
            connector,
            connection: Mutex::new(None),
            channels: ChannelPool::default(),
            queues: RwLock::new(queues),
            queues_declared: AtomicBool::new(false),
            runtime,
            middleware,
            clock,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn registry(&self) -> &ActorRegistry {
        self.runtime.registry()
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn get_actor(&self, actor_name: &str) -> Result<&Actor, SpindleError> {
        self.runtime.actor(actor_name)
    }

    pub fn result_backend(&self) -> Option<Arc<dyn ResultBackend>> {
        self.middleware.result_backend()
    }

    pub(crate) fn require_result_backend(&self) -> Result<Arc<dyn ResultBackend>, SpindleError> {
        self.result_backend().ok_or_else(|| {
            SpindleError::Configuration("no result backend is configured".to_string())
        })
    }

    /// Result view of `message`.
    pub fn result(&self, message: &Message) -> Result<MessageResult, SpindleError> {
        Ok(MessageResult::new(
            self.require_result_backend()?,
            message.message_id(),
        ))
    }

    /// Names of the logical queues, sorted.
    pub fn get_declared_queues(&self) -> BTreeSet<String> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Add a logical queue. The broker side is declared on next use.
    pub fn declare_queue(&self, queue_name: &str) -> Result<(), SpindleError> {
        let queue_name = base_queue_name(queue_name);
        validate_queue_name(queue_name)?;
        let added = self
            .queues
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(queue_name.to_string());
        if added {
            debug!(queue = queue_name, "Declared queue.");
            self.queues_declared.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn connection(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let mut connection = self.connection.lock().await;
        if let Some(existing) = connection.as_ref() {
            if existing.is_open() {
                return Ok(Arc::clone(existing));
            }
        }
        let opened = self.connector.connect(&self.config.url).await?;
        info!("Connected to the broker.");
        // 新しい接続ではキューを宣言し直す
        self.queues_declared.store(false, Ordering::SeqCst);
        *connection = Some(Arc::clone(&opened));
        Ok(opened)
    }

    /// A channel for `ctx`, opened on first use.
    ///
    /// Owning contexts keep theirs in the pool. A client channel is leased:
    /// hand it back with `ChannelPool::checkin` once the operation succeeded.
    pub(crate) async fn channel(
        &self,
        ctx: &ContextKey,
    ) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if let Some(channel) = self.channels.get(ctx) {
            return Ok(channel);
        }
        let channel = self.connection().await?.open_channel().await?;
        if self.config.confirm_delivery {
            channel.confirm_deliveries().await?;
        }
        debug!(context = %ctx, "Opened channel.");
        let (channel, loser) = self.channels.insert(ctx.clone(), channel);
        if let Some(loser) = loser {
            if let Err(err) = loser.close().await {
                debug!(context = %ctx, error = %err, "Ignoring error while closing channel.");
            }
        }
        Ok(channel)
    }

    /// Run `op` on a channel of `ctx`, dropping the channel (or the
    /// connection) when it fails.
    async fn with_channel<T, F, Fut>(&self, ctx: &ContextKey, op: F) -> Result<T, SpindleError>
    where
        F: FnOnce(Arc<dyn AmqpChannel>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        let channel = match self.channel(ctx).await {
            Ok(channel) => channel,
            Err(err) => return Err(self.recover(ctx, None, err).await),
        };
        match op(Arc::clone(&channel)).await {
            Ok(value) => {
                self.channels.checkin(ctx, channel);
                Ok(value)
            }
            Err(err) => Err(self.recover(ctx, Some(channel), err).await),
        }
    }

    /// Declare `Q`, `Q.DQ` and `Q.XQ` of every logical queue.
    async fn declare_all(
        &self,
        ctx: &ContextKey,
        channel: &dyn AmqpChannel,
    ) -> Result<(), AmqpError> {
        let hook_ctx = HookContext {
            broker: self,
            context: ctx,
        };
        for queue_name in self.get_declared_queues() {
            self.middleware.before_declare_queue(&hook_ctx, &queue_name).await;
            topology::declare(channel, &queue_name, self.config.max_priority).await?;
            self.middleware.after_declare_queue(&hook_ctx, &queue_name).await;
            self.middleware
                .after_declare_delay_queue(&hook_ctx, &delay_queue_name(&queue_name))
                .await;
        }
        self.queues_declared.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn ensure_queues_declared(
        &self,
        ctx: &ContextKey,
        channel: &dyn AmqpChannel,
    ) -> Result<(), AmqpError> {
        if self.queues_declared.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.declare_all(ctx, channel).await
    }

    /// Drop the broken resource behind `err` so the next use reopens it.
    async fn recover(
        &self,
        ctx: &ContextKey,
        leased: Option<Arc<dyn AmqpChannel>>,
        err: AmqpError,
    ) -> SpindleError {
        if err.is_connection_error() {
            self.reset_connection().await;
        } else if ctx.is_leased() {
            if let Some(channel) = leased {
                if let Err(close_err) = channel.close().await {
                    debug!(
                        context = %ctx,
                        error = %close_err,
                        "Ignoring error while closing channel."
                    );
                }
            }
        } else {
            self.release_channel(ctx).await;
        }
        err.into()
    }

    pub async fn enqueue(&self, message: &Message) -> Result<Message, SpindleError> {
        self.enqueue_in(&ContextKey::Client, message, None).await
    }

    pub async fn enqueue_with_delay(
        &self,
        message: &Message,
        delay: Duration,
    ) -> Result<Message, SpindleError> {
        self.enqueue_in(&ContextKey::Client, message, Some(delay)).await
    }

    /// Build a message for `actor_name` and enqueue it.
    pub async fn send(&self, actor_name: &str, args: Vec<Value>) -> Result<Message, SpindleError> {
        let message = self.get_actor(actor_name)?.message(args);
        self.enqueue(&message).await
    }

    /// Enqueue from the channel of `ctx`.
    ///
    /// A delayed message goes to `Q.DQ` with an absolute `eta`. Returns the
    /// message as it was published.
    pub async fn enqueue_in(
        &self,
        ctx: &ContextKey,
        message: &Message,
        delay: Option<Duration>,
    ) -> Result<Message, SpindleError> {
        let actor = self.get_actor(message.actor_name())?;
        let queue_name = base_queue_name(message.queue_name()).to_string();
        self.declare_queue(&queue_name)?;

        let properties =
            BasicProperties::persistent(message.options().priority.or_else(|| actor.priority()));
        let message = match delay {
            Some(delay) => {
                let eta = self.clock.now_millis()
                    + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                message
                    .with_queue_name(delay_queue_name(&queue_name))
                    .with_options(|options| options.eta = Some(eta))
            }
            None => message.clone(),
        };
        let body = message.encode()?;
        let hook_ctx = HookContext {
            broker: self,
            context: ctx,
        };

        let published_message = &message;
        let body = body.as_slice();
        let mut attempts = 0;
        loop {
            attempts += 1;
            let published = self
                .with_channel(ctx, |channel| async move {
                    self.ensure_queues_declared(ctx, channel.as_ref()).await?;
                    self.middleware
                        .before_enqueue(&hook_ctx, published_message, delay)
                        .await;
                    channel
                        .basic_publish("", published_message.queue_name(), body, properties)
                        .await
                })
                .await;
            match published {
                Ok(()) => break,
                Err(err) => {
                    debug!(
                        attempts,
                        error = %err,
                        message_id = %message.message_id(),
                        "Publish failed."
                    );
                    if attempts >= MAX_ENQUEUE_ATTEMPTS {
                        return Err(err);
                    }
                }
            }
        }

        debug!(
            message_id = %message.message_id(),
            queue = message.queue_name(),
            "Enqueued message."
        );
        self.middleware.after_enqueue(&hook_ctx, &message, delay).await;
        Ok(message)
    }

    /// Open a consumer on the physical queue `queue_name` on a fresh channel.
    pub async fn consume(
        &self,
        queue_name: &str,
        prefetch: u16,
        timeout: Duration,
    ) -> Result<Consumer, SpindleError> {
        let opened = async {
            let channel = self.connection().await?.open_channel().await?;
            self.declare_all(&ContextKey::Consumer(queue_name.to_string()), channel.as_ref())
                .await?;
            channel.basic_qos(prefetch).await?;
            channel.basic_consume(queue_name).await?;
            Ok::<_, AmqpError>(channel)
        }
        .await;
        match opened {
            Ok(channel) => Ok(Consumer::new(
                channel,
                queue_name,
                timeout,
                self.config.poll_interval(),
            )),
            Err(err) => {
                if err.is_connection_error() {
                    self.reset_connection().await;
                }
                Err(err.into())
            }
        }
    }

    /// Ready messages of `Q`, `Q.DQ` and `Q.XQ`. Unacked deliveries are not
    /// counted.
    pub async fn get_queue_message_counts(
        &self,
        queue_name: &str,
    ) -> Result<QueueCounts, SpindleError> {
        let queue_name = base_queue_name(queue_name);
        let max_priority = self.config.max_priority;
        self.with_channel(&ContextKey::Client, |channel| async move {
            topology::declare(channel.as_ref(), queue_name, max_priority).await
        })
        .await
    }

    /// Drop every ready message of `Q`, `Q.DQ` and `Q.XQ`.
    pub async fn flush(&self, queue_name: &str) -> Result<(), SpindleError> {
        let queue_name = base_queue_name(queue_name);
        let max_priority = self.config.max_priority;
        self.with_channel(&ContextKey::Client, |channel| async move {
            topology::declare(channel.as_ref(), queue_name, max_priority).await?;
            for name in [
                queue_name.to_string(),
                delay_queue_name(queue_name),
                dead_letter_queue_name(queue_name),
            ] {
                channel.queue_purge(&name).await?;
            }
            Ok(())
        })
        .await?;
        debug!(queue = queue_name, "Flushed queue.");
        Ok(())
    }

    pub async fn flush_all(&self) -> Result<(), SpindleError> {
        for queue_name in self.get_declared_queues() {
            self.flush(&queue_name).await?;
        }
        Ok(())
    }

    /// Wait until `Q` and `Q.DQ` were observed empty `min_successes` times
    /// in a row.
    ///
    /// Messages in flight are invisible to the counts, which is why a single
    /// empty observation is not enough.
    pub async fn join(&self, queue_name: &str, options: JoinOptions) -> Result<(), SpindleError> {
        let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
        let mut successes = 0;
        loop {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(SpindleError::QueueJoinTimeout(queue_name.to_string()));
            }
            if self.get_queue_message_counts(queue_name).await?.pending() == 0 {
                successes += 1;
                if successes >= options.min_successes {
                    return Ok(());
                }
            } else {
                successes = 0;
            }
            tokio::time::sleep(options.idle_time).await;
        }
    }

    /// Close the channel of `ctx`, or every idle client channel.
    pub async fn release_channel(&self, ctx: &ContextKey) {
        for channel in self.channels.remove(ctx) {
            if let Err(err) = channel.close().await {
                debug!(context = %ctx, error = %err, "Ignoring error while closing channel.");
            }
        }
    }

    /// Forget the current connection; the next operation reconnects and
    /// redeclares every queue.
    pub async fn reset_connection(&self) {
        let connection = self.connection.lock().await.take();
        self.queues_declared.store(false, Ordering::SeqCst);
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                debug!(error = %err, "Ignoring error while closing connection.");
            }
        }
    }

    pub async fn close(&self) {
        for channel in self.channels.drain() {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Ignoring error while closing channel.");
            }
        }
        self.reset_connection().await;
        info!("Broker closed.");
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("queues", &self.get_declared_queues())
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}
