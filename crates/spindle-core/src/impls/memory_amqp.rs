//! InMemoryAmqp - 開発・テスト用の AMQP モデル
//!
//! # 学習ポイント
//! - AMQP 0-9-1 の最低限の意味論をプロセス内で再現する
//! - durable queue、priority（x-max-priority）、dead-letter ルーティング、
//!   x-message-ttl、prefetch、channel close 時の unacked 再投入
//! - 障害注入（接続断、publish 失敗）で再接続ロジックを検証できる
//!
//! Only the default (`""`) exchange exists; publishing routes by queue name
//! and silently drops messages for queues that were never declared, like a
//! real broker does.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::ports::amqp::{
    AmqpChannel, AmqpConnection, AmqpConnector, AmqpError, BasicProperties, Delivery,
    QueueArguments, QueueInfo,
};

/// A ready message inside a queue.
///
/// Higher priority first, then lower sequence number (arrival order).
#[derive(Debug, Clone)]
struct Ready {
    priority: u8,
    seq: u64,
    body: Vec<u8>,
    properties: BasicProperties,
    enqueued_at: Instant,
}

impl PartialEq for Ready {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Ready {}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    arguments: QueueArguments,
    ready: BinaryHeap<Ready>,
}

impl QueueState {
    fn effective_priority(&self, properties: &BasicProperties) -> u8 {
        match self.arguments.max_priority {
            Some(max) => properties.priority.unwrap_or(0).min(max),
            None => 0,
        }
    }

    /// Drop messages older than `x-message-ttl`.
    fn expire(&mut self) {
        if let Some(ttl) = self.arguments.message_ttl {
            let ttl = Duration::from_millis(ttl);
            self.ready.retain(|message| message.enqueued_at.elapsed() < ttl);
        }
    }
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: Ready,
}

#[derive(Default)]
struct AmqpState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_seq: u64,
    next_id: u64,
    publish_failures: VecDeque<AmqpError>,
    refuse_connections: bool,
    connections: Vec<Arc<AtomicBool>>,
    connects: usize,
}

impl AmqpState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn route(&mut self, routing_key: &str, body: Vec<u8>, properties: BasicProperties) {
        self.next_seq += 1;
        let seq = self.next_seq;
        if let Some(queue) = self.queues.get_mut(routing_key) {
            let priority = queue.effective_priority(&properties);
            queue.ready.push(Ready {
                priority,
                seq,
                body,
                properties,
                enqueued_at: Instant::now(),
            });
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push(unacked.message);
        }
    }

    fn dead_letter(&mut self, unacked: Unacked) {
        let target = self.queues.get(&unacked.queue).and_then(|queue| {
            match (
                &queue.arguments.dead_letter_exchange,
                &queue.arguments.dead_letter_routing_key,
            ) {
                (Some(_), Some(routing_key)) => Some(routing_key.clone()),
                _ => None,
            }
        });
        if let Some(routing_key) = target {
            let message = unacked.message;
            self.route(&routing_key, message.body, message.properties);
        }
    }

    /// Return every unacked delivery of the matching channels to its queue.
    fn requeue_where(&mut self, matches: impl Fn(u64) -> bool) {
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| matches(unacked.channel_id))
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                self.requeue(unacked);
            }
        }
    }
}

/// In-process AMQP broker model.
///
/// Cloning is cheap; clones share the same broker state.
#[derive(Clone, Default)]
pub struct InMemoryAmqp {
    state: Arc<Mutex<AmqpState>>,
}

impl InMemoryAmqp {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, AmqpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ready messages in `queue` (unacked deliveries excluded).
    pub fn queue_len(&self, queue: &str) -> usize {
        let mut state = self.lock();
        state.queues.get_mut(queue).map_or(0, |q| {
            q.expire();
            q.ready.len()
        })
    }

    pub fn queue_arguments(&self, queue: &str) -> Option<QueueArguments> {
        self.lock().queues.get(queue).map(|q| q.arguments.clone())
    }

    /// Bodies of the ready messages in `queue`, in delivery order.
    pub fn queue_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.lock();
        let Some(q) = state.queues.get(queue) else {
            return Vec::new();
        };
        let mut ready = q.ready.clone().into_sorted_vec();
        ready.reverse();
        ready.into_iter().map(|message| message.body).collect()
    }

    /// Publish a raw body to `queue` through the default exchange.
    pub fn publish_raw(&self, queue: &str, body: Vec<u8>) {
        self.lock().route(queue, body, BasicProperties::persistent(None));
    }

    /// Make the next publishes fail with the given errors, in order.
    pub fn fail_next_publishes(&self, errors: impl IntoIterator<Item = AmqpError>) {
        self.lock().publish_failures.extend(errors);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.lock().refuse_connections = refuse;
    }

    /// Simulate a broker restart: every connection dies and unacked
    /// deliveries go back to their queues.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        for connection in state.connections.drain(..) {
            connection.store(false, Ordering::SeqCst);
        }
        state.requeue_where(|_| true);
    }

    /// Number of successful `connect` calls so far.
    pub fn connection_count(&self) -> usize {
        self.lock().connects
    }
}

#[async_trait]
impl AmqpConnector for InMemoryAmqp {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let mut state = self.lock();
        if state.refuse_connections {
            return Err(AmqpError::Connection("connection refused".to_string()));
        }
        let open = Arc::new(AtomicBool::new(true));
        state.connections.push(Arc::clone(&open));
        state.connects += 1;
        Ok(Arc::new(MemoryConnection {
            amqp: self.clone(),
            open,
            channel_ids: Mutex::new(Vec::new()),
        }))
    }
}

struct MemoryConnection {
    amqp: InMemoryAmqp,
    open: Arc<AtomicBool>,
    channel_ids: Mutex<Vec<u64>>,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if !self.is_open() {
            return Err(AmqpError::Connection("connection closed".to_string()));
        }
        let id = self.amqp.lock().allocate_id();
        self.channel_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
        Ok(Arc::new(MemoryChannel {
            id,
            amqp: self.amqp.clone(),
            connection_open: Arc::clone(&self.open),
            open: AtomicBool::new(true),
            consuming: Mutex::new(None),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        let ids = self
            .channel_ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        self.amqp.lock().requeue_where(|channel_id| ids.contains(&channel_id));
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    amqp: InMemoryAmqp,
    connection_open: Arc<AtomicBool>,
    open: AtomicBool,
    consuming: Mutex<Option<String>>,
    prefetch: AtomicU16,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if !self.connection_open.load(Ordering::SeqCst) {
            Err(AmqpError::Connection("connection closed".to_string()))
        } else if !self.open.load(Ordering::SeqCst) {
            Err(AmqpError::Channel("channel closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// A channel-level protocol error closes the channel.
    fn fail(&self, state: &mut AmqpState, reason: String) -> AmqpError {
        self.open.store(false, Ordering::SeqCst);
        let id = self.id;
        state.requeue_where(|channel_id| channel_id == id);
        AmqpError::Channel(reason)
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.ensure_open().is_ok()
    }

    async fn confirm_deliveries(&self) -> Result<(), AmqpError> {
        self.ensure_open()
    }

    async fn queue_declare(
        &self,
        queue: &str,
        _durable: bool,
        arguments: &QueueArguments,
    ) -> Result<QueueInfo, AmqpError> {
        self.ensure_open()?;
        let mut state = self.amqp.lock();
        let message_count = match state.queues.get_mut(queue) {
            Some(existing) if existing.arguments != *arguments => {
                let reason = format!("PRECONDITION_FAILED - inequivalent arg for queue '{queue}'");
                return Err(self.fail(&mut state, reason));
            }
            Some(existing) => {
                existing.expire();
                existing.ready.len()
            }
            None => {
                state.queues.insert(
                    queue.to_string(),
                    QueueState {
                        arguments: arguments.clone(),
                        ready: BinaryHeap::new(),
                    },
                );
                0
            }
        };
        Ok(QueueInfo {
            message_count: u32::try_from(message_count).unwrap_or(u32::MAX),
        })
    }

    async fn queue_purge(&self, queue: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.amqp.lock();
        match state.queues.get_mut(queue) {
            Some(q) => {
                q.ready.clear();
                Ok(())
            }
            None => {
                let reason = format!("NOT_FOUND - no queue '{queue}'");
                Err(self.fail(&mut state, reason))
            }
        }
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.amqp.lock();
        if let Some(err) = state.publish_failures.pop_front() {
            match &err {
                AmqpError::Connection(_) => self.connection_open.store(false, Ordering::SeqCst),
                AmqpError::Channel(_) => self.open.store(false, Ordering::SeqCst),
            }
            return Err(err);
        }
        if !exchange.is_empty() {
            let reason = format!("NOT_FOUND - no exchange '{exchange}'");
            return Err(self.fail(&mut state, reason));
        }
        state.route(routing_key, body.to_vec(), properties);
        Ok(())
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.ensure_open()?;
        self.prefetch.store(prefetch_count, Ordering::SeqCst);
        Ok(())
    }

    async fn basic_consume(&self, queue: &str) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.amqp.lock();
        if !state.queues.contains_key(queue) {
            let reason = format!("NOT_FOUND - no queue '{queue}'");
            return Err(self.fail(&mut state, reason));
        }
        *self.consuming.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue.to_string());
        Ok(())
    }

    async fn next_delivery(&self) -> Result<Option<Delivery>, AmqpError> {
        self.ensure_open()?;
        let Some(queue) = self
            .consuming
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return Err(AmqpError::Channel("channel is not consuming".to_string()));
        };

        let mut state = self.amqp.lock();
        let prefetch = usize::from(self.prefetch.load(Ordering::SeqCst));
        let in_flight = state
            .unacked
            .values()
            .filter(|unacked| unacked.channel_id == self.id)
            .count();
        if prefetch > 0 && in_flight >= prefetch {
            return Ok(None);
        }

        let Some(q) = state.queues.get_mut(&queue) else {
            return Ok(None);
        };
        q.expire();
        let Some(message) = q.ready.pop() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let delivery_tag = state.next_tag;
        let delivery = Delivery {
            delivery_tag,
            body: message.body.clone(),
            properties: message.properties,
        };
        state.unacked.insert(
            delivery_tag,
            Unacked {
                channel_id: self.id,
                queue,
                message,
            },
        );
        Ok(Some(delivery))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.amqp.lock();
        if state
            .unacked
            .get(&delivery_tag)
            .is_some_and(|unacked| unacked.channel_id == self.id)
        {
            state.unacked.remove(&delivery_tag);
        }
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.ensure_open()?;
        let mut state = self.amqp.lock();
        let owned = state
            .unacked
            .get(&delivery_tag)
            .is_some_and(|unacked| unacked.channel_id == self.id);
        if !owned {
            return Ok(());
        }
        if let Some(unacked) = state.unacked.remove(&delivery_tag) {
            if requeue {
                state.requeue(unacked);
            } else {
                state.dead_letter(unacked);
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.open.store(false, Ordering::SeqCst);
        let id = self.id;
        self.amqp.lock().requeue_where(|channel_id| channel_id == id);
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let id = self.id;
        self.amqp.lock().requeue_where(|channel_id| channel_id == id);
    }
}
