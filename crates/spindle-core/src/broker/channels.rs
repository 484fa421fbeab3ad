//! Channel pool: one channel per execution context.
//!
//! Channels are never shared between concurrent users.
//! - worker / consumer タスク: キーごとに 1 本を保持し、明示的に解放するまで使い回す
//! - client: 操作ごとに空きチャネルを借り、成功したら返却する
//!
//! Concurrent client operations therefore each hold their own channel, and
//! the number of client channels stays at the peak concurrency.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::ports::amqp::AmqpChannel;

/// Who owns a pooled channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextKey {
    /// Enqueues made outside of the worker. Leased per operation.
    Client,
    /// A worker task.
    Worker(usize),
    /// The consumer task of a physical queue.
    Consumer(String),
}

impl ContextKey {
    /// Client channels are leased; every other context owns its channel.
    pub fn is_leased(&self) -> bool {
        matches!(self, ContextKey::Client)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextKey::Client => f.write_str("client"),
            ContextKey::Worker(n) => write!(f, "worker-{n}"),
            ContextKey::Consumer(queue) => write!(f, "consumer-{queue}"),
        }
    }
}

#[derive(Default)]
struct PoolState {
    owned: HashMap<ContextKey, Arc<dyn AmqpChannel>>,
    idle: Vec<Arc<dyn AmqpChannel>>,
}

#[derive(Default)]
pub(crate) struct ChannelPool {
    state: Mutex<PoolState>,
}

impl ChannelPool {
    // ロックは await を跨がない
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An open channel for `key`: the owned one, or an idle client channel
    /// taken out of the pool. Closed entries are evicted.
    pub(crate) fn get(&self, key: &ContextKey) -> Option<Arc<dyn AmqpChannel>> {
        let mut state = self.lock();
        if key.is_leased() {
            while let Some(channel) = state.idle.pop() {
                if channel.is_open() {
                    return Some(channel);
                }
            }
            return None;
        }
        match state.owned.get(key) {
            Some(channel) if channel.is_open() => Some(Arc::clone(channel)),
            Some(_) => {
                state.owned.remove(key);
                None
            }
            None => None,
        }
    }

    /// Record a freshly opened channel for an owning context.
    ///
    /// When another open channel was recorded first, that one is kept and
    /// returned along with `channel` as the loser to close.
    pub(crate) fn insert(
        &self,
        key: ContextKey,
        channel: Arc<dyn AmqpChannel>,
    ) -> (Arc<dyn AmqpChannel>, Option<Arc<dyn AmqpChannel>>) {
        if key.is_leased() {
            return (channel, None);
        }
        let mut state = self.lock();
        match state.owned.get(&key) {
            Some(existing) if existing.is_open() => (Arc::clone(existing), Some(channel)),
            _ => {
                state.owned.insert(key, Arc::clone(&channel));
                (channel, None)
            }
        }
    }

    /// Hand a leased channel back after a successful operation.
    pub(crate) fn checkin(&self, key: &ContextKey, channel: Arc<dyn AmqpChannel>) {
        if key.is_leased() && channel.is_open() {
            self.lock().idle.push(channel);
        }
    }

    /// Take the channels of `key` out of the pool.
    pub(crate) fn remove(&self, key: &ContextKey) -> Vec<Arc<dyn AmqpChannel>> {
        let mut state = self.lock();
        if key.is_leased() {
            return std::mem::take(&mut state.idle);
        }
        state.owned.remove(key).into_iter().collect()
    }

    pub(crate) fn drain(&self) -> Vec<Arc<dyn AmqpChannel>> {
        let mut state = self.lock();
        let mut channels: Vec<_> = state.owned.drain().map(|(_, channel)| channel).collect();
        channels.append(&mut state.idle);
        channels
    }
}
