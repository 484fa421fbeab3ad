//! AMQP port - ブローカーとの通信
//!
//! The wire client that actually talks AMQP 0-9-1 to a broker is an external
//! collaborator. The broker adapter only needs the handful of primitives
//! below: open a connection, open channels on it, declare/purge queues,
//! publish, and pull deliveries one at a time.
//!
//! # 設計原則
//! - connection は共有、channel は利用者（worker / consumer / client）ごと
//! - channel はスレッド間で共有しない
//! - エラーは connection レベルと channel レベルを区別する

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmqpError {
    /// The whole connection is unusable.
    #[error("connection error: {0}")]
    Connection(String),

    /// Only this channel is unusable; the connection may still be fine.
    #[error("channel error: {0}")]
    Channel(String),
}

impl AmqpError {
    pub fn is_connection_error(&self) -> bool {
        matches!(self, AmqpError::Connection(_))
    }
}

/// `x-*` arguments of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
    pub max_priority: Option<u8>,
    /// Milliseconds.
    pub message_ttl: Option<u64>,
}

impl QueueArguments {
    /// The argument table as it appears on the wire.
    pub fn to_table(&self) -> BTreeMap<&'static str, Value> {
        let mut table = BTreeMap::new();
        if let Some(exchange) = &self.dead_letter_exchange {
            table.insert("x-dead-letter-exchange", json!(exchange));
        }
        if let Some(routing_key) = &self.dead_letter_routing_key {
            table.insert("x-dead-letter-routing-key", json!(routing_key));
        }
        if let Some(max_priority) = self.max_priority {
            table.insert("x-max-priority", json!(max_priority));
        }
        if let Some(ttl) = self.message_ttl {
            table.insert("x-message-ttl", json!(ttl));
        }
        table
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicProperties {
    /// 2 = persistent.
    pub delivery_mode: u8,
    pub priority: Option<u8>,
}

impl BasicProperties {
    pub fn persistent(priority: Option<u8>) -> Self {
        Self {
            delivery_mode: 2,
            priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
}

/// Reply to a queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    /// Ready messages; unacked deliveries are not counted.
    pub message_count: u32,
}

#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    /// Closing a connection closes its channels; their unacked deliveries go
    /// back to their queues.
    async fn close(&self) -> Result<(), AmqpError>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Put the channel in publisher-confirm mode.
    async fn confirm_deliveries(&self) -> Result<(), AmqpError>;

    /// Idempotent for identical arguments.
    async fn queue_declare(
        &self,
        queue: &str,
        durable: bool,
        arguments: &QueueArguments,
    ) -> Result<QueueInfo, AmqpError>;

    async fn queue_purge(&self, queue: &str) -> Result<(), AmqpError>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// 0 means unlimited.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_consume(&self, queue: &str) -> Result<(), AmqpError>;

    /// Non-blocking: the next inbound delivery, or `None` when nothing is
    /// ready (or the prefetch window is full).
    async fn next_delivery(&self) -> Result<Option<Delivery>, AmqpError>;

    /// Unknown tags are ignored.
    async fn basic_ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Unknown tags are ignored. Without `requeue` the message is
    /// dead-lettered according to its queue's arguments.
    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}
