//! Consumer - 1 つの物理キューからメッセージを取り出す
//!
//! A consumer owns a dedicated channel with a prefetch window. `next` polls
//! the channel with a short sleep between empty polls, bounded by an idle
//! timeout.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::Message;
use crate::error::SpindleError;
use crate::ports::amqp::AmqpChannel;

static NEXT_CONSUMER_ID: AtomicU64 = AtomicU64::new(1);

/// A consumed message together with its broker delivery handle.
///
/// Middleware can `fail` a proxy; a failed message is nacked instead of acked
/// and its pipeline stops.
#[derive(Debug)]
pub struct MessageProxy {
    message: Message,
    delivery_tag: u64,
    consumer_id: u64,
    failed: AtomicBool,
}

impl MessageProxy {
    pub(crate) fn new(message: Message, delivery_tag: u64, consumer_id: u64) -> Self {
        Self {
            message,
            delivery_tag,
            consumer_id,
            failed: AtomicBool::new(false),
        }
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer_id
    }

    /// Mark the message as terminally failed.
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }

    pub fn failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }
}

impl fmt::Display for MessageProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.message.fmt(f)
    }
}

pub struct Consumer {
    id: u64,
    queue_name: String,
    channel: Arc<dyn AmqpChannel>,
    timeout: Duration,
    poll_interval: Duration,
}

impl Consumer {
    /// `channel` must already be consuming `queue_name`.
    pub(crate) fn new(
        channel: Arc<dyn AmqpChannel>,
        queue_name: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id: NEXT_CONSUMER_ID.fetch_add(1, Ordering::Relaxed),
            queue_name: queue_name.to_string(),
            channel,
            timeout,
            poll_interval,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The next message, or `None` once the idle timeout elapses.
    ///
    /// Bodies that do not decode are dead-lettered on the spot.
    pub async fn next(&self) -> Result<Option<MessageProxy>, SpindleError> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(delivery) = self.channel.next_delivery().await? {
                match Message::decode(&delivery.body) {
                    Ok(message) => {
                        return Ok(Some(MessageProxy::new(message, delivery.delivery_tag, self.id)));
                    }
                    Err(err) => {
                        warn!(
                            queue = %self.queue_name,
                            error = %err,
                            "Dropping undecodable message."
                        );
                        self.channel.basic_nack(delivery.delivery_tag, false).await?;
                        continue;
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub async fn ack(&self, proxy: &MessageProxy) -> Result<(), SpindleError> {
        if proxy.consumer_id() != self.id {
            debug!(
                message_id = %proxy.message().message_id(),
                "Ignoring ack of a foreign message."
            );
            return Ok(());
        }
        self.channel.basic_ack(proxy.delivery_tag()).await?;
        Ok(())
    }

    /// Reject without requeue: the broker routes the message to `Q.XQ`.
    pub async fn nack(&self, proxy: &MessageProxy) -> Result<(), SpindleError> {
        if proxy.consumer_id() != self.id {
            debug!(
                message_id = %proxy.message().message_id(),
                "Ignoring nack of a foreign message."
            );
            return Ok(());
        }
        self.channel.basic_nack(proxy.delivery_tag(), false).await?;
        Ok(())
    }

    /// Close the channel. Unacked deliveries go back to the queue.
    pub async fn close(&self) -> Result<(), SpindleError> {
        self.channel.close().await?;
        Ok(())
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.id)
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}
