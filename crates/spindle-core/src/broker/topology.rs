//! Queue topology: the three physical queues behind one logical queue.
//!
//! - `Q`: main queue
//! - `Q.DQ`: delay queue, holds messages with a future `eta`
//! - `Q.XQ`: dead-letter queue
//!
//! `Q` and `Q.DQ` dead-letter into `Q.XQ`. The retention of `Q.XQ` is a static
//! queue property because the broker expires messages head-first.

use crate::observability::QueueCounts;
use crate::ports::amqp::{AmqpChannel, AmqpError, QueueArguments};

pub const DELAY_QUEUE_SUFFIX: &str = ".DQ";
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".XQ";

/// 7 days.
pub const DEAD_MESSAGE_TTL_MS: u64 = 604_800_000;

pub fn delay_queue_name(queue_name: &str) -> String {
    format!("{queue_name}{DELAY_QUEUE_SUFFIX}")
}

pub fn dead_letter_queue_name(queue_name: &str) -> String {
    format!("{queue_name}{DEAD_LETTER_QUEUE_SUFFIX}")
}

pub fn is_delay_queue(queue_name: &str) -> bool {
    queue_name.ends_with(DELAY_QUEUE_SUFFIX)
}

/// `Q` for any of `Q`, `Q.DQ`, `Q.XQ`.
pub fn base_queue_name(queue_name: &str) -> &str {
    queue_name
        .strip_suffix(DELAY_QUEUE_SUFFIX)
        .or_else(|| queue_name.strip_suffix(DEAD_LETTER_QUEUE_SUFFIX))
        .unwrap_or(queue_name)
}

/// Arguments of `Q` and `Q.DQ`.
pub fn queue_arguments(queue_name: &str, max_priority: Option<u8>) -> QueueArguments {
    QueueArguments {
        dead_letter_exchange: Some(String::new()),
        dead_letter_routing_key: Some(dead_letter_queue_name(base_queue_name(queue_name))),
        max_priority,
        message_ttl: None,
    }
}

/// Arguments of `Q.XQ`.
pub fn dead_letter_arguments() -> QueueArguments {
    QueueArguments {
        message_ttl: Some(DEAD_MESSAGE_TTL_MS),
        ..QueueArguments::default()
    }
}

/// Declare (idempotently) the three queues of `queue_name` and report their
/// ready message counts.
pub async fn declare(
    channel: &dyn AmqpChannel,
    queue_name: &str,
    max_priority: Option<u8>,
) -> Result<QueueCounts, AmqpError> {
    let arguments = queue_arguments(queue_name, max_priority);
    let queued = channel.queue_declare(queue_name, true, &arguments).await?;
    let delayed = channel
        .queue_declare(&delay_queue_name(queue_name), true, &arguments)
        .await?;
    let dead = channel
        .queue_declare(&dead_letter_queue_name(queue_name), true, &dead_letter_arguments())
        .await?;
    Ok(QueueCounts {
        queued: queued.message_count,
        delayed: delayed.message_count,
        dead: dead.message_count,
    })
}
