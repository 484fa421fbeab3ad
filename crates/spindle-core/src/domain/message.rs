//! Message model: the immutable unit that travels over the broker.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::{GroupId, MessageId};
use crate::error::SpindleError;

/// Membership of a message in a group: which group, where, and how big.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: GroupId,
    pub position: usize,
    pub size: usize,
}

/// The successor of a message: one message, or the members of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipeTarget {
    Message(Box<Message>),
    Group(Vec<Message>),
}

impl PipeTarget {
    pub fn messages(&self) -> Vec<&Message> {
        match self {
            PipeTarget::Message(message) => vec![message.as_ref()],
            PipeTarget::Group(messages) => messages.iter().collect(),
        }
    }

    pub fn into_messages(self) -> Vec<Message> {
        match self {
            PipeTarget::Message(message) => vec![*message],
            PipeTarget::Group(messages) => messages,
        }
    }

    pub fn as_message(&self) -> Option<&Message> {
        match self {
            PipeTarget::Message(message) => Some(message),
            PipeTarget::Group(_) => None,
        }
    }
}

/// Per-message options.
///
/// Known keys are typed; anything else is kept verbatim in `extra` so options
/// set by other producers survive a decode/encode cycle. `extra` is a
/// `BTreeMap` which keeps the encoded form independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageOptions {
    /// Number of retries already performed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_backoff: Option<u64>,

    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_backoff: Option<u64>,

    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age: Option<u64>,

    /// Milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,

    /// Absolute delivery time, epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_target: Option<PipeTarget>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipe_ignore: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupInfo>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A message addressed to an actor.
///
/// Messages are values: every `with_*` method returns a modified copy and
/// leaves the original untouched. The `message_id` is kept by all copies, so
/// retries and embedded pipe targets share the same result slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_id: MessageId,
    queue_name: String,
    actor_name: String,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    kwargs: Map<String, Value>,
    #[serde(default)]
    options: MessageOptions,
    /// Creation time, epoch milliseconds.
    message_timestamp: i64,
}

impl Message {
    pub fn new(
        queue_name: impl Into<String>,
        actor_name: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: MessageOptions,
    ) -> Self {
        Self {
            message_id: MessageId::generate(),
            queue_name: queue_name.into(),
            actor_name: actor_name.into(),
            args,
            kwargs,
            options,
            message_timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn actor_name(&self) -> &str {
        &self.actor_name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn options(&self) -> &MessageOptions {
        &self.options
    }

    pub fn message_timestamp(&self) -> i64 {
        self.message_timestamp
    }

    pub fn with_queue_name(&self, queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..self.clone()
        }
    }

    pub fn with_args(&self, args: Vec<Value>) -> Self {
        Self {
            args,
            ..self.clone()
        }
    }

    /// Copy with `value` appended to the positional args (pipe results).
    pub fn with_appended_arg(&self, value: Value) -> Self {
        let mut args = self.args.clone();
        args.push(value);
        self.with_args(args)
    }

    pub fn with_options(&self, update: impl FnOnce(&mut MessageOptions)) -> Self {
        let mut copy = self.clone();
        update(&mut copy.options);
        copy
    }

    pub fn with_message_timestamp(&self, message_timestamp: i64) -> Self {
        Self {
            message_timestamp,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, SpindleError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(body: &[u8]) -> Result<Self, SpindleError> {
        Ok(serde_json::from_slice(body)?)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self
            .args
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "{}({}) / {}", self.actor_name, args, self.message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(actor: &str) -> Message {
        Message::new(
            "default",
            actor,
            vec![json!(1), json!(2)],
            Map::new(),
            MessageOptions::default(),
        )
    }

    #[test]
    fn decode_is_the_inverse_of_encode() {
        let successor = message("mul").with_options(|o| o.pipe_ignore = Some(true));
        let group_member = message("add");
        let m = message("add").with_options(|o| {
            o.retries = Some(2);
            o.priority = Some(7);
            o.eta = Some(1_700_000_000_000);
            let fan_out = PipeTarget::Group(vec![group_member.clone()]);
            o.pipe_target = Some(PipeTarget::Message(Box::new(
                successor.with_options(|s| s.pipe_target = Some(fan_out)),
            )));
            o.group_info = Some(GroupInfo {
                group_id: GroupId::generate(),
                position: 1,
                size: 3,
            });
            o.extra.insert("trace".to_string(), json!({ "span": "abc" }));
        });

        let decoded = Message::decode(&m.encode().unwrap()).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn options_decode_independent_of_key_order() {
        let m = message("add");
        let mut value = serde_json::to_value(&m).unwrap();
        value["options"] = json!({ "zeta": 1, "max_retries": 3, "alpha": true });
        let reordered = json!({
            "options": { "alpha": true, "max_retries": 3, "zeta": 1 },
            "message_timestamp": value["message_timestamp"],
            "kwargs": {},
            "args": [1, 2],
            "actor_name": "add",
            "queue_name": "default",
            "message_id": value["message_id"],
        });

        let a: Message = serde_json::from_value(value).unwrap();
        let b: Message = serde_json::from_value(reordered).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.options().max_retries, Some(3));
        assert_eq!(a.options().extra.len(), 2);
        assert_eq!(a.encode().unwrap(), b.encode().unwrap());
    }

    #[test]
    fn with_methods_leave_the_original_untouched() {
        let m = message("add");
        let delayed = m.with_queue_name("default.DQ").with_options(|o| o.eta = Some(10));

        assert_eq!(m.queue_name(), "default");
        assert_eq!(m.options().eta, None);
        assert_eq!(delayed.queue_name(), "default.DQ");
        assert_eq!(delayed.message_id(), m.message_id());
    }

    #[test]
    fn appended_arg_goes_last() {
        let m = message("add").with_appended_arg(json!(3));
        assert_eq!(m.args(), &[json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn pipe_target_list_decodes_as_group() {
        let target = PipeTarget::Group(vec![message("a"), message("b")]);
        let encoded = serde_json::to_string(&target).unwrap();
        let decoded: PipeTarget = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.messages().len(), 2);
        assert!(decoded.as_message().is_none());
    }
}
