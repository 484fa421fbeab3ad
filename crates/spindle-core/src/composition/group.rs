//! Group - 並列に実行するメンバー集合

use crate::broker::Broker;
use crate::domain::{GroupId, GroupInfo, Message, MessageId, PipeTarget};
use crate::error::SpindleError;
use crate::results::CollectionResults;

use super::pipeline::{FanIn, PipelineStep, announce_fan_ins, link_message, link_steps};
use super::{Composable, Pipeline};

/// A group member: a single message or a pipeline that starts and ends with
/// a message.
#[derive(Debug, Clone)]
pub enum GroupMember {
    Message(Message),
    Pipeline(Pipeline),
}

#[derive(Debug, Clone)]
pub struct Group {
    group_id: GroupId,
    members: Vec<GroupMember>,
    /// Terminal message id of every member, in member order.
    message_ids: Vec<MessageId>,
}

impl Group {
    pub fn new(
        children: impl IntoIterator<Item = impl Into<Composable>>,
    ) -> Result<Self, SpindleError> {
        let mut members = Vec::new();
        let mut message_ids = Vec::new();
        for child in children {
            match child.into() {
                Composable::Message(message) => {
                    message_ids.push(message.message_id());
                    members.push(GroupMember::Message(message));
                }
                Composable::Pipeline(pipeline) => {
                    let (Some(PipelineStep::Message(_)), Some(PipelineStep::Message(last))) =
                        (pipeline.steps().first(), pipeline.steps().last())
                    else {
                        return Err(SpindleError::Configuration(
                            "pipelines inside a group must start and end with a message"
                                .to_string(),
                        ));
                    };
                    message_ids.push(last.message_id());
                    members.push(GroupMember::Pipeline(pipeline));
                }
                Composable::Group(_) => {
                    return Err(SpindleError::Configuration(
                        "groups cannot contain other groups".to_string(),
                    ));
                }
            }
        }
        if members.is_empty() {
            return Err(SpindleError::Configuration(
                "a group needs at least one member".to_string(),
            ));
        }
        Ok(Self {
            group_id: GroupId::generate(),
            members,
            message_ids,
        })
    }

    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn message_ids(&self) -> &[MessageId] {
        &self.message_ids
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// First message of every member, each terminal step stamped with its
    /// position in the group and pointing at `next`.
    pub(crate) fn link(
        &self,
        next: Option<PipeTarget>,
        fan_ins: &mut Vec<FanIn>,
    ) -> Result<Vec<Message>, SpindleError> {
        let size = self.members.len();
        let mut heads = Vec::with_capacity(size);
        for (position, member) in self.members.iter().enumerate() {
            let group_info = GroupInfo {
                group_id: self.group_id,
                position,
                size,
            };
            let head = match member {
                GroupMember::Message(message) => {
                    link_message(message, next.clone(), Some(group_info))
                }
                GroupMember::Pipeline(pipeline) => {
                    match link_steps(pipeline.steps(), next.clone(), Some(group_info), fan_ins)? {
                        Some(PipeTarget::Message(message)) => *message,
                        _ => {
                            return Err(SpindleError::Configuration(
                                "pipelines inside a group must start with a message".to_string(),
                            ));
                        }
                    }
                }
            };
            heads.push(head);
        }
        Ok(heads)
    }

    pub async fn build(&self, broker: &Broker) -> Result<Vec<Message>, SpindleError> {
        let mut fan_ins = Vec::new();
        let heads = self.link(None, &mut fan_ins)?;
        announce_fan_ins(broker, &fan_ins).await?;
        Ok(heads)
    }

    /// Enqueue the first message of every member.
    pub async fn run(&self, broker: &Broker) -> Result<(), SpindleError> {
        for message in self.build(broker).await? {
            broker.enqueue(&message).await?;
        }
        Ok(())
    }

    /// Outcomes of the members, in member order.
    pub fn results(&self, broker: &Broker) -> Result<CollectionResults, SpindleError> {
        Ok(CollectionResults::new(
            broker.require_result_backend()?,
            self.message_ids.clone(),
        ))
    }
}
