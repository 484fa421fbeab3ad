//! Pipeline - 順次実行のステップ列

use crate::broker::{Broker, ContextKey};
use crate::domain::{GroupId, GroupInfo, Message, MessageId, PipeTarget, PipelineId};
use crate::error::SpindleError;
use crate::middleware::HookContext;
use crate::results::{CollectionResults, MessageResult, ResultHandle};

use super::{Composable, Group};

/// One flattened step of a pipeline.
#[derive(Debug, Clone)]
pub enum PipelineStep {
    Message(Message),
    Group(Group),
}

/// A group followed by another step: its member ids must be recorded so the
/// last member to finish can collect every result.
#[derive(Debug)]
pub(crate) struct FanIn {
    pub(crate) group_id: GroupId,
    pub(crate) message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    pipeline_id: PipelineId,
    steps: Vec<PipelineStep>,
}

impl Pipeline {
    /// Nested pipelines are flattened into this one, in order.
    pub fn new(children: impl IntoIterator<Item = impl Into<Composable>>) -> Self {
        let mut steps = Vec::new();
        for child in children {
            match child.into() {
                Composable::Message(message) => steps.push(PipelineStep::Message(message)),
                Composable::Pipeline(pipeline) => steps.extend(pipeline.steps),
                Composable::Group(group) => steps.push(PipelineStep::Group(group)),
            }
        }
        Self {
            pipeline_id: PipelineId::generate(),
            steps,
        }
    }

    pub fn pipeline_id(&self) -> PipelineId {
        self.pipeline_id
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Ids of every step, group steps contributing their members.
    pub fn message_ids(&self) -> Vec<MessageId> {
        self.steps
            .iter()
            .flat_map(|step| match step {
                PipelineStep::Message(message) => vec![message.message_id()],
                PipelineStep::Group(group) => group.message_ids().to_vec(),
            })
            .collect()
    }

    /// Link the steps and return what has to be enqueued first.
    pub async fn build(&self, broker: &Broker) -> Result<PipeTarget, SpindleError> {
        let mut fan_ins = Vec::new();
        let target = link_steps(&self.steps, None, None, &mut fan_ins)?.ok_or_else(|| {
            SpindleError::Configuration("cannot build an empty pipeline".to_string())
        })?;
        announce_fan_ins(broker, &fan_ins).await?;
        Ok(target)
    }

    /// Enqueue the first step (every member of it, for a leading group).
    pub async fn run(&self, broker: &Broker) -> Result<(), SpindleError> {
        for message in self.build(broker).await?.into_messages() {
            broker.enqueue(&message).await?;
        }
        Ok(())
    }

    /// The outcome of the last step; a list for a trailing group.
    pub fn result(&self, broker: &Broker) -> Result<ResultHandle, SpindleError> {
        let backend = broker.require_result_backend()?;
        match self.steps.last() {
            Some(PipelineStep::Message(message)) => Ok(ResultHandle::Message(MessageResult::new(
                backend,
                message.message_id(),
            ))),
            Some(PipelineStep::Group(group)) => Ok(ResultHandle::Group(CollectionResults::new(
                backend,
                group.message_ids().to_vec(),
            ))),
            None => Err(SpindleError::Configuration(
                "an empty pipeline has no result".to_string(),
            )),
        }
    }

    /// The outcome of every step, in order.
    pub fn results(&self, broker: &Broker) -> Result<CollectionResults, SpindleError> {
        Ok(CollectionResults::new(
            broker.require_result_backend()?,
            self.message_ids(),
        ))
    }
}

/// Copy of `message` pointing at `next`.
///
/// Any successor or group membership the message carried before is replaced,
/// so an embedded copy never carries a stale chain.
pub(crate) fn link_message(
    message: &Message,
    next: Option<PipeTarget>,
    group_info: Option<GroupInfo>,
) -> Message {
    message.with_options(|options| {
        options.pipe_target = next;
        options.group_info = group_info;
    })
}

/// Walk `steps` backward, embedding each step into its predecessor.
///
/// `next` is what follows the last step, `group_info` the membership the
/// last step reports to.
pub(crate) fn link_steps(
    steps: &[PipelineStep],
    mut next: Option<PipeTarget>,
    mut group_info: Option<GroupInfo>,
    fan_ins: &mut Vec<FanIn>,
) -> Result<Option<PipeTarget>, SpindleError> {
    for step in steps.iter().rev() {
        let target = match step {
            PipelineStep::Message(message) => PipeTarget::Message(Box::new(link_message(
                message,
                next.take(),
                group_info.take(),
            ))),
            PipelineStep::Group(group) => {
                if next.is_some() {
                    fan_ins.push(FanIn {
                        group_id: group.group_id(),
                        message_ids: group.message_ids().to_vec(),
                    });
                }
                PipeTarget::Group(group.link(next.take(), fan_ins)?)
            }
        };
        next = Some(target);
    }
    Ok(next)
}

/// Fire `before_build_group_pipeline` for every fan-in.
pub(crate) async fn announce_fan_ins(
    broker: &Broker,
    fan_ins: &[FanIn],
) -> Result<(), SpindleError> {
    if fan_ins.is_empty() {
        return Ok(());
    }
    broker.require_result_backend()?;
    let ctx = HookContext {
        broker,
        context: &ContextKey::Client,
    };
    for fan_in in fan_ins {
        broker
            .middleware()
            .before_build_group_pipeline(&ctx, fan_in.group_id, &fan_in.message_ids)
            .await;
    }
    Ok(())
}
