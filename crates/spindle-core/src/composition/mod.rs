//! Composition - パイプラインとグループ
//!
//! - `Pipeline`: 順番に実行するステップ列（入れ子のパイプラインは構築時に平坦化）
//! - `Group`: 並列に実行するメンバー集合（グループの入れ子は不可）
//!
//! Steps are linked by embedding each successor as the `pipe_target` of its
//! predecessor. Only the first step is enqueued; every later step is enqueued
//! by the worker once its predecessor succeeded.
//!
//! ```ignore
//! let pipe = add.message(vec![json!(1), json!(2)]) | add.message(vec![json!(3)]);
//! pipe.run(&broker).await?;
//! let sum = pipe.result(&broker)?.get(GetOptions::blocking()).await?;
//! ```

pub mod group;
pub mod pipeline;

use std::ops::BitOr;

use crate::domain::Message;

pub use self::group::{Group, GroupMember};
pub use self::pipeline::{Pipeline, PipelineStep};

/// Anything that can take part in a composition.
#[derive(Debug, Clone)]
pub enum Composable {
    Message(Message),
    Pipeline(Pipeline),
    Group(Group),
}

impl From<Message> for Composable {
    fn from(message: Message) -> Self {
        Composable::Message(message)
    }
}

impl From<Pipeline> for Composable {
    fn from(pipeline: Pipeline) -> Self {
        Composable::Pipeline(pipeline)
    }
}

impl From<Group> for Composable {
    fn from(group: Group) -> Self {
        Composable::Group(group)
    }
}

impl<T: Into<Composable>> BitOr<T> for Message {
    type Output = Pipeline;

    fn bitor(self, rhs: T) -> Pipeline {
        Pipeline::new([Composable::from(self), rhs.into()])
    }
}

impl<T: Into<Composable>> BitOr<T> for Pipeline {
    type Output = Pipeline;

    fn bitor(self, rhs: T) -> Pipeline {
        Pipeline::new([Composable::from(self), rhs.into()])
    }
}

impl<T: Into<Composable>> BitOr<T> for Group {
    type Output = Pipeline;

    fn bitor(self, rhs: T) -> Pipeline {
        Pipeline::new([Composable::from(self), rhs.into()])
    }
}
