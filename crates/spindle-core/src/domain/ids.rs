//! Domain identifiers (strongly-typed IDs).
//!
//! ULID ベースの ID を Phantom type パターンで型ごとに分けています。
//! - 時刻でソート可能（生成順）
//! - 調整なしで複数プロセスから生成できる
//! - `MessageId` と `GroupId` は混同できない
//!
//! The wire form of every id is the bare ULID string; the prefix only shows up
//! in `Display` so log lines stay readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "msg-", "group-"）
    fn prefix() -> &'static str;
}

/// ジェネリック ID 型
///
/// `T` is only a compile-time marker; the id is a 16 byte ULID at runtime.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self::from_ulid(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageMarker {}

impl IdMarker for MessageMarker {
    fn prefix() -> &'static str {
        "msg-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupMarker {}

impl IdMarker for GroupMarker {
    fn prefix() -> &'static str {
        "group-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineMarker {}

impl IdMarker for PipelineMarker {
    fn prefix() -> &'static str {
        "pipeline-"
    }
}

/// Identifier of a single message; stable across retries and pipe copies.
pub type MessageId = Id<MessageMarker>;

/// Identifier of a group of parallel messages.
pub type GroupId = Id<GroupMarker>;

/// Identifier of a pipeline.
pub type PipelineId = Id<PipelineMarker>;
