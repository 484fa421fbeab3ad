//! Impls - ports の実装（開発用・テスト用）
//!
//! # 含まれる実装
//! - **InMemoryAmqp**: AMQP 0-9-1 のプロセス内モデル（`AmqpConnector`）
//! - **LocalBackend**: プロセス内の結果ストア（`ResultBackend`）
//!
//! Production wire clients and result stores live outside this crate and
//! plug in through the same traits.

pub mod local_backend;
pub mod memory_amqp;

pub use self::local_backend::LocalBackend;
pub use self::memory_amqp::InMemoryAmqp;
