//! spindle-core
//!
//! AMQP を背後に持つ分散タスク実行ランタイムの中核。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, actor, errors, outcome, retry, decision, state）
//! - **ports**: 抽象化レイヤー（AMQP クライアント, ResultBackend, Clock）
//! - **impls**: ports の実装（InMemoryAmqp, LocalBackend）
//! - **broker**: キュートポロジ・enqueue・consume・接続回復
//! - **runtime**: アクター登録と時間制限付き実行
//! - **middleware**: ライフサイクルフック（AgeLimit, Results, Pipelines）
//! - **composition**: Pipeline / Group
//! - **results**: 結果の読み出し（MessageResult, CollectionResults）
//! - **worker**: consumer と worker のタスクプール
//! - **app**: BrokerBuilder と設定
//!
//! ```ignore
//! let broker = Arc::new(
//!     Broker::builder(connector)
//!         .actor(add)?
//!         .results(Arc::new(LocalBackend::new()))?
//!         .build()?,
//! );
//! let worker = Worker::start(Arc::clone(&broker), WorkerConfig::default()).await?;
//! let message = broker.send("add", vec![json!(1), json!(2)]).await?;
//! let sum = broker.result(&message)?.get(GetOptions::blocking()).await?;
//! worker.stop().await;
//! ```

pub mod app;
pub mod broker;
pub mod composition;
pub mod domain;
pub mod error;
pub mod impls;
pub mod middleware;
pub mod observability;
pub mod ports;
pub mod results;
pub mod runtime;
pub mod worker;

pub use crate::app::{BrokerBuilder, BrokerConfig, SpindleConfig, WorkerConfig};
pub use crate::broker::{Broker, JoinOptions};
pub use crate::composition::{Group, Pipeline};
pub use crate::domain::{Actor, ActorError, Message, MessageId, handler_fn};
pub use crate::error::SpindleError;
pub use crate::observability::QueueCounts;
pub use crate::results::{CollectionResults, GetOptions, MessageResult, ResultHandle};
pub use crate::worker::Worker;
