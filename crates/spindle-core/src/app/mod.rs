//! App - アプリケーション層
//!
//! # 主要コンポーネント
//! - **BrokerBuilder**: ブローカーの構築とワイヤリング（起動時検証）
//! - **Config**: TOML から読み込む設定（`BrokerConfig`, `WorkerConfig`）

pub mod builder;
pub mod config;

pub use self::builder::BrokerBuilder;
pub use self::config::{BrokerConfig, ResultsConfig, RetriesConfig, SpindleConfig, WorkerConfig};
