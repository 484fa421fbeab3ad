//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（AMQP ブローカー、結果ストア、時計）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//! In-process implementations live in `impls`.

pub mod amqp;
pub mod clock;
pub mod result_backend;

pub use self::amqp::{
    AmqpChannel, AmqpConnection, AmqpConnector, AmqpError, BasicProperties, Delivery,
    QueueArguments, QueueInfo,
};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::result_backend::ResultBackend;
