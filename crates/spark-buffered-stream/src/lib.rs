//! `spark-buffered-stream` 在 TCP 字节流之上提供长度前缀分帧的服务端与客户端。
//!
//! # 模块定位（Why）
//! - 面向大量长连接、消息大小可变且可能大于 I/O 缓冲的场景；
//! - 收发缓冲全部来自启动期预分配的 [`spark_buffer::BufferPool`]，数据面不做按消息的缓冲分配。
//!
//! # 结构（How）
//! - [`frame`]：线路格式编码与接收侧分帧状态机；
//! - `receive` / `send`：每条连接的接收管线（生产者/惰性消费者）与发送管线（串行化 + 分片）；
//! - [`Connection`]：把一个字节流与一对池化缓冲绑定，提供 `start_receiving` / `send` / `close`；
//! - [`IoResourcePool`]：按最大连接数预先装满的收/发缓冲对池；
//! - [`FramedListener`] / [`FramedClient`]：服务端 accept 循环与连接注册表、客户端连接器。
//!
//! # 线路格式（What）
//! `header_size` 字节（默认 4）的小端无符号整数表示载荷长度，紧跟对应长度的载荷。
//! 合法长度满足 `0 < len < maximum_message_size`；违反即为协议故障，连接被关闭。
//! 帧头宽度与长度上限只由配置决定，收发两端需在带外保持一致。
//!
//! # 可观测性
//! 库内通过 `tracing` 发出结构化事件（生命周期 `info`、帧级 `debug`、故障 `warn`），
//! 不安装任何 subscriber。

mod client;
mod config;
mod connection;
mod error;
mod event;
pub mod frame;
mod listener;
mod receive;
mod resource;
mod send;
mod statistics;

pub use client::FramedClient;
pub use config::{ClientConfig, ConnectionConfig, MAX_HEADER_SIZE, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{ErrorCategory, StreamError};
pub use event::{
    ConnectionFault, ConnectionObserver, ListenerFault, ListenerObserver, NoopObserver,
    SubscriptionId,
};
pub use frame::{FrameDecoder, encode_frame};
pub use listener::FramedListener;
pub use resource::{IoResourcePair, IoResourcePool, PairLease};
pub use statistics::{ServerStatistics, StatisticsSnapshot};
