use crate::error::StreamError;
use serde::Deserialize;
use spark_buffer::MAX_BUFFER_LENGTH;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

const DEFAULT_ENDPOINT: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1669);
const DEFAULT_PENDING_CONNECTIONS: u32 = 100;
const DEFAULT_MAXIMUM_CONNECTIONS: usize = 500;
const DEFAULT_MAXIMUM_MESSAGE_SIZE: usize = 1024 * 1024;
const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
const DEFAULT_HEADER_SIZE: usize = 4;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// 帧头允许的最大宽度（字节）。
pub const MAX_HEADER_SIZE: usize = 8;

/// 单条连接的数据面配置，由 [`ServerConfig`] 或 [`ClientConfig`] 派生。
///
/// # 契约 (What)
/// - `buffer_size`：收/发 I/O 缓冲长度，也是发送分片的上限；
/// - `header_size`：帧头宽度（小端无符号整数）；
/// - `maximum_message_size`：合法载荷长度的开区间上界，即 `0 < len < maximum_message_size`；
/// - `shutdown_timeout`：拆除时等待写半部关闭的异步上限，超时后直接释放套接字；
/// - 交给连接后不可变。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectionConfig {
    buffer_size: usize,
    header_size: usize,
    maximum_message_size: usize,
    shutdown_timeout: Duration,
}

impl ConnectionConfig {
    /// 以显式参数构造并立即校验。
    pub fn new(
        buffer_size: usize,
        header_size: usize,
        maximum_message_size: usize,
    ) -> Result<Self, StreamError> {
        let config = Self {
            buffer_size,
            header_size,
            maximum_message_size,
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn maximum_message_size(&self) -> usize {
        self.maximum_message_size
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// 校验缓冲长度、帧头宽度与消息上限之间的约束。
    pub fn validate(&self) -> Result<(), StreamError> {
        validate_frame_settings(self.buffer_size, self.header_size, self.maximum_message_size)
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            header_size: DEFAULT_HEADER_SIZE,
            maximum_message_size: DEFAULT_MAXIMUM_MESSAGE_SIZE,
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        }
    }
}

/// 服务端配置。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 集中描述监听器的全部可调参数，支持从 TOML 文档加载或以 `with_*` 链式构造；
/// - 未出现的字段取默认值：`127.0.0.1:1669`、挂起连接 100、最大连接 500、
///   消息上限 1 MiB、缓冲 16 KiB、帧头 4 字节、关闭超时 5000 毫秒。
///
/// ## 契约 (What)
/// - [`validate`](Self::validate) 通过后才能交给监听器；
/// - `maximum_pending_connections` 映射为监听 backlog；
/// - `shutdown_timeout_ms` 是拆除阶段的异步等待上限：单条连接关闭写半部、
///   以及 `stop_listener` / `dispose` 等待连接拆除，都不会超过这个时长；
/// - 不设置 `SO_LINGER`，关闭套接字永远不会阻塞运行时的工作线程。
///
/// ## 注意事项 (Trade-offs)
/// - 帧头宽度、缓冲长度与消息上限不在线路上协商，收发两端必须在带外保持一致。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    endpoint: SocketAddr,
    maximum_pending_connections: u32,
    maximum_connections: usize,
    maximum_message_size: usize,
    buffer_size: usize,
    header_size: usize,
    shutdown_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT,
            maximum_pending_connections: DEFAULT_PENDING_CONNECTIONS,
            maximum_connections: DEFAULT_MAXIMUM_CONNECTIONS,
            maximum_message_size: DEFAULT_MAXIMUM_MESSAGE_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            header_size: DEFAULT_HEADER_SIZE,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ServerConfig {
    /// 从 TOML 文档加载并校验。
    pub fn from_toml_str(document: &str) -> Result<Self, StreamError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_maximum_pending_connections(mut self, pending: u32) -> Self {
        self.maximum_pending_connections = pending;
        self
    }

    pub fn with_maximum_connections(mut self, connections: usize) -> Self {
        self.maximum_connections = connections;
        self
    }

    pub fn with_maximum_message_size(mut self, size: usize) -> Self {
        self.maximum_message_size = size;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_header_size(mut self, size: usize) -> Self {
        self.header_size = size;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn maximum_pending_connections(&self) -> u32 {
        self.maximum_pending_connections
    }

    pub fn maximum_connections(&self) -> usize {
        self.maximum_connections
    }

    pub fn maximum_message_size(&self) -> usize {
        self.maximum_message_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// 派生单条连接的配置。
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            buffer_size: self.buffer_size,
            header_size: self.header_size,
            maximum_message_size: self.maximum_message_size,
            shutdown_timeout: self.shutdown_timeout(),
        }
    }

    /// 监听器预分配的缓冲块数，即 `2 × maximum_connections`；溢出时为 `None`。
    pub(crate) fn buffer_count(&self) -> Option<usize> {
        self.maximum_connections.checked_mul(2)
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.maximum_pending_connections == 0 {
            return Err(invalid(
                "maximum_pending_connections",
                "must be positive".to_owned(),
            ));
        }
        if self.maximum_connections == 0 {
            return Err(invalid("maximum_connections", "must be positive".to_owned()));
        }
        // 每条连接占用收、发两块缓冲。
        if self.buffer_count().is_none() {
            return Err(invalid(
                "maximum_connections",
                format!("{} connections overflow the buffer count", self.maximum_connections),
            ));
        }
        validate_frame_settings(self.buffer_size, self.header_size, self.maximum_message_size)
    }
}

/// 客户端配置，字段含义与默认值同 [`ServerConfig`]。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    endpoint: SocketAddr,
    maximum_message_size: usize,
    buffer_size: usize,
    header_size: usize,
    shutdown_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT,
            maximum_message_size: DEFAULT_MAXIMUM_MESSAGE_SIZE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            header_size: DEFAULT_HEADER_SIZE,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(document: &str) -> Result<Self, StreamError> {
        let config: Self = toml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_maximum_message_size(mut self, size: usize) -> Self {
        self.maximum_message_size = size;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_header_size(mut self, size: usize) -> Self {
        self.header_size = size;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            buffer_size: self.buffer_size,
            header_size: self.header_size,
            maximum_message_size: self.maximum_message_size,
            shutdown_timeout: self.shutdown_timeout(),
        }
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        validate_frame_settings(self.buffer_size, self.header_size, self.maximum_message_size)
    }
}

/// 帧头宽度为 `header_size` 时可表示的最大载荷长度。
pub(crate) fn header_capacity(header_size: usize) -> u64 {
    if header_size >= MAX_HEADER_SIZE {
        u64::MAX
    } else {
        (1u64 << (8 * header_size)) - 1
    }
}

fn validate_frame_settings(
    buffer_size: usize,
    header_size: usize,
    maximum_message_size: usize,
) -> Result<(), StreamError> {
    if buffer_size == 0 || buffer_size > MAX_BUFFER_LENGTH {
        return Err(invalid(
            "buffer_size",
            format!("must be within 1..={MAX_BUFFER_LENGTH}, got {buffer_size}"),
        ));
    }
    if header_size == 0 || header_size > MAX_HEADER_SIZE {
        return Err(invalid(
            "header_size",
            format!("must be within 1..={MAX_HEADER_SIZE}, got {header_size}"),
        ));
    }
    if maximum_message_size <= 1 {
        return Err(invalid(
            "maximum_message_size",
            format!("must be greater than 1, got {maximum_message_size}"),
        ));
    }
    // 最大合法载荷为 maximum_message_size - 1，必须能写进帧头。
    if (maximum_message_size - 1) as u64 > header_capacity(header_size) {
        return Err(invalid(
            "maximum_message_size",
            format!("{maximum_message_size} cannot be represented in a {header_size}-byte header"),
        ));
    }
    Ok(())
}

fn invalid(field: &'static str, detail: String) -> StreamError {
    StreamError::InvalidConfig { field, detail }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ServerConfig::default();
        assert_eq!(config.endpoint(), "127.0.0.1:1669".parse().expect("parse addr"));
        assert_eq!(config.maximum_pending_connections(), 100);
        assert_eq!(config.maximum_connections(), 500);
        assert_eq!(config.maximum_message_size(), 1024 * 1024);
        assert_eq!(config.buffer_size(), 16 * 1024);
        assert_eq!(config.header_size(), 4);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(5));
        config.validate().expect("default config is valid");
        ClientConfig::default().validate().expect("default client config is valid");
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let config = ServerConfig::from_toml_str(
            r#"
            endpoint = "0.0.0.0:9000"
            maximum_connections = 8
            header_size = 2
            maximum_message_size = 60000
            "#,
        )
        .expect("parse toml");
        assert_eq!(config.endpoint().port(), 9000);
        assert_eq!(config.maximum_connections(), 8);
        assert_eq!(config.header_size(), 2);
        assert_eq!(config.buffer_size(), 16 * 1024);
    }

    #[test]
    fn malformed_or_unknown_fields_are_rejected() {
        let err = ServerConfig::from_toml_str("logs_path = \"./logs\"").unwrap_err();
        assert_eq!(err.code(), "spark.stream.config.malformed");
        assert!(ClientConfig::from_toml_str("buffer_size = \"big\"").is_err());
    }

    #[test]
    fn validation_rules() {
        let base = ServerConfig::default();
        assert!(base.clone().with_buffer_size(0).validate().is_err());
        assert!(base.clone().with_buffer_size(150_001).validate().is_err());
        assert!(base.clone().with_header_size(9).validate().is_err());
        assert!(base.clone().with_maximum_message_size(1).validate().is_err());
        assert!(base.clone().with_maximum_connections(0).validate().is_err());
        assert!(base.clone().with_maximum_pending_connections(0).validate().is_err());
        // 单字节帧头最多表示 255 字节载荷。
        let narrow = base.clone().with_header_size(1);
        assert!(narrow.clone().with_maximum_message_size(256).validate().is_ok());
        assert!(narrow.with_maximum_message_size(257).validate().is_err());
    }

    #[test]
    fn shutdown_timeout_flows_into_connection_config() {
        let config = ClientConfig::default().with_shutdown_timeout(Duration::from_millis(250));
        assert_eq!(
            config.connection_config().shutdown_timeout(),
            Duration::from_millis(250)
        );
        assert_eq!(
            ServerConfig::default().connection_config().shutdown_timeout(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn connection_count_that_overflows_buffer_count_is_rejected() {
        let err = ServerConfig::default()
            .with_maximum_connections(usize::MAX / 2 + 1)
            .validate()
            .unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidConfig {
                field: "maximum_connections",
                ..
            }
        ));
    }
}
