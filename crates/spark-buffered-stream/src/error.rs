use spark_buffer::BufferError;
use std::{io, sync::Arc};
use thiserror::Error;

/// 错误的粗粒度分类，供调用方决定“修正调用 / 关闭连接 / 降载”。
///
/// - `Usage`：配置非法、重复初始化、对已拆除对象的操作，应修正调用路径；
/// - `Protocol`：对端声明了非法帧长，连接必然被关闭；
/// - `Io`：套接字读写、接受、绑定失败；
/// - `Exhausted`：缓冲池或 I/O 资源池耗尽，属于背压信号。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ErrorCategory {
    Usage,
    Protocol,
    Io,
    Exhausted,
}

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.stream.tcp.bind_failed",
    message: "tcp bind",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: "spark.stream.tcp.listen_failed",
    message: "tcp listen",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.stream.tcp.accept_failed",
    message: "tcp accept",
};
pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "spark.stream.tcp.connect_failed",
    message: "tcp connect",
};
pub(crate) const READ: OperationKind = OperationKind {
    code: "spark.stream.tcp.read_failed",
    message: "tcp read",
};
pub(crate) const WRITE: OperationKind = OperationKind {
    code: "spark.stream.tcp.write_failed",
    message: "tcp write",
};
pub(crate) const CONFIGURE: OperationKind = OperationKind {
    code: "spark.stream.tcp.configure_failed",
    message: "tcp configure",
};
pub(crate) const SHUTDOWN: OperationKind = OperationKind {
    code: "spark.stream.tcp.shutdown_failed",
    message: "tcp shutdown",
};

/// `spark-buffered-stream` 的统一错误域。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将配置、协议、I/O、容量四类故障收敛到一个枚举，调用方只需匹配一次即可决定处置策略；
/// - 每个变体都映射到稳定错误码 [`code`](Self::code)，日志与告警可以按码聚合，
///   而不依赖易变的人类可读文案。
///
/// ## 契约 (What)
/// - `Io` 变体以 `Arc` 共享原始 [`io::Error`] 作为 `source`，并标注失败的操作（accept/read/write…），
///   因而整个错误可以克隆后同时交给返回值与故障通知；
/// - `Buffer` 变体透传 [`BufferError`]，池耗尽仍归类为 [`ErrorCategory::Exhausted`]；
/// - 所有变体都实现 `std::error::Error`，可直接用 `?` 向上传播。
#[derive(Clone, Debug, Error)]
pub enum StreamError {
    /// 配置字段非法。
    #[error("invalid configuration `{field}`: {detail}")]
    InvalidConfig { field: &'static str, detail: String },

    /// TOML 配置文档无法解析。
    #[error("malformed configuration document: {0}")]
    ConfigDocument(#[from] toml::de::Error),

    /// 监听器已初始化，需先拆除才能再次初始化。
    #[error("listener is already initialized")]
    AlreadyInitialized,

    /// 监听器尚未初始化。
    #[error("listener is not initialized")]
    NotInitialized,

    /// 监听器已处于监听状态。
    #[error("listener is already listening")]
    AlreadyListening,

    /// 监听器未处于监听状态。
    #[error("listener is not listening")]
    NotListening,

    /// 接受循环已在运行。
    #[error("accept loop is already running")]
    AlreadyAccepting,

    /// 连接已关闭或正在关闭。
    #[error("connection is closed")]
    ConnectionClosed,

    /// 当前线程不在 Tokio 运行时中。
    #[error("no tokio runtime is available on the current thread")]
    RuntimeUnavailable,

    /// 待发送的消息长度不在 `(0, maximum)` 区间内，或无法用帧头宽度表示。
    #[error("message of {length} bytes is outside the accepted range (0, {maximum})")]
    InvalidMessage { length: usize, maximum: u64 },

    /// 对端声明的帧长非法。
    #[error("peer declared frame length {declared}, accepted range is (0, {maximum})")]
    Protocol { declared: u64, maximum: usize },

    /// 底层套接字操作失败。
    #[error("{operation}: {source}")]
    Io {
        operation: &'static str,
        code: &'static str,
        #[source]
        source: Arc<io::Error>,
    },

    /// 资源池耗尽。
    #[error("{resource} exhausted")]
    Exhausted { resource: &'static str },

    /// 缓冲池错误。
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl StreamError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            StreamError::InvalidConfig { .. } => "spark.stream.config.invalid",
            StreamError::ConfigDocument(_) => "spark.stream.config.malformed",
            StreamError::AlreadyInitialized => "spark.stream.listener.already_initialized",
            StreamError::NotInitialized => "spark.stream.listener.not_initialized",
            StreamError::AlreadyListening => "spark.stream.listener.already_listening",
            StreamError::NotListening => "spark.stream.listener.not_listening",
            StreamError::AlreadyAccepting => "spark.stream.listener.already_accepting",
            StreamError::ConnectionClosed => "spark.stream.connection.closed",
            StreamError::RuntimeUnavailable => "spark.stream.runtime.unavailable",
            StreamError::InvalidMessage { .. } => "spark.stream.send.invalid_message",
            StreamError::Protocol { .. } => "spark.stream.protocol.invalid_length",
            StreamError::Io { code, .. } => *code,
            StreamError::Exhausted { .. } => "spark.stream.resource.exhausted",
            StreamError::Buffer(err) => err.code(),
        }
    }

    /// 返回错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            StreamError::Protocol { .. } => ErrorCategory::Protocol,
            StreamError::Io { .. } => ErrorCategory::Io,
            StreamError::Exhausted { .. } => ErrorCategory::Exhausted,
            StreamError::Buffer(err) if err.is_exhausted() => ErrorCategory::Exhausted,
            _ => ErrorCategory::Usage,
        }
    }

    /// 底层 I/O 错误（若有）。
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            StreamError::Io { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// 将 IO 错误映射为带操作语义的 [`StreamError`]。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> StreamError {
    StreamError::Io {
        operation: kind.message,
        code: kind.code,
        source: Arc::new(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_keep_operation_code() {
        let err = map_io_error(READ, io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(err.code(), "spark.stream.tcp.read_failed");
        assert_eq!(err.category(), ErrorCategory::Io);
        assert!(err.to_string().starts_with("tcp read"));
        assert_eq!(
            err.io_error().map(io::Error::kind),
            Some(io::ErrorKind::ConnectionReset)
        );
    }

    #[test]
    fn buffer_exhaustion_stays_exhausted() {
        let err = StreamError::from(BufferError::Exhausted { capacity: 4 });
        assert_eq!(err.category(), ErrorCategory::Exhausted);
        assert_eq!(err.code(), "spark.buffer.exhausted");
        let err = StreamError::from(BufferError::Detached);
        assert_eq!(err.category(), ErrorCategory::Usage);
    }
}
