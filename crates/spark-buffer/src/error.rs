use thiserror::Error;

/// 缓冲池与缓冲句柄的错误域。
///
/// # 契约（What）
/// - 构造期参数错误（`InvalidCount` / `InvalidLength`）在 [`BufferPool::new`](crate::BufferPool::new)
///   中立即返回，池不会被部分构造；
/// - `Exhausted` 表示池中暂无可用缓冲，属于背压信号而非致命错误；
/// - `Drained` 表示池已被 [`drain`](crate::BufferPool::drain) 拆除，后续租借一律失败；
/// - 其余变体描述对句柄的误用，调用方应修正调用路径而非重试。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BufferError {
    /// 缓冲数量必须为正数。
    #[error("buffer count must be positive, got {count}")]
    InvalidCount { count: usize },

    /// 单个缓冲长度必须位于 `1..=max`。
    #[error("buffer length must be within 1..={max}, got {length}")]
    InvalidLength { length: usize, max: usize },

    /// 池中没有可借出的缓冲。
    #[error("buffer pool exhausted: all {capacity} buffers are checked out")]
    Exhausted { capacity: usize },

    /// 池已拆除。
    #[error("buffer pool has been drained")]
    Drained,

    /// 归还的句柄长度与池配置不一致。
    #[error("buffer length {actual} does not match pool buffer length {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    /// 归还的句柄不属于当前池。
    #[error("buffer handle belongs to a different pool")]
    ForeignHandle,

    /// 句柄已归还，不再持有任何存储。
    #[error("buffer handle has already been released")]
    Detached,

    /// 读写游标越过缓冲边界。
    #[error("{operation} of {requested} bytes at offset {offset} exceeds limit {limit}")]
    OutOfBounds {
        operation: &'static str,
        offset: usize,
        requested: usize,
        limit: usize,
    },
}

impl BufferError {
    /// 返回稳定错误码，供上层日志与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            BufferError::InvalidCount { .. } => "spark.buffer.invalid_count",
            BufferError::InvalidLength { .. } => "spark.buffer.invalid_length",
            BufferError::Exhausted { .. } => "spark.buffer.exhausted",
            BufferError::Drained => "spark.buffer.drained",
            BufferError::LengthMismatch { .. } => "spark.buffer.length_mismatch",
            BufferError::ForeignHandle => "spark.buffer.foreign_handle",
            BufferError::Detached => "spark.buffer.detached",
            BufferError::OutOfBounds { .. } => "spark.buffer.out_of_bounds",
        }
    }

    /// 是否为容量类错误（池耗尽）。
    pub fn is_exhausted(&self) -> bool {
        matches!(self, BufferError::Exhausted { .. })
    }
}
