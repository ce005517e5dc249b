use std::{fmt, sync::Arc};

use bytes::BytesMut;

use crate::{error::BufferError, pool::PoolShared};

/// 从 [`BufferPool`](crate::BufferPool) 借出的一块定长缓冲。
///
/// # 契约说明（What）
/// - `total_written`：已写入的累计字节数，始终 `<= buffer_length()`；
/// - `total_read`：已读出的累计字节数，始终 `<= total_written`；
/// - 句柄归还后进入“已脱离”状态：读写接口返回 [`BufferError::Detached`]，游标归零；
/// - 借出期间被丢弃的句柄会在 `Drop` 中自动回到所属池（不清零）。
///
/// # 风险提示（Trade-offs）
/// - 句柄只允许单一所有者读写；跨任务共享需由上层自行加锁。
pub struct BufferHandle {
    pool: Arc<PoolShared>,
    index: usize,
    length: usize,
    storage: Option<BytesMut>,
    total_written: usize,
    total_read: usize,
}

impl BufferHandle {
    pub(crate) fn new(pool: Arc<PoolShared>, index: usize, storage: BytesMut) -> Self {
        let length = pool.buffer_length();
        Self {
            pool,
            index,
            length,
            storage: Some(storage),
            total_written: 0,
            total_read: 0,
        }
    }

    /// 缓冲在池中的槽位下标。
    pub fn index(&self) -> usize {
        self.index
    }

    /// 缓冲长度（字节）。
    pub fn buffer_length(&self) -> usize {
        self.length
    }

    pub fn total_written(&self) -> usize {
        self.total_written
    }

    pub fn total_read(&self) -> usize {
        self.total_read
    }

    /// 尚未读出的已写入字节数。
    pub fn unread(&self) -> usize {
        self.total_written - self.total_read
    }

    /// 句柄是否已归还。
    pub fn is_detached(&self) -> bool {
        self.storage.is_none()
    }

    /// 以只读切片访问整块存储。
    pub fn as_slice(&self) -> Result<&[u8], BufferError> {
        self.storage.as_deref().ok_or(BufferError::Detached)
    }

    /// 以可写切片访问整块存储；写入后需调用 [`commit`](Self::commit) 推进游标。
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8], BufferError> {
        self.storage.as_deref_mut().ok_or(BufferError::Detached)
    }

    /// 已写入部分，即 `[0, total_written)`。
    pub fn filled(&self) -> Result<&[u8], BufferError> {
        let storage = self.as_slice()?;
        Ok(&storage[..self.total_written])
    }

    /// 在 `total_written` 处追加 `src`。
    ///
    /// 越过缓冲长度时返回 [`BufferError::OutOfBounds`]，缓冲内容与游标保持不变。
    pub fn fill_from(&mut self, src: &[u8]) -> Result<(), BufferError> {
        let offset = self.total_written;
        let end = self.bounded_end("fill", offset, src.len(), self.length)?;
        let storage = self.as_mut_slice()?;
        storage[offset..end].copy_from_slice(src);
        self.total_written = end;
        Ok(())
    }

    /// 声明已通过 [`as_mut_slice`](Self::as_mut_slice) 在 `total_written` 之后写入了 `written` 字节。
    pub fn commit(&mut self, written: usize) -> Result<(), BufferError> {
        if self.is_detached() {
            return Err(BufferError::Detached);
        }
        self.total_written = self.bounded_end("commit", self.total_written, written, self.length)?;
        Ok(())
    }

    /// 从 `total_read` 处读出恰好 `dst.len()` 字节。
    ///
    /// 可读字节不足时返回 [`BufferError::OutOfBounds`]，游标保持不变。
    pub fn copy_into(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        let offset = self.total_read;
        let end = self.bounded_end("copy", offset, dst.len(), self.total_written)?;
        let storage = self.as_slice()?;
        dst.copy_from_slice(&storage[offset..end]);
        self.total_read = end;
        Ok(())
    }

    /// 将两个游标归零，不修改缓冲内容。
    pub fn reset(&mut self) {
        self.total_written = 0;
        self.total_read = 0;
    }

    pub(crate) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        Arc::ptr_eq(&self.pool, pool)
    }

    /// 取走存储并归零游标，之后句柄处于脱离状态。
    pub(crate) fn detach(&mut self) -> Option<BytesMut> {
        self.reset();
        self.storage.take()
    }

    fn bounded_end(
        &self,
        operation: &'static str,
        offset: usize,
        requested: usize,
        limit: usize,
    ) -> Result<usize, BufferError> {
        offset
            .checked_add(requested)
            .filter(|end| *end <= limit)
            .ok_or(BufferError::OutOfBounds {
                operation,
                offset,
                requested,
                limit,
            })
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(storage) = self.storage.take() {
            self.pool.give_back(self.index, storage);
        }
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHandle")
            .field("index", &self.index)
            .field("length", &self.length)
            .field("total_written", &self.total_written)
            .field("total_read", &self.total_read)
            .field("detached", &self.is_detached())
            .finish()
    }
}
