use std::{fmt, sync::Arc};

use bytes::BytesMut;
use spin::Mutex;
use tracing::debug;

use crate::{error::BufferError, handle::BufferHandle};

/// 单个缓冲允许的最大长度（字节）。
pub const MAX_BUFFER_LENGTH: usize = 150_000;

/// `BufferPool` 是一组预分配、定长缓冲的并发安全集合。
///
/// # 核心机制（How）
/// - 构造时一次性分配 `count` 块长度为 `length` 的存储，放入按下标寻址的槽位竞技场；
/// - 槽位为 `Some` 即“在池中”，为 `None` 即“已借出”；空闲下标以栈组织，
///   因而 `acquire` 的参考行为是 LIFO，但调用方不应依赖具体顺序；
/// - 借出与归还都在同一把 `spin::Mutex` 下完成“弹栈 + 取槽”或“回填槽 + 压栈”，
///   保证一个槽位不会同时处于两种状态。
///
/// # 契约说明（What）
/// - **线程安全**：`BufferPool` 可廉价克隆，并可在任意多个线程间共享；
/// - **容量**：`available() <= capacity()` 恒成立；耗尽时 `acquire` 返回
///   [`BufferError::Exhausted`]，不会阻塞也不会扩容；
/// - **去重**：同一句柄重复归还只会入池一次，第二次调用返回 `Ok(false)`；
/// - **拆除**：[`drain`](Self::drain) 之后池不可再用，迟到的归还会被直接丢弃。
///
/// # 设计权衡（Trade-offs）
/// - 归还时的清零在锁外执行，锁内只做下标与槽位的搬移，临界区长度与缓冲大小无关；
/// - 自旋锁适合本场景的极短临界区，但不适合在持锁期间做任何 I/O。
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    buffer_length: usize,
    capacity: usize,
    arena: Mutex<Arena>,
}

struct Arena {
    slots: Vec<Option<BytesMut>>,
    free: Vec<usize>,
    drained: bool,
}

impl BufferPool {
    /// 预分配 `count` 块长度为 `length` 的缓冲。
    ///
    /// - `count` 必须为正数，否则返回 [`BufferError::InvalidCount`]；
    /// - `length` 必须位于 `1..=MAX_BUFFER_LENGTH`，否则返回 [`BufferError::InvalidLength`]。
    pub fn new(count: usize, length: usize) -> Result<Self, BufferError> {
        if count == 0 {
            return Err(BufferError::InvalidCount { count });
        }
        if length == 0 || length > MAX_BUFFER_LENGTH {
            return Err(BufferError::InvalidLength {
                length,
                max: MAX_BUFFER_LENGTH,
            });
        }

        let slots = (0..count).map(|_| Some(BytesMut::zeroed(length))).collect();
        // 倒序压栈，使首次租借从下标 0 开始。
        let free = (0..count).rev().collect();
        debug!(count, length, "buffer pool preallocated");

        Ok(Self {
            shared: Arc::new(PoolShared {
                buffer_length: length,
                capacity: count,
                arena: Mutex::new(Arena {
                    slots,
                    free,
                    drained: false,
                }),
            }),
        })
    }

    /// 借出一块缓冲。
    ///
    /// 返回的句柄 `total_written` 与 `total_read` 均为 0；池中无可用缓冲时返回
    /// [`BufferError::Exhausted`]，已拆除时返回 [`BufferError::Drained`]。
    pub fn acquire(&self) -> Result<BufferHandle, BufferError> {
        let (index, storage) = {
            let mut guard = self.shared.arena.lock();
            let arena = &mut *guard;
            if arena.drained {
                return Err(BufferError::Drained);
            }
            let exhausted = BufferError::Exhausted {
                capacity: self.shared.capacity,
            };
            let index = arena.free.pop().ok_or_else(|| exhausted.clone())?;
            let storage = arena
                .slots
                .get_mut(index)
                .and_then(Option::take)
                .ok_or(exhausted)?;
            (index, storage)
        };
        Ok(BufferHandle::new(Arc::clone(&self.shared), index, storage))
    }

    /// 归还一块缓冲。
    ///
    /// # 契约（What）
    /// - 句柄必须来自当前池且长度一致，否则返回 [`BufferError::ForeignHandle`] /
    ///   [`BufferError::LengthMismatch`]；
    /// - `clear` 为真时在入池前将全部字节清零；
    /// - 返回 `Ok(true)` 表示本次调用让缓冲重新入池；返回 `Ok(false)` 表示无事发生：
    ///   句柄此前已归还，或池已拆除；
    /// - **后置条件**：无论返回何值，句柄都处于脱离状态，两个游标均已归零。
    pub fn release(&self, handle: &mut BufferHandle, clear: bool) -> Result<bool, BufferError> {
        if !handle.belongs_to(&self.shared) {
            return Err(BufferError::ForeignHandle);
        }
        if handle.buffer_length() != self.shared.buffer_length {
            return Err(BufferError::LengthMismatch {
                expected: self.shared.buffer_length,
                actual: handle.buffer_length(),
            });
        }
        let Some(mut storage) = handle.detach() else {
            debug!(index = handle.index(), "duplicate buffer release ignored");
            return Ok(false);
        };
        if clear {
            storage[..].fill(0);
        }
        Ok(self.shared.give_back(handle.index(), storage))
    }

    /// 拆除池：丢弃所有仍在池中的缓冲，并让池进入不可用状态。
    ///
    /// 返回本次丢弃的缓冲数量；重复调用返回 0。
    pub fn drain(&self) -> usize {
        let mut guard = self.shared.arena.lock();
        let arena = &mut *guard;
        if arena.drained {
            return 0;
        }
        arena.drained = true;
        arena.free.clear();
        let disposed = arena
            .slots
            .iter_mut()
            .filter_map(Option::take)
            .count();
        debug!(disposed, "buffer pool drained");
        disposed
    }

    /// 当前在池中的缓冲数量。
    pub fn available(&self) -> usize {
        self.shared.arena.lock().free.len()
    }

    /// 池容量，即构造时的 `count`。
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// 单个缓冲的长度。
    pub fn buffer_length(&self) -> usize {
        self.shared.buffer_length
    }

    /// 池是否已拆除。
    pub fn is_drained(&self) -> bool {
        self.shared.arena.lock().drained
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.shared.capacity)
            .field("buffer_length", &self.shared.buffer_length)
            .field("available", &self.available())
            .finish()
    }
}

impl PoolShared {
    /// 将存储放回对应槽位；槽位已被占用或池已拆除时丢弃存储并返回 `false`。
    pub(crate) fn give_back(&self, index: usize, storage: BytesMut) -> bool {
        let mut guard = self.arena.lock();
        let arena = &mut *guard;
        if arena.drained {
            return false;
        }
        match arena.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(storage);
                arena.free.push(index);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn buffer_length(&self) -> usize {
        self.buffer_length
    }
}
