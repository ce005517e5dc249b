use crate::error::StreamError;
use parking_lot::Mutex;
use spark_buffer::{BufferHandle, BufferPool};
use std::{fmt, sync::Arc};
use tracing::{debug, warn};

/// 一条连接占用的收/发缓冲对。
#[derive(Debug)]
pub struct IoResourcePair {
    pub(crate) receive: BufferHandle,
    pub(crate) send: BufferHandle,
}

impl IoResourcePair {
    fn reset(&mut self) {
        self.receive.reset();
        self.send.reset();
    }
}

/// 预先装满的 I/O 资源对池，容量等于最大连接数。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让连接在生命周期之间复用收/发缓冲，避免每次 accept 都向缓冲池单独租借两次；
/// - 容量固定：耗尽时 [`acquire`](Self::acquire) 立即失败，由监听器拒绝本次 accept，
///   监听器本身继续运行。
///
/// ## 逻辑 (How)
/// - [`from_buffer_pool`](Self::from_buffer_pool) 从一个 [`BufferPool`] 中租借
///   `2 × capacity` 块缓冲并两两配对；
/// - [`acquire`](Self::acquire) 返回 [`PairLease`]，租约 `Drop` 时把资源对放回池中，
///   与缓冲句柄的自动归还保持同一模式。
///
/// ## 契约 (What)
/// - `available() <= capacity()` 恒成立；多余或迟到的归还会被丢弃；
/// - [`drain`](Self::drain) 之后池不可再用，迟到的租约归还直接释放缓冲。
#[derive(Clone)]
pub struct IoResourcePool {
    shared: Arc<ResourceShared>,
}

struct ResourceShared {
    capacity: usize,
    state: Mutex<ResourceState>,
}

struct ResourceState {
    pairs: Vec<IoResourcePair>,
    drained: bool,
}

impl IoResourcePool {
    /// 从 `buffers` 中租借 `2 × capacity` 块缓冲组成 `capacity` 个资源对。
    pub fn from_buffer_pool(buffers: &BufferPool, capacity: usize) -> Result<Self, StreamError> {
        if capacity == 0 {
            return Err(StreamError::InvalidConfig {
                field: "maximum_connections",
                detail: "resource pool capacity must be positive".to_owned(),
            });
        }
        let mut pairs = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            pairs.push(IoResourcePair {
                receive: buffers.acquire()?,
                send: buffers.acquire()?,
            });
        }
        debug!(capacity, "io resource pool filled");
        Ok(Self {
            shared: Arc::new(ResourceShared {
                capacity,
                state: Mutex::new(ResourceState {
                    pairs,
                    drained: false,
                }),
            }),
        })
    }

    /// 取出一个资源对；池空时返回 [`StreamError::Exhausted`]。
    pub fn acquire(&self) -> Result<PairLease, StreamError> {
        let mut state = self.shared.state.lock();
        if state.drained {
            return Err(StreamError::Exhausted {
                resource: "io resource pool (drained)",
            });
        }
        let pair = state.pairs.pop().ok_or(StreamError::Exhausted {
            resource: "io resource pool",
        })?;
        Ok(PairLease {
            pool: Arc::clone(&self.shared),
            pair: Some(pair),
        })
    }

    pub fn available(&self) -> usize {
        self.shared.state.lock().pairs.len()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// 清空并停用池，返回被释放的资源对数量。
    pub fn drain(&self) -> usize {
        let pairs = {
            let mut state = self.shared.state.lock();
            state.drained = true;
            std::mem::take(&mut state.pairs)
        };
        pairs.len()
    }
}

impl fmt::Debug for IoResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoResourcePool")
            .field("capacity", &self.shared.capacity)
            .field("available", &self.available())
            .finish()
    }
}

impl ResourceShared {
    fn give_back(&self, mut pair: IoResourcePair) {
        pair.reset();
        let mut state = self.state.lock();
        if state.drained || state.pairs.len() >= self.capacity {
            return;
        }
        state.pairs.push(pair);
    }
}

/// 一次资源对租借；`Drop` 时归还。
///
/// 连接在运行期会把资源对拆成收、发两半分别交给读写任务，
/// 拆除时必须通过 [`restore`](Self::restore) 重新装回，否则租约只能空手归还。
pub struct PairLease {
    pool: Arc<ResourceShared>,
    pair: Option<IoResourcePair>,
}

impl PairLease {
    pub(crate) fn take(&mut self) -> Option<IoResourcePair> {
        self.pair.take()
    }

    pub(crate) fn restore(&mut self, pair: IoResourcePair) {
        self.pair = Some(pair);
    }
}

impl Drop for PairLease {
    fn drop(&mut self) {
        match self.pair.take() {
            Some(pair) => self.pool.give_back(pair),
            None => warn!("io resource pair was not restored before its lease ended"),
        }
    }
}

impl fmt::Debug for PairLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairLease")
            .field("holding", &self.pair.is_some())
            .finish()
    }
}
