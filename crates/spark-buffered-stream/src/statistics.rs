use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// 监听器运行期统计，所有计数器都可在任意线程无锁更新。
///
/// 字节数按载荷计（不含帧头）。`rejected_connections` 统计因资源池耗尽而被拒绝的 accept。
#[derive(Debug, Default)]
pub struct ServerStatistics {
    current_connections: AtomicUsize,
    total_connections: AtomicU64,
    rejected_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// [`ServerStatistics`] 的某一时刻快照。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatisticsSnapshot {
    pub current_connections: usize,
    pub total_connections: u64,
    pub rejected_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl ServerStatistics {
    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            current_connections: self.current_connections.load(Ordering::Relaxed),
            total_connections: self.total_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn connection_established(&self) {
        self.current_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        // 计数不低于 0。
        let _ = self
            .current_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                current.checked_sub(1)
            });
    }

    pub(crate) fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn message_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}
