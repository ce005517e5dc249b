//! 连接级与监听器级通知。
//!
//! 观察者方法全部带有空实现，调用方只需覆盖关心的事件。回调在 I/O 任务上同步执行，
//! 实现方不应在回调中长时间阻塞；回调内可以安全地调用 [`Connection::send`] 或
//! [`Connection::close`]。

use crate::{
    connection::{Connection, ConnectionId},
    error::StreamError,
};
use std::{fmt, net::SocketAddr};

/// 单条连接的事件观察者。
pub trait ConnectionObserver: Send + Sync + 'static {
    /// 收到一条完整拼装的消息。
    fn on_message_received(&self, _connection: &Connection, _payload: &[u8]) {}

    /// 一条消息的全部字节已写出。
    fn on_message_sent(&self, _connection: &Connection, _payload: &[u8]) {}

    /// 连接拆除完成；每条连接恰好触发一次。
    fn on_closed(&self, _connection: &Connection) {}

    /// 连接级故障，随后连接会被关闭。
    fn on_fault(&self, _fault: &ConnectionFault) {}
}

/// 监听器的事件观察者，同时接收其下全部连接的事件扇出。
pub trait ListenerObserver: Send + Sync + 'static {
    fn on_started(&self, _local_addr: SocketAddr) {}

    fn on_stopped(&self) {}

    /// 监听器级故障（绑定、监听、接受失败或资源池耗尽）。
    fn on_fault(&self, _fault: &ListenerFault) {}

    fn on_connection_established(&self, _connection: &Connection) {}

    fn on_connection_message_received(&self, _connection: &Connection, _payload: &[u8]) {}

    fn on_connection_message_sent(&self, _connection: &Connection, _payload: &[u8]) {}

    fn on_connection_closed(&self, _connection: &Connection) {}

    fn on_connection_fault(&self, _fault: &ConnectionFault) {}
}

/// 不关心任何事件的观察者。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

impl ListenerObserver for NoopObserver {}

/// 连接级故障：携带来源连接的标识与对端地址。
#[derive(Debug)]
pub struct ConnectionFault {
    connection_id: ConnectionId,
    peer: SocketAddr,
    error: StreamError,
}

impl ConnectionFault {
    pub(crate) fn new(connection_id: ConnectionId, peer: SocketAddr, error: StreamError) -> Self {
        Self {
            connection_id,
            peer,
            error,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn error(&self) -> &StreamError {
        &self.error
    }
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection {} ({}) fault: {}",
            self.connection_id, self.peer, self.error
        )
    }
}

impl std::error::Error for ConnectionFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// 监听器级故障。
#[derive(Debug)]
pub struct ListenerFault {
    error: StreamError,
}

impl ListenerFault {
    pub(crate) fn new(error: StreamError) -> Self {
        Self { error }
    }

    pub fn error(&self) -> &StreamError {
        &self.error
    }
}

impl fmt::Display for ListenerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener fault: {}", self.error)
    }
}

impl std::error::Error for ListenerFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// [`FramedListener::subscribe`](crate::FramedListener::subscribe) 返回的订阅凭据。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SubscriptionId(pub(crate) u64);
