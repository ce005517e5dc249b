//! 集成测试共用的事件记录器与等待工具。

#![allow(dead_code)]

use spark_buffer::BufferPool;
use spark_buffered_stream::{
    Connection, ConnectionFault, ConnectionId, ConnectionObserver, ErrorCategory, IoResourcePool,
    ListenerFault, ListenerObserver, PairLease,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

pub const WAIT: Duration = Duration::from_secs(5);

/// 连接事件。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    Received(Vec<u8>),
    Sent(Vec<u8>),
    Closed,
    Fault(ErrorCategory),
}

/// 把连接事件转发到通道的观察者。
pub struct ConnectionRecorder {
    events: UnboundedSender<ConnectionEvent>,
}

impl ConnectionRecorder {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<ConnectionEvent>) {
        let (events, rx) = unbounded_channel();
        (Arc::new(Self { events }), rx)
    }
}

impl ConnectionObserver for ConnectionRecorder {
    fn on_message_received(&self, _connection: &Connection, payload: &[u8]) {
        let _ = self.events.send(ConnectionEvent::Received(payload.to_vec()));
    }

    fn on_message_sent(&self, _connection: &Connection, payload: &[u8]) {
        let _ = self.events.send(ConnectionEvent::Sent(payload.to_vec()));
    }

    fn on_closed(&self, _connection: &Connection) {
        let _ = self.events.send(ConnectionEvent::Closed);
    }

    fn on_fault(&self, fault: &ConnectionFault) {
        let _ = self
            .events
            .send(ConnectionEvent::Fault(fault.error().category()));
    }
}

/// 监听器事件。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ListenerEvent {
    Started(SocketAddr),
    Stopped,
    Fault(ErrorCategory),
    Established(ConnectionId),
    Received(ConnectionId, Vec<u8>),
    Sent(ConnectionId, Vec<u8>),
    Closed(ConnectionId),
    ConnectionFault(ConnectionId, ErrorCategory),
}

pub struct ListenerRecorder {
    events: UnboundedSender<ListenerEvent>,
    echo: bool,
}

impl ListenerRecorder {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<ListenerEvent>) {
        let (events, rx) = unbounded_channel();
        (Arc::new(Self { events, echo: false }), rx)
    }

    /// 收到消息后原样回送的记录器。
    pub fn echo() -> (Arc<Self>, UnboundedReceiver<ListenerEvent>) {
        let (events, rx) = unbounded_channel();
        (Arc::new(Self { events, echo: true }), rx)
    }
}

impl ListenerObserver for ListenerRecorder {
    fn on_started(&self, local_addr: SocketAddr) {
        let _ = self.events.send(ListenerEvent::Started(local_addr));
    }

    fn on_stopped(&self) {
        let _ = self.events.send(ListenerEvent::Stopped);
    }

    fn on_fault(&self, fault: &ListenerFault) {
        let _ = self
            .events
            .send(ListenerEvent::Fault(fault.error().category()));
    }

    fn on_connection_established(&self, connection: &Connection) {
        let _ = self
            .events
            .send(ListenerEvent::Established(connection.id()));
    }

    fn on_connection_message_received(&self, connection: &Connection, payload: &[u8]) {
        let _ = self
            .events
            .send(ListenerEvent::Received(connection.id(), payload.to_vec()));
        if self.echo {
            let _ = connection.send(payload);
        }
    }

    fn on_connection_message_sent(&self, connection: &Connection, payload: &[u8]) {
        let _ = self
            .events
            .send(ListenerEvent::Sent(connection.id(), payload.to_vec()));
    }

    fn on_connection_closed(&self, connection: &Connection) {
        let _ = self.events.send(ListenerEvent::Closed(connection.id()));
    }

    fn on_connection_fault(&self, fault: &ConnectionFault) {
        let _ = self.events.send(ListenerEvent::ConnectionFault(
            fault.connection_id(),
            fault.error().category(),
        ));
    }
}

/// 在超时内取下一个事件。
pub async fn next_event<T>(rx: &mut UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// 跳过不满足条件的事件，直到取到第一个满足 `predicate` 的事件。
pub async fn wait_for_event<T, F>(rx: &mut UnboundedReceiver<T>, mut predicate: F) -> T
where
    F: FnMut(&T) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if predicate(&event) {
            return event;
        }
    }
}

/// 只含一个资源对的资源池与它的租约。
pub fn single_lease(buffer_size: usize) -> (IoResourcePool, PairLease) {
    let buffers = BufferPool::new(2, buffer_size).expect("buffer pool");
    let pool = IoResourcePool::from_buffer_pool(&buffers, 1).expect("resource pool");
    let lease = pool.acquire().expect("lease");
    (pool, lease)
}

pub fn peer() -> SocketAddr {
    "127.0.0.1:40000".parse().expect("parse addr")
}
