use crate::{
    config::ClientConfig,
    connection::{Connection, ConnectionId},
    error::{self, StreamError, map_io_error},
    event::ConnectionObserver,
    resource::IoResourcePool,
};
use spark_buffer::BufferPool;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpStream;
use tracing::info;

/// 分帧 TCP 客户端。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 客户端与服务端共用同一套收发管线，线路格式与关闭语义完全一致；
/// - 客户端只有一条连接，因此使用仅含一个资源对的私有资源池，
///   缓冲仍来自定长缓冲池，数据面同样不做按消息的堆分配。
///
/// ## 契约 (What)
/// - [`connect`](Self::connect) 成功返回时连接已处于 `Open` 并开始读取；
/// - 丢弃客户端或调用 [`close`](Self::close) 都会发起拆除，`on_closed` 恰好触发一次。
#[derive(Debug)]
pub struct FramedClient {
    connection: Connection,
}

impl FramedClient {
    /// 连接到 `config.endpoint()`。
    pub async fn connect(
        config: ClientConfig,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let connection_config = config.connection_config();
        let buffers = BufferPool::new(2, connection_config.buffer_size())?;
        let resources = IoResourcePool::from_buffer_pool(&buffers, 1)?;

        let stream = TcpStream::connect(config.endpoint())
            .await
            .map_err(|err| map_io_error(error::CONNECT, err))?;
        let peer = stream
            .peer_addr()
            .map_err(|err| map_io_error(error::CONNECT, err))?;
        let lease = resources.acquire()?;

        let (reader, writer) = stream.into_split();
        let connection = Connection::open(reader, writer, peer, connection_config, lease, observer)?;
        connection.start_receiving()?;
        info!(connection_id = %connection.id(), peer = %peer, "client connected");
        Ok(Self { connection })
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }

    pub fn peer(&self) -> SocketAddr {
        self.connection.peer()
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// 发送一条消息，语义同 [`Connection::send`]。
    pub fn send(&self, payload: &[u8]) -> Result<(), StreamError> {
        self.connection.send(payload)
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// 等待连接拆除完成。
    pub async fn closed(&self) {
        self.connection.closed().await;
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }
}

impl Drop for FramedClient {
    fn drop(&mut self) {
        self.connection.close();
    }
}
