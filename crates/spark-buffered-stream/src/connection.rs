use crate::{
    config::ConnectionConfig,
    error::{self, StreamError, map_io_error},
    event::{ConnectionFault, ConnectionObserver},
    frame::{FrameDecoder, encode_frame},
    receive::{self, BoxedReader, ReceiveHalf, ReceiveQueue},
    resource::{IoResourcePair, PairLease},
    send::{self, BoxedWriter, SendHalf, SendQueue},
};
use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    runtime::Handle,
    sync::{Mutex as AsyncMutex, watch},
};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 连接的不透明唯一标识，在 accept / connect 时分配。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// 连接生命周期：`Open → Closing → Closed`，每一步恰好发生一次。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// 一条已建立的分帧连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把一个字节流（TCP 或任意 `AsyncRead + AsyncWrite`）与一对池化 I/O 缓冲绑定，
///   在其上运行接收管线与发送管线；
/// - 拆除路径收敛为单一操作 [`close`](Self::close)，顺序固定为
///   “停止管线 → 归还缓冲 → 归还资源对 → 关闭套接字 → 通知”，不存在可观察的半拆除状态。
///
/// ## 逻辑 (How)
/// - 状态保存在 `watch` 通道中：读写任务在每次 I/O 时同时等待状态离开 `Open`，
///   因而关闭会立即打断在途的读取与写入；
/// - 读半部与写半部分别放在异步互斥锁后面，由对应任务在运行期独占；
///   拆除任务先发出关闭信号，再获取两把锁回收缓冲。
///
/// ## 契约 (What)
/// - `Connection` 可廉价克隆，所有克隆指向同一条连接；
/// - [`send`](Self::send) 与 [`start_receiving`](Self::start_receiving) 在连接离开 `Open`
///   后返回 [`StreamError::ConnectionClosed`]；
/// - [`close`](Self::close) 幂等，`on_closed` 每条连接恰好触发一次；
/// - 必须在 Tokio 运行时中打开连接，后台任务都派生到该运行时。
///
/// ## 注意事项 (Trade-offs)
/// - 关闭是异步完成的：`close` 返回时拆除可能仍在进行，需要等待时使用
///   [`closed`](Self::closed)。
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    peer: SocketAddr,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    runtime: Handle,
    observer: Arc<dyn ConnectionObserver>,
    lease: parking_lot::Mutex<Option<PairLease>>,
    receiving: AtomicBool,
    receive: AsyncMutex<ReceiveHalf>,
    send: AsyncMutex<SendHalf>,
    inbound: ReceiveQueue,
    outbound: SendQueue,
}

impl Connection {
    /// 在一对读写半部之上打开连接。
    ///
    /// - `lease`：从 [`IoResourcePool`](crate::IoResourcePool) 取得的资源对租约，连接关闭时归还；
    /// - `observer`：连接事件的接收方；
    /// - 打开后连接处于 `Open`，但尚未开始读取，需显式调用
    ///   [`start_receiving`](Self::start_receiving)。
    pub fn open<R, W>(
        reader: R,
        writer: W,
        peer: SocketAddr,
        config: ConnectionConfig,
        mut lease: PairLease,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Result<Self, StreamError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| StreamError::RuntimeUnavailable)?;
        let IoResourcePair { receive, send } = lease.take().ok_or(StreamError::Exhausted {
            resource: "io resource pair",
        })?;
        let (state, _) = watch::channel(ConnectionState::Open);
        let id = ConnectionId::next();

        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        let connection = Self {
            inner: Arc::new(ConnectionInner {
                id,
                peer,
                config,
                state,
                runtime,
                observer,
                lease: parking_lot::Mutex::new(Some(lease)),
                receiving: AtomicBool::new(false),
                receive: AsyncMutex::new(ReceiveHalf {
                    reader: Some(reader),
                    buffer: Some(receive),
                }),
                send: AsyncMutex::new(SendHalf {
                    writer: Some(writer),
                    buffer: Some(send),
                }),
                inbound: ReceiveQueue::new(FrameDecoder::new(&config)),
                outbound: SendQueue::new(),
            }),
        };
        debug!(connection_id = %id, peer = %peer, "connection opened");
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// 对端地址。
    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// 启动读任务；重复调用是无操作。
    pub fn start_receiving(&self) -> Result<(), StreamError> {
        if !self.is_open() {
            return Err(StreamError::ConnectionClosed);
        }
        if self.inner.receiving.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.spawn(receive::read_loop(self.clone()));
        Ok(())
    }

    /// 发送一条消息。
    ///
    /// 载荷被加上长度头后进入有序待发队列；没有写任务在途时立即启动一个。
    /// 空载荷或长度 `>= maximum_message_size` 的载荷在入队前被拒绝。
    pub fn send(&self, payload: &[u8]) -> Result<(), StreamError> {
        if !self.is_open() {
            return Err(StreamError::ConnectionClosed);
        }
        let maximum = self.inner.config.maximum_message_size();
        if payload.is_empty() || payload.len() >= maximum {
            return Err(StreamError::InvalidMessage {
                length: payload.len(),
                maximum: maximum as u64,
            });
        }
        let frame = encode_frame(payload, self.inner.config.header_size())?;
        debug!(connection_id = %self.inner.id, bytes = payload.len(), "message queued");
        if self.inner.outbound.push(frame) {
            self.spawn(send::write_loop(self.clone()));
        }
        Ok(())
    }

    /// 关闭连接。首次调用发起拆除，之后的调用是无操作。
    pub fn close(&self) {
        let began = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if !began {
            return;
        }
        info!(connection_id = %self.inner.id, peer = %self.inner.peer, "connection closing");
        let this = self.clone();
        self.spawn(async move { this.teardown().await });
    }

    /// 等待拆除完成。
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        if state
            .wait_for(|state| *state == ConnectionState::Closed)
            .await
            .is_err()
        {
            warn!(connection_id = %self.inner.id, "connection state channel dropped");
        }
    }

    /// 上报连接级故障并关闭连接；连接已离开 `Open` 时只做关闭。
    pub(crate) fn fail(&self, error: StreamError) {
        if self.is_open() {
            warn!(
                connection_id = %self.inner.id,
                peer = %self.inner.peer,
                code = error.code(),
                error = %error,
                "connection fault"
            );
            let fault = ConnectionFault::new(self.inner.id, self.inner.peer, error);
            self.inner.observer.on_fault(&fault);
        }
        self.close();
    }

    async fn teardown(self) {
        // 停止管线。
        self.inner.inbound.abandon();
        self.inner.outbound.abandon();
        let (reader, receive_buffer) = {
            let mut half = self.inner.receive.lock().await;
            (half.reader.take(), half.buffer.take())
        };
        let (writer, send_buffer) = {
            let mut half = self.inner.send.lock().await;
            (half.writer.take(), half.buffer.take())
        };

        // 归还缓冲与资源对。
        let lease = self.inner.lease.lock().take();
        if let Some(mut lease) = lease {
            if let (Some(receive), Some(send)) = (receive_buffer, send_buffer) {
                lease.restore(IoResourcePair { receive, send });
            }
            drop(lease);
        }

        // 关闭套接字；写半部的关闭以 shutdown_timeout 为上限。
        let shutdown_fault = match writer {
            Some(writer) => self.shutdown_writer(writer).await,
            None => None,
        };
        drop(reader);

        if let Some(error) = shutdown_fault {
            warn!(
                connection_id = %self.inner.id,
                peer = %self.inner.peer,
                code = error.code(),
                error = %error,
                "connection shutdown fault"
            );
            let fault = ConnectionFault::new(self.inner.id, self.inner.peer, error);
            self.inner.observer.on_fault(&fault);
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        info!(connection_id = %self.inner.id, peer = %self.inner.peer, "connection closed");
        self.inner.observer.on_closed(&self);
    }

    /// 关闭写半部并返回需要上报的故障；对端已断开不算故障。
    async fn shutdown_writer(&self, mut writer: BoxedWriter) -> Option<StreamError> {
        let timeout = self.inner.config.shutdown_timeout();
        match tokio::time::timeout(timeout, writer.shutdown()).await {
            Ok(Ok(())) => None,
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotConnected => {
                debug!(connection_id = %self.inner.id, "peer already disconnected");
                None
            }
            Ok(Err(err)) => Some(map_io_error(error::SHUTDOWN, err)),
            Err(_) => Some(map_io_error(
                error::SHUTDOWN,
                io::Error::new(io::ErrorKind::TimedOut, "write half shutdown timed out"),
            )),
        }
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.runtime.spawn(future);
    }

    pub(crate) fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub(crate) fn observer(&self) -> &Arc<dyn ConnectionObserver> {
        &self.inner.observer
    }

    pub(crate) fn inbound(&self) -> &ReceiveQueue {
        &self.inner.inbound
    }

    pub(crate) fn outbound(&self) -> &SendQueue {
        &self.inner.outbound
    }

    pub(crate) fn receive_half(&self) -> &AsyncMutex<ReceiveHalf> {
        &self.inner.receive
    }

    pub(crate) fn send_half(&self) -> &AsyncMutex<SendHalf> {
        &self.inner.send
    }
}

impl Drop for ConnectionInner {
    /// 未经 `close` 就丢弃最后一个句柄时，把缓冲装回租约，资源对仍回到 I/O 资源池。
    fn drop(&mut self) {
        let Some(mut lease) = self.lease.get_mut().take() else {
            return;
        };
        let receive = self.receive.get_mut().buffer.take();
        let send = self.send.get_mut().buffer.take();
        if let (Some(receive), Some(send)) = (receive, send) {
            lease.restore(IoResourcePair { receive, send });
        }
        debug!(connection_id = %self.id, "connection dropped without close");
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// 等待连接离开 `Open`；用于在读写时同时监听关闭信号。
pub(crate) async fn wait_until_closing(state: &mut watch::Receiver<ConnectionState>) {
    let _ = state
        .wait_for(|state| *state != ConnectionState::Open)
        .await;
}
