use crate::{
    config::ServerConfig,
    connection::{Connection, ConnectionId},
    error::{self, StreamError, map_io_error},
    event::{ConnectionFault, ConnectionObserver, ListenerFault, ListenerObserver, SubscriptionId},
    resource::IoResourcePool,
    statistics::{ServerStatistics, StatisticsSnapshot},
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use spark_buffer::BufferPool;
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    runtime::Handle,
    sync::watch,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// accept 失败后的退避时长。
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// 长度前缀分帧 TCP 监听器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 持有被动套接字、连接注册表、I/O 资源池与 accept 循环，把新连接接到收发管线上，
///   并将连接级事件扇出给订阅者；
/// - 单条连接的任何故障都只关闭该连接，永远不会拖垮监听器或其它连接。
///
/// ## 逻辑 (How)
/// - 生命周期：`Uninitialized --initialize--> Initialized --start_listener--> Listening`，
///   `stop_listener` 回到 `Initialized`，`dispose` 回到 `Uninitialized`；
/// - [`initialize`](Self::initialize) 预分配 `2 × maximum_connections` 块缓冲，
///   并据此装满 I/O 资源池；
/// - accept 循环只持有监听器的弱引用：取到资源对 → 打开连接 → 写入注册表 →
///   通知 `on_connection_established` → 启动读取 → 立刻进入下一次 accept；
/// - 每条连接的观察者是一个指回监听器的弱引用桥：连接关闭时从注册表移除自身，
///   资源对随连接拆除归还到池中。
///
/// ## 契约 (What)
/// - 资源池耗尽时本次 accept 被拒绝（套接字立即关闭），计入 `rejected_connections`，
///   并以 [`ListenerFault`] 上报，监听器继续运行；
/// - 绑定/监听失败既通过 `on_fault` 上报，也作为返回值交给调用方，监听器保持非监听状态；
/// - 必须在 Tokio 运行时中调用 [`start_listener`](Self::start_listener) 及之后的操作。
///
/// ## 注意事项 (Trade-offs)
/// - 直接丢弃监听器会停止 accept 循环，但不会关闭已建立的连接；需要整体拆除时调用
///   [`dispose`](Self::dispose)。
pub struct FramedListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    lifecycle: Mutex<Lifecycle>,
    registry: DashMap<ConnectionId, Connection>,
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn ListenerObserver>)>>,
    next_subscription: AtomicU64,
    statistics: ServerStatistics,
}

enum Lifecycle {
    Uninitialized,
    Initialized(Prepared),
    Listening { prepared: Prepared, active: Active },
}

#[derive(Clone)]
struct Prepared {
    config: ServerConfig,
    buffers: BufferPool,
    resources: IoResourcePool,
}

struct Active {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    pending: Option<TcpListener>,
    accept_task: Option<JoinHandle<()>>,
}

impl Default for FramedListener {
    fn default() -> Self {
        Self::new()
    }
}

impl FramedListener {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                lifecycle: Mutex::new(Lifecycle::Uninitialized),
                registry: DashMap::new(),
                observers: RwLock::new(Vec::new()),
                next_subscription: AtomicU64::new(1),
                statistics: ServerStatistics::default(),
            }),
        }
    }

    /// 以 `config` 初始化：校验配置，预分配缓冲池与 I/O 资源池。
    ///
    /// 只能调用一次；再次调用前必须先 [`dispose`](Self::dispose)。
    pub fn initialize(&self, config: ServerConfig) -> Result<(), StreamError> {
        config.validate()?;
        let mut lifecycle = self.inner.lifecycle.lock();
        if !matches!(*lifecycle, Lifecycle::Uninitialized) {
            return Err(StreamError::AlreadyInitialized);
        }
        let buffer_count = config.buffer_count().ok_or_else(|| StreamError::InvalidConfig {
            field: "maximum_connections",
            detail: format!(
                "{} connections overflow the buffer count",
                config.maximum_connections()
            ),
        })?;
        let buffers = BufferPool::new(buffer_count, config.buffer_size())?;
        let resources = IoResourcePool::from_buffer_pool(&buffers, config.maximum_connections())?;
        info!(
            endpoint = %config.endpoint(),
            maximum_connections = config.maximum_connections(),
            buffer_size = config.buffer_size(),
            "listener initialized"
        );
        *lifecycle = Lifecycle::Initialized(Prepared {
            config,
            buffers,
            resources,
        });
        Ok(())
    }

    /// 绑定并开始监听，返回实际绑定的地址。
    pub fn start_listener(&self) -> Result<SocketAddr, StreamError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        let prepared = match &*lifecycle {
            Lifecycle::Uninitialized => return Err(StreamError::NotInitialized),
            Lifecycle::Listening { .. } => return Err(StreamError::AlreadyListening),
            Lifecycle::Initialized(prepared) => prepared.clone(),
        };
        let (listener, local_addr) = match bind_listener(&prepared.config) {
            Ok(bound) => bound,
            Err(err) => {
                drop(lifecycle);
                self.inner.raise_fault(&err);
                return Err(err);
            }
        };
        let (stop, _) = watch::channel(false);
        *lifecycle = Lifecycle::Listening {
            prepared,
            active: Active {
                local_addr,
                stop,
                pending: Some(listener),
                accept_task: None,
            },
        };
        drop(lifecycle);

        info!(local_addr = %local_addr, "listener started");
        for observer in self.inner.observers() {
            observer.on_started(local_addr);
        }
        Ok(local_addr)
    }

    /// 启动后台 accept 循环。
    pub fn start_accept(&self) -> Result<(), StreamError> {
        let mut lifecycle = self.inner.lifecycle.lock();
        let (prepared, active) = match &mut *lifecycle {
            Lifecycle::Uninitialized => return Err(StreamError::NotInitialized),
            Lifecycle::Initialized(_) => return Err(StreamError::NotListening),
            Lifecycle::Listening { prepared, active } => (prepared.clone(), active),
        };
        let runtime = Handle::try_current().map_err(|_| StreamError::RuntimeUnavailable)?;
        let listener = active.pending.take().ok_or(StreamError::AlreadyAccepting)?;
        let stop = active.stop.subscribe();
        let inner = Arc::downgrade(&self.inner);
        active.accept_task = Some(runtime.spawn(accept_loop(listener, inner, prepared, stop)));
        debug!(local_addr = %active.local_addr, "accept loop started");
        Ok(())
    }

    /// 关闭被动套接字并回到 `Initialized`；已建立的连接不受影响。
    pub async fn stop_listener(&self) -> Result<(), StreamError> {
        let active = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Uninitialized) {
                Lifecycle::Listening { prepared, active } => {
                    *lifecycle = Lifecycle::Initialized(prepared);
                    active
                }
                other => {
                    let err = if matches!(other, Lifecycle::Uninitialized) {
                        StreamError::NotInitialized
                    } else {
                        StreamError::NotListening
                    };
                    *lifecycle = other;
                    return Err(err);
                }
            }
        };

        active.stop.send_replace(true);
        if let Some(task) = active.accept_task {
            if let Err(err) = task.await {
                warn!(error = %err, "accept loop ended abnormally");
            }
        }
        drop(active.pending);
        info!(local_addr = %active.local_addr, "listener stopped");
        for observer in self.inner.observers() {
            observer.on_stopped();
        }
        Ok(())
    }

    /// 整体拆除：停止监听，关闭并等待全部连接拆除，最后释放两个池。
    ///
    /// 等待每条连接拆除的时长不超过 `shutdown_timeout`，超时只记录告警。
    /// 拆除后监听器回到 `Uninitialized`，可以再次 [`initialize`](Self::initialize)。
    /// 对未初始化的监听器调用是无操作。
    pub async fn dispose(&self) {
        let shutdown_timeout = match &*self.inner.lifecycle.lock() {
            Lifecycle::Initialized(prepared) | Lifecycle::Listening { prepared, .. } => {
                prepared.config.shutdown_timeout()
            }
            Lifecycle::Uninitialized => return,
        };
        if self.is_listening() {
            if let Err(err) = self.stop_listener().await {
                debug!(error = %err, "listener was already stopped");
            }
        }

        let connections = self.connections();
        for connection in &connections {
            connection.close();
        }
        for connection in &connections {
            if tokio::time::timeout(shutdown_timeout, connection.closed())
                .await
                .is_err()
            {
                warn!(
                    connection_id = %connection.id(),
                    timeout_ms = shutdown_timeout.as_millis() as u64,
                    "connection teardown exceeded shutdown timeout"
                );
            }
            if self.inner.registry.remove(&connection.id()).is_some() {
                self.inner.statistics.connection_closed();
            }
        }

        let previous = std::mem::replace(&mut *self.inner.lifecycle.lock(), Lifecycle::Uninitialized);
        let prepared = match previous {
            Lifecycle::Initialized(prepared) | Lifecycle::Listening { prepared, .. } => prepared,
            Lifecycle::Uninitialized => return,
        };
        let pairs = prepared.resources.drain();
        let buffers = prepared.buffers.drain();
        info!(
            connections = connections.len(),
            pairs, buffers, "listener disposed"
        );
    }

    /// 向每条已注册连接独立发送同一条消息，返回成功入队的连接数。
    ///
    /// 某条连接失败不会影响其它连接。
    pub fn broadcast(&self, payload: &[u8]) -> Result<usize, StreamError> {
        if !self.is_initialized() {
            return Err(StreamError::NotInitialized);
        }
        let mut delivered = 0;
        for connection in self.connections() {
            match connection.send(payload) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(
                    connection_id = %connection.id(),
                    code = err.code(),
                    "broadcast skipped connection"
                ),
            }
        }
        Ok(delivered)
    }

    /// 按标识查找已注册连接。
    pub fn connection(&self, id: ConnectionId) -> Option<Connection> {
        self.inner.registry.get(&id).map(|entry| entry.value().clone())
    }

    /// 当前已注册连接的快照。
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.statistics.snapshot()
    }

    /// 监听中的本地地址。
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Listening { active, .. } => Some(active.local_addr),
            _ => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(*self.inner.lifecycle.lock(), Lifecycle::Uninitialized)
    }

    pub fn is_listening(&self) -> bool {
        matches!(*self.inner.lifecycle.lock(), Lifecycle::Listening { .. })
    }

    /// I/O 资源池中可用的资源对数量；未初始化时为 `None`。
    pub fn available_resources(&self) -> Option<usize> {
        match &*self.inner.lifecycle.lock() {
            Lifecycle::Initialized(prepared) | Lifecycle::Listening { prepared, .. } => {
                Some(prepared.resources.available())
            }
            Lifecycle::Uninitialized => None,
        }
    }

    /// 订阅监听器事件。
    pub fn subscribe(&self, observer: Arc<dyn ListenerObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.inner.observers.write().push((id, observer));
        id
    }

    /// 取消订阅；返回该订阅此前是否存在。
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.inner.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }
}

impl fmt::Debug for FramedListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedListener")
            .field("local_addr", &self.local_addr())
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl ListenerInner {
    /// 观察者快照；回调在锁外执行，回调内可以订阅或退订。
    fn observers(&self) -> Vec<Arc<dyn ListenerObserver>> {
        self.observers
            .read()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect()
    }

    fn raise_fault(&self, error: &StreamError) {
        warn!(code = error.code(), error = %error, "listener fault");
        let observers = self.observers();
        if observers.is_empty() {
            return;
        }
        let fault = ListenerFault::new(error.clone());
        for observer in observers {
            observer.on_fault(&fault);
        }
    }

    /// 接纳一个已 accept 的套接字。
    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr, prepared: &Prepared) {
        let lease = match prepared.resources.acquire() {
            Ok(lease) => lease,
            Err(err) => {
                self.statistics.connection_rejected();
                warn!(peer = %peer, "connection rejected, io resource pool exhausted");
                self.raise_fault(&err);
                return;
            }
        };
        let (reader, writer) = stream.into_split();
        let bridge = Arc::new(ListenerBridge {
            listener: Arc::downgrade(self),
        });
        let connection = match Connection::open(
            reader,
            writer,
            peer,
            prepared.config.connection_config(),
            lease,
            bridge,
        ) {
            Ok(connection) => connection,
            Err(err) => {
                self.raise_fault(&err);
                return;
            }
        };

        self.registry.insert(connection.id(), connection.clone());
        self.statistics.connection_established();
        info!(connection_id = %connection.id(), peer = %peer, "connection established");
        for observer in self.observers() {
            observer.on_connection_established(&connection);
        }
        if let Err(err) = connection.start_receiving() {
            debug!(connection_id = %connection.id(), code = err.code(), "connection closed before receiving");
        }
    }
}

fn bind_listener(config: &ServerConfig) -> Result<(TcpListener, SocketAddr), StreamError> {
    Handle::try_current().map_err(|_| StreamError::RuntimeUnavailable)?;
    let endpoint = config.endpoint();
    let socket = if endpoint.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|err| map_io_error(error::BIND, err))?;
    socket
        .set_reuseaddr(true)
        .map_err(|err| map_io_error(error::CONFIGURE, err))?;
    socket
        .bind(endpoint)
        .map_err(|err| map_io_error(error::BIND, err))?;
    let listener = socket
        .listen(config.maximum_pending_connections())
        .map_err(|err| map_io_error(error::LISTEN, err))?;
    let local_addr = listener
        .local_addr()
        .map_err(|err| map_io_error(error::BIND, err))?;
    Ok((listener, local_addr))
}

async fn accept_loop(
    listener: TcpListener,
    inner: Weak<ListenerInner>,
    prepared: Prepared,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = stop_requested(&mut stop) => break,
            accepted = listener.accept() => accepted,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match accepted {
            Ok((stream, peer)) => inner.admit(stream, peer, &prepared),
            Err(err) => {
                inner.raise_fault(&map_io_error(error::ACCEPT, err));
                drop(inner);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    debug!("accept loop stopped");
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// 连接到监听器的事件桥，只持有监听器的弱引用。
struct ListenerBridge {
    listener: Weak<ListenerInner>,
}

impl ConnectionObserver for ListenerBridge {
    fn on_message_received(&self, connection: &Connection, payload: &[u8]) {
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        listener.statistics.message_received(payload.len());
        for observer in listener.observers() {
            observer.on_connection_message_received(connection, payload);
        }
    }

    fn on_message_sent(&self, connection: &Connection, payload: &[u8]) {
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        listener.statistics.message_sent(payload.len());
        for observer in listener.observers() {
            observer.on_connection_message_sent(connection, payload);
        }
    }

    fn on_closed(&self, connection: &Connection) {
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        if listener.registry.remove(&connection.id()).is_some() {
            listener.statistics.connection_closed();
        }
        for observer in listener.observers() {
            observer.on_connection_closed(connection);
        }
    }

    fn on_fault(&self, fault: &ConnectionFault) {
        let Some(listener) = self.listener.upgrade() else {
            return;
        };
        for observer in listener.observers() {
            observer.on_connection_fault(fault);
        }
    }
}
