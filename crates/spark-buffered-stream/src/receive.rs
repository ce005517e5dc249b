//! 接收管线：读任务（生产者）把 I/O 完成拷出并入队，惰性启动的消费者任务按序拼帧。
//!
//! # 教案式注释
//!
//! ## 意图 (Why)
//! - 读缓冲在下一次读取时会被覆盖，因此生产者必须先把本次字节拷出；
//! - 拼帧与用户回调放到独立的消费者任务上，读任务拷完即发起下一次读取，
//!   网络吞吐不被解析延迟拖慢。
//!
//! ## 逻辑 (How)
//! - [`ReceiveQueue::push`] 与 [`ReceiveQueue::next`] 共用同一把锁：
//!   入队时若没有消费者在运行，则在锁内置位并由调用方启动消费者；
//!   消费者在锁内观察到队列为空时复位标志并退出。“判空”与“复位”在同一临界区内完成，
//!   不存在入队后无人消费的窗口。
//! - 每条连接同一时刻至多一个消费者；[`FrameDecoder`] 的状态跨消费者实例保留。
//!
//! ## 契约 (What)
//! - 块按到达顺序处理，帧按字节到达顺序回调；
//! - 读错误或协议故障都会关闭连接，且不会重试。

use crate::{
    connection::{Connection, wait_until_closing},
    error::{self, StreamError, map_io_error},
    frame::FrameDecoder,
};
use bytes::Bytes;
use parking_lot::Mutex;
use spark_buffer::BufferHandle;
use std::collections::VecDeque;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// 读任务独占的读半部与接收缓冲。
pub(crate) struct ReceiveHalf {
    pub(crate) reader: Option<BoxedReader>,
    pub(crate) buffer: Option<BufferHandle>,
}

struct InboundState {
    chunks: VecDeque<Bytes>,
    draining: bool,
}

/// 每条连接的有序接收队列与分帧状态。
pub(crate) struct ReceiveQueue {
    state: Mutex<InboundState>,
    decoder: Mutex<FrameDecoder>,
}

impl ReceiveQueue {
    pub(crate) fn new(decoder: FrameDecoder) -> Self {
        Self {
            state: Mutex::new(InboundState {
                chunks: VecDeque::new(),
                draining: false,
            }),
            decoder: Mutex::new(decoder),
        }
    }

    /// 入队一块字节；返回 `true` 表示调用方需要启动消费者。
    pub(crate) fn push(&self, chunk: Bytes) -> bool {
        let mut state = self.state.lock();
        state.chunks.push_back(chunk);
        if state.draining {
            false
        } else {
            state.draining = true;
            true
        }
    }

    /// 取出下一块；队列为空时在同一临界区内复位消费者标志。
    fn next(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        let chunk = state.chunks.pop_front();
        if chunk.is_none() {
            state.draining = false;
        }
        chunk
    }

    /// 丢弃尚未处理的块并复位消费者标志。
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        state.chunks.clear();
        state.draining = false;
    }

    #[cfg(test)]
    fn is_draining(&self) -> bool {
        self.state.lock().draining
    }
}

/// 读任务主循环：读取 → 拷出 → 入队 → 立即发起下一次读取。
pub(crate) async fn read_loop(connection: Connection) {
    let mut half = connection.receive_half().lock().await;
    let ReceiveHalf { reader, buffer } = &mut *half;
    let (Some(reader), Some(buffer)) = (reader.as_mut(), buffer.as_mut()) else {
        return;
    };
    let mut state = connection.state_receiver();

    loop {
        buffer.reset();
        let storage = match buffer.as_mut_slice() {
            Ok(storage) => storage,
            Err(err) => {
                connection.fail(err.into());
                return;
            }
        };
        let read = tokio::select! {
            biased;
            _ = wait_until_closing(&mut state) => return,
            read = reader.read(storage) => read,
        };

        match read {
            Ok(0) => {
                debug!(connection_id = %connection.id(), peer = %connection.peer(), "peer closed the stream");
                connection.close();
                return;
            }
            Ok(transferred) => {
                let chunk = match stage_chunk(buffer, transferred) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        connection.fail(err);
                        return;
                    }
                };
                debug!(connection_id = %connection.id(), bytes = transferred, "chunk received");
                produce(&connection, chunk);
            }
            Err(err) => {
                connection.fail(map_io_error(error::READ, err));
                return;
            }
        }
    }
}

/// 将读缓冲中本次写入的字节拷出为独立的块。
fn stage_chunk(buffer: &mut BufferHandle, transferred: usize) -> Result<Bytes, StreamError> {
    buffer.commit(transferred)?;
    Ok(Bytes::copy_from_slice(buffer.filled()?))
}

/// 生产者：入队并在必要时启动消费者。
pub(crate) fn produce(connection: &Connection, chunk: Bytes) {
    if connection.inbound().push(chunk) {
        let consumer = connection.clone();
        connection.spawn(async move { consume(consumer) });
    }
}

/// 消费者：按 FIFO 顺序排空队列，逐块驱动分帧状态机。
fn consume(connection: Connection) {
    let inbound = connection.inbound();
    while let Some(chunk) = inbound.next() {
        if !connection.is_open() {
            inbound.abandon();
            return;
        }
        let observer = connection.observer();
        let result = inbound.decoder.lock().feed(&chunk, |payload| {
            if connection.is_open() {
                debug!(connection_id = %connection.id(), bytes = payload.len(), "message received");
                observer.on_message_received(&connection, payload);
            }
        });
        if let Err(err) = result {
            inbound.abandon();
            connection.fail(err);
            return;
        }
    }
}
