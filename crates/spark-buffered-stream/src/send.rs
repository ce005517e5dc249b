//! 发送管线：每条连接一个有序待发队列，至多一个写任务在途，超长帧按缓冲长度分片写出。

use crate::{
    connection::{Connection, wait_until_closing},
    error::{self, StreamError, map_io_error},
};
use bytes::Bytes;
use parking_lot::Mutex;
use spark_buffer::BufferHandle;
use std::collections::VecDeque;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// 写任务独占的写半部与发送缓冲。
pub(crate) struct SendHalf {
    pub(crate) writer: Option<BoxedWriter>,
    pub(crate) buffer: Option<BufferHandle>,
}

struct OutboundState {
    pending: VecDeque<Bytes>,
    in_flight: bool,
}

/// 待发帧队列与在途标志。
///
/// 与接收队列相同，“取下一帧 / 判空复位在途标志”和“入队 / 判断是否需要启动写任务”
/// 在同一把锁内完成，同一连接的两个帧永远不会同时在途。
pub(crate) struct SendQueue {
    state: Mutex<OutboundState>,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(OutboundState {
                pending: VecDeque::new(),
                in_flight: false,
            }),
        }
    }

    /// 入队一帧；返回 `true` 表示调用方需要启动写任务。
    pub(crate) fn push(&self, frame: Bytes) -> bool {
        let mut state = self.state.lock();
        state.pending.push_back(frame);
        if state.in_flight {
            false
        } else {
            state.in_flight = true;
            true
        }
    }

    fn next(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        let frame = state.pending.pop_front();
        if frame.is_none() {
            state.in_flight = false;
        }
        frame
    }

    /// 丢弃未发出的帧；连接关闭后不再尝试投递。
    pub(crate) fn abandon(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        state.in_flight = false;
    }
}

/// 单帧发送游标。
///
/// `offset` 按底层实际写出的字节数推进，短写时未写出的尾部会出现在下一片的开头。
#[derive(Debug)]
pub(crate) struct FrameCursor {
    frame: Bytes,
    offset: usize,
}

impl FrameCursor {
    pub(crate) fn new(frame: Bytes) -> Self {
        Self { frame, offset: 0 }
    }

    /// 下一片，长度不超过 `limit`；帧已写完时返回 `None`。
    pub(crate) fn next_chunk(&self, limit: usize) -> Option<&[u8]> {
        if self.offset >= self.frame.len() {
            return None;
        }
        let end = self.frame.len().min(self.offset + limit);
        Some(&self.frame[self.offset..end])
    }

    pub(crate) fn advance(&mut self, transferred: usize) {
        self.offset = (self.offset + transferred).min(self.frame.len());
    }

    pub(crate) fn payload(&self, header_size: usize) -> &[u8] {
        &self.frame[header_size..]
    }
}

/// 写任务：依次取出待发帧，逐片拷入发送缓冲并写出，直到队列为空。
pub(crate) async fn write_loop(connection: Connection) {
    let outbound = connection.outbound();
    let mut half = connection.send_half().lock().await;
    let SendHalf { writer, buffer } = &mut *half;
    let (Some(writer), Some(buffer)) = (writer.as_mut(), buffer.as_mut()) else {
        outbound.abandon();
        return;
    };
    let mut state = connection.state_receiver();
    let header_size = connection.config().header_size();
    let limit = connection
        .config()
        .buffer_size()
        .min(buffer.buffer_length());

    while let Some(frame) = outbound.next() {
        let mut cursor = FrameCursor::new(frame);
        while let Some(chunk) = cursor.next_chunk(limit) {
            let written = {
                let staged = match stage_chunk(buffer, chunk) {
                    Ok(staged) => staged,
                    Err(err) => {
                        outbound.abandon();
                        connection.fail(err);
                        return;
                    }
                };
                tokio::select! {
                    biased;
                    _ = wait_until_closing(&mut state) => {
                        outbound.abandon();
                        return;
                    }
                    written = writer.write(staged) => written,
                }
            };
            match written {
                Ok(0) => {
                    debug!(connection_id = %connection.id(), "peer stopped accepting bytes");
                    outbound.abandon();
                    connection.close();
                    return;
                }
                Ok(transferred) => cursor.advance(transferred),
                Err(err) => {
                    outbound.abandon();
                    connection.fail(map_io_error(error::WRITE, err));
                    return;
                }
            }
        }

        if let Err(err) = writer.flush().await {
            outbound.abandon();
            connection.fail(map_io_error(error::WRITE, err));
            return;
        }
        if connection.is_open() {
            let payload = cursor.payload(header_size);
            debug!(connection_id = %connection.id(), bytes = payload.len(), "message sent");
            connection.observer().on_message_sent(&connection, payload);
        }
    }
}

/// 将一片字节拷入发送缓冲，返回缓冲中待写出的区间。
fn stage_chunk<'a>(buffer: &'a mut BufferHandle, chunk: &[u8]) -> Result<&'a [u8], StreamError> {
    buffer.reset();
    buffer.fill_from(chunk)?;
    Ok(buffer.filled()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_splits_by_limit_and_resends_short_write_tail() {
        let mut cursor = FrameCursor::new(Bytes::from_static(b"0123456789"));
        assert_eq!(cursor.next_chunk(4), Some(&b"0123"[..]));
        cursor.advance(2);
        assert_eq!(cursor.next_chunk(4), Some(&b"2345"[..]));
        cursor.advance(4);
        assert_eq!(cursor.next_chunk(4), Some(&b"6789"[..]));
        cursor.advance(4);
        assert_eq!(cursor.next_chunk(4), None);
        assert_eq!(cursor.payload(4), b"456789");
    }

    #[test]
    fn queue_serializes_frames() {
        let queue = SendQueue::new();
        assert!(queue.push(Bytes::from_static(b"one")));
        assert!(!queue.push(Bytes::from_static(b"two")));
        assert_eq!(queue.next().as_deref(), Some(&b"one"[..]));
        assert!(!queue.push(Bytes::from_static(b"three")));
        assert_eq!(queue.next().as_deref(), Some(&b"two"[..]));
        assert_eq!(queue.next().as_deref(), Some(&b"three"[..]));
        assert!(queue.next().is_none());
        assert!(queue.push(Bytes::from_static(b"four")));
        queue.abandon();
        assert!(queue.next().is_none());
    }
}
