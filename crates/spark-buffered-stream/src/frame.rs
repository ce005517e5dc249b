//! 长度前缀分帧：编码辅助函数与接收侧的头部/载荷状态机。
//!
//! 线路格式：`header_size` 字节的小端无符号整数（载荷长度），紧跟恰好那么多字节的载荷；
//! 无魔数、无版本、无校验。

use crate::{
    config::{ConnectionConfig, MAX_HEADER_SIZE, header_capacity},
    error::StreamError,
};
use bytes::{BufMut, Bytes, BytesMut};

/// 为 `payload` 加上 `header_size` 字节的小端长度头。
///
/// - `header_size` 必须位于 `1..=8`；
/// - 载荷长度必须为正数且能写进帧头，否则返回 [`StreamError::InvalidMessage`]。
pub fn encode_frame(payload: &[u8], header_size: usize) -> Result<Bytes, StreamError> {
    if header_size == 0 || header_size > MAX_HEADER_SIZE {
        return Err(StreamError::InvalidConfig {
            field: "header_size",
            detail: format!("must be within 1..={MAX_HEADER_SIZE}, got {header_size}"),
        });
    }
    let capacity = header_capacity(header_size);
    let length = payload.len() as u64;
    if payload.is_empty() || length > capacity {
        return Err(StreamError::InvalidMessage {
            length: payload.len(),
            maximum: capacity.saturating_add(1),
        });
    }

    let mut frame = BytesMut::with_capacity(header_size + payload.len());
    frame.put_slice(&length.to_le_bytes()[..header_size]);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DecodeState {
    AwaitingHeader,
    AwaitingPayload,
}

/// 接收侧分帧状态机。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - I/O 完成交付的是任意长度的字节块：一块可能包含零个、一个或多个完整帧，
///   一个帧也可能跨越多块。状态机把“按块喂入”转换为“按帧吐出”。
///
/// ## 逻辑 (How)
/// - `AwaitingHeader`：把字节累积到定长帧头，凑满后解码长度并切换状态；
/// - `AwaitingPayload`：把字节累积到载荷缓冲，凑满后回调 `on_frame` 并回到 `AwaitingHeader`；
/// - 每一步按 `read_offset`（块内游标）与 `write_offset`（目标内游标）做区间拷贝，
///   不逐字节搬运；
/// - 载荷缓冲只在所需长度变化时重新分配。
///
/// ## 契约 (What)
/// - 声明长度为 0 或 `>= maximum_message_size` 时返回 [`StreamError::Protocol`]，
///   当前块的剩余字节被丢弃，此后每次 `feed` 都返回同一错误；
/// - 帧按字节到达顺序依次回调。
#[derive(Debug)]
pub struct FrameDecoder {
    header_size: usize,
    maximum_message_size: usize,
    state: DecodeState,
    header: [u8; MAX_HEADER_SIZE],
    write_offset: usize,
    expected: usize,
    payload: Vec<u8>,
    fault: Option<u64>,
}

impl FrameDecoder {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            header_size: config.header_size(),
            maximum_message_size: config.maximum_message_size(),
            state: DecodeState::AwaitingHeader,
            header: [0; MAX_HEADER_SIZE],
            write_offset: 0,
            expected: 0,
            payload: Vec::new(),
            fault: None,
        }
    }

    /// 喂入一块字节，对每个拼装完成的帧回调一次 `on_frame`，返回本次吐出的帧数。
    pub fn feed<F>(&mut self, chunk: &[u8], mut on_frame: F) -> Result<usize, StreamError>
    where
        F: FnMut(&[u8]),
    {
        if let Some(declared) = self.fault {
            return Err(self.protocol_error(declared));
        }

        let mut frames = 0;
        let mut read_offset = 0;
        while read_offset < chunk.len() {
            let available = chunk.len() - read_offset;
            match self.state {
                DecodeState::AwaitingHeader => {
                    let take = (self.header_size - self.write_offset).min(available);
                    self.header[self.write_offset..self.write_offset + take]
                        .copy_from_slice(&chunk[read_offset..read_offset + take]);
                    self.write_offset += take;
                    read_offset += take;

                    if self.write_offset == self.header_size {
                        let declared = self.declared_length();
                        if declared == 0 || declared >= self.maximum_message_size as u64 {
                            self.fault = Some(declared);
                            return Err(self.protocol_error(declared));
                        }
                        let length = declared as usize;
                        if self.payload.len() != length {
                            self.payload = vec![0; length];
                        }
                        self.expected = length;
                        self.write_offset = 0;
                        self.state = DecodeState::AwaitingPayload;
                    }
                }
                DecodeState::AwaitingPayload => {
                    let take = (self.expected - self.write_offset).min(available);
                    self.payload[self.write_offset..self.write_offset + take]
                        .copy_from_slice(&chunk[read_offset..read_offset + take]);
                    self.write_offset += take;
                    read_offset += take;

                    if self.write_offset == self.expected {
                        on_frame(&self.payload[..self.expected]);
                        frames += 1;
                        self.write_offset = 0;
                        self.state = DecodeState::AwaitingHeader;
                    }
                }
            }
        }
        Ok(frames)
    }

    /// 是否正处于一个未完成帧的中间。
    pub fn is_mid_frame(&self) -> bool {
        self.state == DecodeState::AwaitingPayload || self.write_offset > 0
    }

    fn declared_length(&self) -> u64 {
        let mut raw = [0u8; MAX_HEADER_SIZE];
        raw[..self.header_size].copy_from_slice(&self.header[..self.header_size]);
        u64::from_le_bytes(raw)
    }

    fn protocol_error(&self, declared: u64) -> StreamError {
        StreamError::Protocol {
            declared,
            maximum: self.maximum_message_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(header: usize, maximum: usize) -> FrameDecoder {
        FrameDecoder::new(&ConnectionConfig::new(64, header, maximum).expect("valid config"))
    }

    #[test]
    fn header_and_payload_across_two_chunks() {
        let mut decoder = decoder(4, 100);
        let mut frames = Vec::new();
        let emitted = decoder
            .feed(&[4, 0, 0, 0], |p| frames.push(p.to_vec()))
            .expect("header chunk");
        assert_eq!(emitted, 0);
        assert!(decoder.is_mid_frame());
        let emitted = decoder
            .feed(b"ABCD", |p| frames.push(p.to_vec()))
            .expect("payload chunk");
        assert_eq!(emitted, 1);
        assert_eq!(frames, vec![b"ABCD".to_vec()]);
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn one_chunk_may_carry_many_frames() {
        let mut decoder = decoder(2, 1000);
        let mut chunk = Vec::new();
        for payload in [&b"a"[..], b"bc", b"def"] {
            chunk.extend_from_slice(&encode_frame(payload, 2).expect("encode"));
        }
        // 末尾再挂半个帧头。
        chunk.push(9);
        let mut frames = Vec::new();
        let emitted = decoder
            .feed(&chunk, |p| frames.push(p.to_vec()))
            .expect("feed");
        assert_eq!(emitted, 3);
        assert_eq!(frames, vec![b"a".to_vec(), b"bc".to_vec(), b"def".to_vec()]);
        assert!(decoder.is_mid_frame());
    }

    #[test]
    fn zero_or_oversized_length_is_a_protocol_fault() {
        let mut zero = decoder(4, 100);
        let err = zero.feed(&[0, 0, 0, 0, 1, 2], |_| panic!("no frame")).unwrap_err();
        assert!(matches!(err, StreamError::Protocol { declared: 0, maximum: 100 }));

        let mut oversized = decoder(4, 100);
        let mut emitted = 0;
        let err = oversized
            .feed(&[100, 0, 0, 0, 1, 2], |_| emitted += 1)
            .unwrap_err();
        assert!(matches!(err, StreamError::Protocol { declared: 100, .. }));
        assert_eq!(emitted, 0);
        assert!(oversized.feed(&[1, 0, 0, 0, 7], |_| emitted += 1).is_err());
        assert_eq!(emitted, 0);
    }

    #[test]
    fn frame_before_fault_is_still_emitted() {
        let mut decoder = decoder(1, 200);
        let mut frames = Vec::new();
        let err = decoder
            .feed(&[2, b'o', b'k', 0, b'x'], |p| frames.push(p.to_vec()))
            .unwrap_err();
        assert_eq!(err.code(), "spark.stream.protocol.invalid_length");
        assert_eq!(frames, vec![b"ok".to_vec()]);
    }

    #[test]
    fn encode_rejects_unrepresentable_lengths() {
        assert_eq!(
            encode_frame(b"xyz", 4).expect("encode").as_ref(),
            &[3, 0, 0, 0, b'x', b'y', b'z']
        );
        assert!(matches!(
            encode_frame(b"", 4),
            Err(StreamError::InvalidMessage { length: 0, .. })
        ));
        assert!(matches!(
            encode_frame(&[0u8; 256], 1),
            Err(StreamError::InvalidMessage { length: 256, maximum: 256 })
        ));
        assert!(encode_frame(b"a", 0).is_err());
        assert_eq!(encode_frame(b"a", 8).expect("encode").len(), 9);
    }
}
