//! 分帧的性质测试：任意切分编码后的字节流，逐块喂入解码器，得到的消息序列与原始载荷一致。

use proptest::prelude::*;
use spark_buffered_stream::{ConnectionConfig, FrameDecoder, encode_frame};

const MAXIMUM_MESSAGE_SIZE: usize = 512;

fn payloads() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(
        prop::collection::vec(any::<u8>(), 1..MAXIMUM_MESSAGE_SIZE),
        1..8,
    )
}

/// 按 `cuts` 把 `bytes` 切成若干块。
fn split_at_cuts(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts
        .iter()
        .map(|cut| cut % (bytes.len() + 1))
        .collect();
    points.push(0);
    points.push(bytes.len());
    points.sort_unstable();
    points.dedup();
    points
        .windows(2)
        .map(|window| bytes[window[0]..window[1]].to_vec())
        .collect()
}

proptest! {
    #[test]
    fn prop_reassembly_is_fragmentation_invariant(
        messages in payloads(),
        header_size in 2usize..=8,
        cuts in prop::collection::vec(any::<usize>(), 0..32),
    ) {
        let config = ConnectionConfig::new(64, header_size, MAXIMUM_MESSAGE_SIZE)
            .expect("valid config");
        let mut wire = Vec::new();
        for message in &messages {
            wire.extend_from_slice(&encode_frame(message, header_size).expect("encode"));
        }

        let mut decoder = FrameDecoder::new(&config);
        let mut decoded = Vec::new();
        for chunk in split_at_cuts(&wire, &cuts) {
            decoder
                .feed(&chunk, |payload| decoded.push(payload.to_vec()))
                .expect("well-formed stream");
        }

        prop_assert_eq!(decoded, messages);
        prop_assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn prop_byte_at_a_time_feeding_matches_single_feed(
        message in prop::collection::vec(any::<u8>(), 1..MAXIMUM_MESSAGE_SIZE),
    ) {
        let config = ConnectionConfig::new(16, 4, MAXIMUM_MESSAGE_SIZE).expect("valid config");
        let wire = encode_frame(&message, 4).expect("encode");

        let mut decoder = FrameDecoder::new(&config);
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            decoder
                .feed(std::slice::from_ref(byte), |payload| decoded.push(payload.to_vec()))
                .expect("well-formed stream");
        }
        prop_assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn prop_out_of_range_length_never_emits(declared in prop_oneof![Just(0u32), (MAXIMUM_MESSAGE_SIZE as u32)..u32::MAX]) {
        let config = ConnectionConfig::new(16, 4, MAXIMUM_MESSAGE_SIZE).expect("valid config");
        let mut decoder = FrameDecoder::new(&config);
        let mut wire = declared.to_le_bytes().to_vec();
        wire.extend_from_slice(&[7u8; 16]);
        let mut emitted = 0;
        let result = decoder.feed(&wire, |_| emitted += 1);
        prop_assert!(result.is_err());
        prop_assert_eq!(emitted, 0);
    }
}
