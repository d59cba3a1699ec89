//! Length-prefixed CBOR framing for hub channels.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`

use crate::error::{RelayError, RelayResult};
use std::io::Cursor;

/// Default upper bound for a single frame payload (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Encode a serializable value as a bare CBOR payload.
pub fn cbor_encode<T: serde::Serialize>(value: &T) -> RelayResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;
    Ok(payload)
}

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn frame_encode<T: serde::Serialize>(value: &T) -> RelayResult<Vec<u8>> {
    let payload = cbor_encode(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| RelayError::FrameTooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> RelayResult<T> {
    let cursor = Cursor::new(data);
    let value: T = ciborium::from_reader(cursor)?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_size,
        }
    }

    /// Append bytes read from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete payload, if one is buffered.
    ///
    /// Fails with [`RelayError::FrameTooLarge`] as soon as a length prefix
    /// exceeds the limit, before the payload is buffered.
    pub fn next_frame(&mut self) -> RelayResult<Option<Vec<u8>>> {
        if self.buffer.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len =
            u32::from_be_bytes([self.buffer[0], self.buffer[1], self.buffer[2], self.buffer[3]])
                as usize;
        if len > self.max_frame_size {
            return Err(RelayError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if self.buffer.len() < LEN_PREFIX + len {
            return Ok(None);
        }

        let payload = self.buffer[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buffer.drain(..LEN_PREFIX + len);
        Ok(Some(payload))
    }

    /// Feed raw bytes and return all complete payloads now available.
    pub fn feed_raw(&mut self, data: &[u8]) -> RelayResult<Vec<Vec<u8>>> {
        self.extend(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of bytes remaining in the internal buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestMsg {
        name: String,
        value: i64,
    }

    #[test]
    fn several_frames_in_one_read() {
        let msgs = vec![
            TestMsg {
                name: "a".into(),
                value: 1,
            },
            TestMsg {
                name: "b".into(),
                value: 2,
            },
        ];

        let mut combined = Vec::new();
        for m in &msgs {
            combined.extend(frame_encode(m).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed_raw(&combined).unwrap();
        let decoded: Vec<TestMsg> = frames.iter().map(|f| cbor_decode(f).unwrap()).collect();
        assert_eq!(decoded, msgs);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn incremental_feed() {
        let msg = TestMsg {
            name: "test".into(),
            value: 99,
        };
        let frame = frame_encode(&msg).unwrap();
        let mut decoder = FrameDecoder::new();

        // Feed one byte at a time
        for i in 0..frame.len() - 1 {
            assert!(decoder.feed_raw(&frame[i..i + 1]).unwrap().is_empty());
        }
        let frames = decoder.feed_raw(&frame[frame.len() - 1..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(cbor_decode::<TestMsg>(&frames[0]).unwrap(), msg);
    }

    #[test]
    fn oversized_prefix_is_rejected_early() {
        let mut decoder = FrameDecoder::with_max_frame_size(16);
        decoder.extend(&1024u32.to_be_bytes());
        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, RelayError::FrameTooLarge { size: 1024, max: 16 }));
    }

    #[test]
    fn large_payload_is_framed() {
        let body = vec![7u8; 3 * 1024 * 1024];
        let frame = frame_encode(&serde_bytes::ByteBuf::from(body.clone())).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in frame.chunks(64 * 1024) {
            frames.extend(decoder.feed_raw(chunk).unwrap());
        }
        assert_eq!(frames.len(), 1);
        let back: serde_bytes::ByteBuf = cbor_decode(&frames[0]).unwrap();
        assert_eq!(back.into_vec(), body);
    }

    #[test]
    fn garbage_payload_fails_to_decode() {
        let err = cbor_decode::<TestMsg>(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, RelayError::Deserialization(_)));
    }
}
