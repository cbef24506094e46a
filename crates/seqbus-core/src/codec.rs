//! Length-prefixed frame codec for the `/stream` response body.
//!
//! Frames are encoded as a little-endian u32 length prefix followed by the
//! bincode body. The decoder is fed arbitrary byte chunks (HTTP chunked
//! transfer splits frames at arbitrary points) and yields complete frames;
//! a trailing partial frame is retained across feeds.

use crate::error::{CoreError, Result};
use crate::event::StreamFrame;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Default ceiling for a single frame. Anything larger is a corrupt or
/// hostile stream.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Encode one frame with its length prefix. Used by tests and mock relays.
pub fn encode_frame(frame: &StreamFrame) -> Bytes {
    // StreamFrame contains no unserializable types.
    let body = bincode::serialize(frame).unwrap_or_default();
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    buf.freeze()
}

/// Incremental decoder for a stream of length-prefixed frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl FrameDecoder {
    /// Create a decoder with the given frame size ceiling.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Append a chunk of raw stream bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<StreamFrame>> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_size {
            return Err(CoreError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        self.buf.advance(LEN_PREFIX);
        let body = self.buf.split_to(len);
        let frame = bincode::deserialize(&body)
            .map_err(|e| CoreError::FrameDecode(e.to_string()))?;
        Ok(Some(frame))
    }

    /// Bytes of an incomplete trailing frame still buffered.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeEvent;

    fn sample_frames() -> Vec<StreamFrame> {
        vec![
            StreamFrame::Event(ChangeEvent::new(30, 1, &b"k1"[..], &b"p1"[..])),
            StreamFrame::Event(ChangeEvent::new(30, 2, &b"k2"[..], &b"p2"[..])),
            StreamFrame::EndOfWindow { scn: 30 },
            StreamFrame::Heartbeat { scn: 31 },
        ]
    }

    #[test]
    fn test_decode_single_feed() {
        let mut dec = FrameDecoder::default();
        for f in sample_frames() {
            dec.feed(&encode_frame(&f));
        }
        for expected in sample_frames() {
            assert_eq!(dec.next_frame().unwrap(), Some(expected));
        }
        assert_eq!(dec.next_frame().unwrap(), None);
        assert_eq!(dec.pending_bytes(), 0);
    }

    #[test]
    fn test_decode_across_chunk_boundaries() {
        let mut wire = Vec::new();
        for f in sample_frames() {
            wire.extend_from_slice(&encode_frame(&f));
        }

        // Feed one byte at a time; frames must still come out whole.
        let mut dec = FrameDecoder::default();
        let mut out = Vec::new();
        for b in wire {
            dec.feed(&[b]);
            while let Some(f) = dec.next_frame().unwrap() {
                out.push(f);
            }
        }
        assert_eq!(out, sample_frames());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut dec = FrameDecoder::new(16);
        let mut prefix = BytesMut::new();
        prefix.put_u32_le(1024);
        dec.feed(&prefix);
        assert!(matches!(
            dec.next_frame(),
            Err(CoreError::FrameTooLarge { size: 1024, .. })
        ));
    }

    #[test]
    fn test_garbage_body_is_decode_error() {
        let mut dec = FrameDecoder::default();
        let mut wire = BytesMut::new();
        wire.put_u32_le(3);
        wire.put_slice(&[0xff, 0xff, 0xff]);
        dec.feed(&wire);
        assert!(matches!(dec.next_frame(), Err(CoreError::FrameDecode(_))));
    }
}
