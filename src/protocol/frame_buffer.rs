//! Frame accumulation for partial reads.
//!
//! Implements the inbound half of the length-prefixed framing: bytes are
//! pushed in as they arrive from the socket, and complete frame payloads
//! come out as zero-copy `Bytes`. A state machine tracks where we are:
//! - `WaitingForLength`: need the 8-byte prefix
//! - `WaitingForPayload`: prefix parsed, need N more payload bytes
//!
//! Partial frames stay buffered across pushes. The frame length counts
//! the prefix itself, so a frame shorter than 8 bytes is malformed, as is
//! a negative length or one above the configured limit; all of these are
//! fatal to the channel.

use bytes::{Buf, BytesMut};

use super::message::LENGTH_PREFIX_SIZE;
use crate::config::DEFAULT_MAX_FRAME_SIZE;
use crate::error::{Result, TransportError};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for the complete 8-byte length prefix.
    WaitingForLength,
    /// Prefix parsed, waiting for the rest of the frame.
    WaitingForPayload { remaining: usize },
}

/// Buffer that accumulates inbound bytes and extracts complete frames.
///
/// All data lives in a single `BytesMut`; payloads are split off and
/// frozen without copying.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_frame_size: u64,
}

impl FrameBuffer {
    /// Create a frame buffer with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a frame buffer with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: u64) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForLength,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frame payloads.
    ///
    /// Returns the payloads (prefix stripped) of every frame completed by
    /// this push; the vector is empty while a frame is still partial.
    ///
    /// # Errors
    ///
    /// A malformed length prefix fails the buffer permanently; the channel
    /// must be torn down.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<bytes::Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut payloads = Vec::new();
        while let Some(payload) = self.try_extract_one()? {
            payloads.push(payload);
        }
        Ok(payloads)
    }

    fn try_extract_one(&mut self) -> Result<Option<bytes::Bytes>> {
        match self.state {
            State::WaitingForLength => {
                if self.buffer.len() < LENGTH_PREFIX_SIZE {
                    return Ok(None);
                }

                let frame_len = (&self.buffer[..LENGTH_PREFIX_SIZE]).get_i64();
                if frame_len < LENGTH_PREFIX_SIZE as i64 {
                    return Err(TransportError::Frame(format!(
                        "invalid frame length {frame_len}"
                    )));
                }
                if frame_len as u64 > self.max_frame_size {
                    return Err(TransportError::Frame(format!(
                        "frame length {} exceeds maximum {}",
                        frame_len, self.max_frame_size
                    )));
                }

                self.buffer.advance(LENGTH_PREFIX_SIZE);
                self.state = State::WaitingForPayload {
                    remaining: frame_len as usize - LENGTH_PREFIX_SIZE,
                };
                self.try_extract_one()
            }

            State::WaitingForPayload { remaining } => {
                if self.buffer.len() < remaining {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(remaining).freeze();
                self.state = State::WaitingForLength;
                Ok(Some(payload))
            }
        }
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn make_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
        frame.put_i64((LENGTH_PREFIX_SIZE + payload.len()) as i64);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_single_complete_frame() {
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame(b"hello")).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"hello");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new();
        let mut wire = make_frame(b"first");
        wire.extend(make_frame(b"second"));
        wire.extend(make_frame(b"third"));

        let frames = buffer.push(&wire).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..], b"first");
        assert_eq!(&frames[1][..], b"second");
        assert_eq!(&frames[2][..], b"third");
    }

    #[test]
    fn test_fragmented_prefix() {
        let mut buffer = FrameBuffer::new();
        let wire = make_frame(b"split");

        assert!(buffer.push(&wire[..5]).unwrap().is_empty());
        let frames = buffer.push(&wire[5..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"split");
    }

    #[test]
    fn test_fragmented_payload() {
        let mut buffer = FrameBuffer::new();
        let wire = make_frame(b"a somewhat longer payload");
        let mid = LENGTH_PREFIX_SIZE + 10;

        assert!(buffer.push(&wire[..mid]).unwrap().is_empty());
        let frames = buffer.push(&wire[mid..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"a somewhat longer payload");
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut buffer = FrameBuffer::new();
        let wire = make_frame(b"hi");

        let mut all = Vec::new();
        for byte in &wire {
            all.extend(buffer.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][..], b"hi");
    }

    #[test]
    fn test_empty_payload() {
        // A frame of exactly the prefix carries an empty payload.
        let mut buffer = FrameBuffer::new();
        let frames = buffer.push(&make_frame(b"")).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_empty());
    }

    #[test]
    fn test_negative_length_fails() {
        let mut buffer = FrameBuffer::new();
        let mut wire = Vec::new();
        wire.put_i64(-3);
        let err = buffer.push(&wire).unwrap_err();
        assert!(err.to_string().contains("invalid frame length"));
    }

    #[test]
    fn test_length_below_prefix_fails() {
        let mut buffer = FrameBuffer::new();
        let mut wire = Vec::new();
        wire.put_i64(4);
        assert!(buffer.push(&wire).is_err());
    }

    #[test]
    fn test_length_above_limit_fails() {
        let mut buffer = FrameBuffer::with_max_frame_size(128);
        let mut wire = Vec::new();
        wire.put_i64(1024);
        let err = buffer.push(&wire).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_short_prefix_is_held() {
        let mut buffer = FrameBuffer::new();
        assert!(buffer.push(&[0, 0, 0]).unwrap().is_empty());
        assert_eq!(buffer.buffered(), 3);
    }

    #[test]
    fn test_mixed_complete_and_partial() {
        let mut buffer = FrameBuffer::new();
        let first = make_frame(b"done");
        let second = make_frame(b"pending");

        let mut wire = first.clone();
        wire.extend_from_slice(&second[..6]);

        let frames = buffer.push(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"done");

        let frames = buffer.push(&second[6..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], b"pending");
    }

    #[test]
    fn test_large_frame() {
        let mut buffer = FrameBuffer::new();
        let payload = vec![0xAB; 1024 * 1024];
        let frames = buffer.push(&make_frame(&payload)).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), payload.len());
        assert!(frames[0].iter().all(|&b| b == 0xAB));
    }
}
