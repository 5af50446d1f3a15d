//! Length-prefixed framing over a reliable byte stream
//!
//! A frame is a 4-byte big-endian body length followed by the body. Reads from
//! a socket arrive in arbitrary chunks; [`FrameReader`] buffers them and hands
//! back whole bodies in arrival order.

use crate::error::ProtocolError;

pub const HEADER_LEN: usize = 4;
pub const DEFAULT_MAX_FRAME_LEN: usize = 512 * 1024;

/// Prefixes `body` with its length
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

#[derive(Debug)]
pub struct FrameReader {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes received but not yet returned as part of a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete frame body, if one has fully arrived.
    ///
    /// An oversized length is fatal for the stream: there is no way to find
    /// the next frame boundary afterwards.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buffer[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;

        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let body = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..HEADER_LEN + len);
        Ok(Some(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_reads() {
        let mut stream = frame(b"This is a test.");
        stream.extend(frame(b"This is only a test."));
        stream.extend(frame(b"Third time is the charm."));

        let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_LEN);
        let mut bodies = Vec::new();

        // feed the stream a few bytes at a time
        for chunk in stream.chunks(3) {
            reader.extend(chunk);
            while let Some(body) = reader.next_frame().unwrap() {
                bodies.push(body);
            }
        }

        assert_eq!(bodies.len(), 3);
        assert_eq!(bodies[0], b"This is a test.");
        assert_eq!(bodies[1], b"This is only a test.");
        assert_eq!(bodies[2], b"Third time is the charm.");
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_partial_frame_waits() {
        let stream = frame(b"hello");
        let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_LEN);
        reader.extend(&stream[..6]);
        assert!(reader.next_frame().unwrap().is_none());
        reader.extend(&stream[6..]);
        assert_eq!(reader.next_frame().unwrap().unwrap(), b"hello");
    }

    #[test]
    fn test_empty_frame() {
        let mut reader = FrameReader::new(16);
        reader.extend(&frame(&[]));
        assert_eq!(reader.next_frame().unwrap().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut reader = FrameReader::new(8);
        reader.extend(&frame(&[0u8; 9]));
        match reader.next_frame() {
            Err(ProtocolError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 9);
                assert_eq!(max, 8);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }
}
