//! Length-prefixed binary packet framing.
//!
//! Wire format, little-endian: `size: u16` (total frame length including
//! the header), `id: u16` (message type), then `size - 4` payload bytes.
//! The minimum frame is the bare 4-byte header; `size < 4` is a protocol
//! error.
//!
//! # Example
//!
//! ```
//! use protocol_frame::{Framer, encode_frame};
//!
//! let frame = encode_frame(3, b"hi").unwrap();
//! assert_eq!(frame.as_ref(), &[6, 0, 3, 0, b'h', b'i']);
//!
//! let mut framer = Framer::new();
//! let mut seen = Vec::new();
//! framer
//!     .feed(&frame, |id, payload| seen.push((id, payload.to_vec())))
//!     .unwrap();
//! assert_eq!(seen, vec![(3, b"hi".to_vec())]);
//! ```

use bytes::{Buf, BufMut, BytesMut};

/// Bytes occupied by the `size` and `id` fields.
pub const HEADER_LEN: usize = 4;

/// Default ceiling on a declared frame size.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Framing error. Any of these ends the connection that produced the bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// Declared size smaller than the header itself.
    #[error("declared frame size {0} is below the 4-byte minimum")]
    Undersized(u16),
    /// Declared size above the configured limit.
    #[error("declared frame size {0} exceeds the limit of {1} bytes")]
    Oversized(u16, usize),
    /// A payload too large to describe in the 16-bit size field.
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
}

/// Parsed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Total frame length in bytes, header included.
    pub size: u16,
    /// Message type.
    pub id: u16,
}

impl Header {
    /// Read a header from the front of `buf`; `None` if fewer than 4 bytes.
    pub fn parse(mut buf: &[u8]) -> Option<Header> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let size = buf.get_u16_le();
        let id = buf.get_u16_le();
        Some(Header { size, id })
    }

    /// Payload length implied by the declared size.
    pub fn payload_len(&self) -> usize {
        (self.size as usize).saturating_sub(HEADER_LEN)
    }
}

/// Encode a single frame.
pub fn encode_frame(id: u16, payload: &[u8]) -> Result<BytesMut, FrameError> {
    let total = HEADER_LEN + payload.len();
    if total > u16::MAX as usize {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16_le(total as u16);
    buf.put_u16_le(id);
    buf.put_slice(payload);
    Ok(buf)
}

/// Incremental packet framer with partial-frame reassembly.
///
/// Bytes arrive in arbitrary chunks; `feed` appends them to an internal
/// buffer and emits every complete frame in wire order. The unparsed
/// remainder is shifted to the front of the buffer, so the emitted
/// sequence is independent of how the stream was chunked.
pub struct Framer {
    buf: Vec<u8>,
    len: usize,
    max_frame_len: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    /// A framer that rejects frames declaring more than `limit` bytes.
    pub fn with_max_frame_len(limit: usize) -> Self {
        Framer {
            buf: vec![0u8; 4096],
            len: 0,
            max_frame_len: limit,
        }
    }

    /// Bytes currently buffered awaiting a complete frame.
    pub fn buffered(&self) -> usize {
        self.len
    }

    /// Append `data` and emit every complete frame into `sink`.
    ///
    /// Returns the number of frames emitted. On error the connection is
    /// unrecoverable; the framer makes no attempt to resynchronize.
    pub fn feed<F>(&mut self, data: &[u8], mut sink: F) -> Result<usize, FrameError>
    where
        F: FnMut(u16, &[u8]),
    {
        let needed = self.len + data.len();
        if needed > self.buf.len() {
            self.buf.resize(needed.next_power_of_two(), 0);
        }
        self.buf[self.len..needed].copy_from_slice(data);
        self.len = needed;

        let mut pos = 0;
        let mut emitted = 0;
        while let Some(header) = Header::parse(&self.buf[pos..self.len]) {
            if (header.size as usize) < HEADER_LEN {
                return Err(FrameError::Undersized(header.size));
            }
            if header.size as usize > self.max_frame_len {
                return Err(FrameError::Oversized(header.size, self.max_frame_len));
            }
            if pos + header.size as usize > self.len {
                // Incomplete frame; wait for more bytes.
                break;
            }
            let payload = &self.buf[pos + HEADER_LEN..pos + header.size as usize];
            sink(header.id, payload);
            pos += header.size as usize;
            emitted += 1;
        }

        // Shift the remainder to the front and reset the cursor.
        if pos > 0 {
            self.buf.copy_within(pos..self.len, 0);
            self.len -= pos;
        }

        Ok(emitted)
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}
