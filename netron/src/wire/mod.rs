//! Framing of envelopes on a byte transport.
//!
//! ```text
//! ┌─────────────┬────────────────┬────────────────────┐
//! │ len: u32 LE │ crc32c: u32 LE │ JSON envelope body │
//! └─────────────┴────────────────┴────────────────────┘
//! ```
//!
//! `len` counts the whole frame, header included. A frame whose checksum
//! does not match its body ends the session that carried it.

/// Envelope layout and per-action payloads.
pub mod envelope;

pub use envelope::{Action, DataFlags, Envelope, Handshake, Payload};

/// Bytes in front of every envelope body.
pub const HEADER_SIZE: usize = 8;

/// Largest envelope body a peer sends or accepts.
///
/// Stream writes are split so that every data packet fits.
pub const MAX_BODY_SIZE: usize = 1024 * 1024;

/// Framing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// The buffer ends before the frame does.
    #[error("insufficient data: need {needed} bytes, have {have}")]
    InsufficientData {
        /// Minimum bytes required to parse.
        needed: usize,
        /// Actual bytes available.
        have: usize,
    },

    /// The body does not hash to the header's checksum.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from header.
        expected: u32,
        /// Computed checksum from data.
        actual: u32,
    },

    /// Body larger than [`MAX_BODY_SIZE`].
    #[error("frame too large: {size} bytes (max {MAX_BODY_SIZE})")]
    FrameTooLarge {
        /// Actual body size in bytes.
        size: usize,
    },

    /// Length shorter than the header itself.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },
}

/// Length and checksum of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame size including header.
    pub length: u32,
    /// CRC32C checksum of the body.
    pub checksum: u32,
}

impl FrameHeader {
    fn write_to(&self, frame: &mut Vec<u8>) {
        frame.extend_from_slice(&self.length.to_le_bytes());
        frame.extend_from_slice(&self.checksum.to_le_bytes());
    }

    /// Read the header at the start of `buf`, rejecting lengths that cannot
    /// describe an acceptable frame.
    pub fn deserialize(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::InsufficientData {
                needed: HEADER_SIZE,
                have: buf.len(),
            });
        }

        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let checksum = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);

        if (length as usize) < HEADER_SIZE {
            return Err(WireError::InvalidLength { length });
        }
        if length as usize - HEADER_SIZE > MAX_BODY_SIZE {
            return Err(WireError::FrameTooLarge {
                size: length as usize - HEADER_SIZE,
            });
        }

        Ok(Self { length, checksum })
    }
}

/// Wrap `body` in a frame, failing with `FrameTooLarge` past
/// [`MAX_BODY_SIZE`].
///
/// # Examples
///
/// ```
/// use netron::wire::{serialize_frame, deserialize_frame};
///
/// let frame = serialize_frame(b"hello").expect("serialize");
/// let body = deserialize_frame(&frame).expect("deserialize");
/// assert_eq!(body.as_slice(), b"hello");
/// ```
pub fn serialize_frame(body: &[u8]) -> Result<Vec<u8>, WireError> {
    if body.len() > MAX_BODY_SIZE {
        return Err(WireError::FrameTooLarge { size: body.len() });
    }

    let header = FrameHeader {
        length: (HEADER_SIZE + body.len()) as u32,
        checksum: crc32c::crc32c(body),
    };
    let mut frame = Vec::with_capacity(header.length as usize);
    header.write_to(&mut frame);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Body of the frame at the start of `data`.
///
/// Unlike [`try_deserialize_frame`], a short buffer is an error here.
pub fn deserialize_frame(data: &[u8]) -> Result<Vec<u8>, WireError> {
    let header = FrameHeader::deserialize(data)?;

    let expected_len = header.length as usize;
    if data.len() < expected_len {
        return Err(WireError::InsufficientData {
            needed: expected_len,
            have: data.len(),
        });
    }

    verified_body(&header, &data[HEADER_SIZE..expected_len])
}

/// Pop the first frame off a receive buffer.
///
/// Yields the body and the number of bytes it used, or `None` while the
/// frame is still incomplete.
pub fn try_deserialize_frame(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, WireError> {
    if data.len() < HEADER_SIZE {
        return Ok(None);
    }

    let header = FrameHeader::deserialize(data)?;

    let expected_len = header.length as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    let body = verified_body(&header, &data[HEADER_SIZE..expected_len])?;
    Ok(Some((body, expected_len)))
}

fn verified_body(header: &FrameHeader, body: &[u8]) -> Result<Vec<u8>, WireError> {
    let computed = crc32c::crc32c(body);
    if computed != header.checksum {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual: computed,
        });
    }
    Ok(body.to_vec())
}
