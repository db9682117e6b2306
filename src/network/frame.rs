//! Frame Assembly
//!
//! Turns the raw inbound byte stream of an established session into complete
//! frames. A frame is `[opcode][length?][payload]`: the opcode byte is
//! obfuscated by the session cipher, and the payload length is either fixed
//! per opcode or carried in a one or two byte prefix.
//!
//! Partial frames stay in the buffer until the rest arrives. The assembler
//! remembers the opcode and length it has already consumed so that a frame
//! spread across several reads draws exactly one cipher value.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::core::{IsaacCipher, ReadBuffer};

/// Largest variable-length payload a client may send.
pub const MAX_FRAME_LEN: usize = 5000;

/// Framing failures. Each one closes the offending session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Variable-length frame above [`MAX_FRAME_LEN`].
    #[error("frame {opcode} declares {length} bytes (max {MAX_FRAME_LEN})")]
    TooLong {
        /// Decoded opcode.
        opcode: u8,
        /// Declared payload length.
        length: usize,
    },
}

// =============================================================================
// SIZE TABLE
// =============================================================================

/// How the payload length of an opcode is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSize {
    /// Payload is always this many bytes.
    Fixed(u16),
    /// One length byte precedes the payload.
    VariableByte,
    /// Two big-endian length bytes precede the payload.
    VariableShort,
}

/// Inbound frame sizes of the revision 317 client.
/// `-1` is a byte-prefixed variable frame, `-2` a short-prefixed one.
#[rustfmt::skip]
const LEGACY_SIZES: [i8; 256] = [
     0,  0,  0,  1, -1,  0,  0,  0,  0,  0,  0,  0,  0,  0,  8,  0,
     6,  2,  2,  0,  0,  2,  0,  6,  0, 12,  0,  0,  0,  0,  0,  0,
     0,  0,  0,  8,  4,  0,  0,  2,  2,  6,  0,  6,  0, -1,  0,  0,
     0,  0,  0,  0,  0, 12,  0,  0,  0,  8,  8, 12,  8,  8,  0,  0,
     0,  0,  0,  0,  0,  0,  6,  0,  2,  2,  8,  6,  0, -1,  0,  6,
     0,  0,  0,  0,  0,  1,  4,  6,  0,  0,  0,  0,  0,  0,  0,  3,
     0,  0, -1,  0,  0, 13,  0, -1,  0,  0,  0,  0,  0,  0,  0,  0,
     0,  0,  0,  0,  0,  6,  0,  0,  1,  0,  6,  0,  0,  0, -1,  0,
     2,  6,  0,  4,  6,  8,  0,  6,  0,  0,  0,  2,  0,  0,  0,  0,
     0,  6,  0,  0,  0,  0,  0,  0,  1,  2,  0,  2,  6,  0,  0,  0,
     0,  0,  0,  0, -1, -1,  0,  0,  0,  0,  0,  0,  0,  0,  0,  0,
     0,  0,  0,  0,  0,  8,  0,  3,  0,  2,  0,  0,  8,  1,  0,  0,
    12,  0,  0,  0,  0,  0,  0,  0,  2,  0,  0,  0,  0,  0,  0,  0,
     4,  0,  4,  0,  0,  0,  7,  8,  0,  0, 10,  0,  0,  0,  0,  0,
     0,  0, -1,  0,  6,  0,  1,  0,  0,  0,  6,  0,  6,  8,  1,  0,
     0,  4,  0,  0,  0,  0, -1,  0, -1,  4,  0,  0,  6,  6,  0,  0,
];

/// Per-opcode frame size table.
#[derive(Debug, Clone)]
pub struct FrameSizes {
    sizes: [FrameSize; 256],
}

impl FrameSizes {
    /// Table where every opcode is an empty fixed frame.
    pub fn empty() -> Self {
        Self {
            sizes: [FrameSize::Fixed(0); 256],
        }
    }

    /// The revision 317 client table.
    pub fn legacy() -> Self {
        let mut sizes = [FrameSize::Fixed(0); 256];
        for (slot, &raw) in sizes.iter_mut().zip(LEGACY_SIZES.iter()) {
            *slot = match raw {
                -1 => FrameSize::VariableByte,
                -2 => FrameSize::VariableShort,
                n => FrameSize::Fixed(n as u16),
            };
        }
        Self { sizes }
    }

    /// Size rule for `opcode`.
    #[inline]
    pub fn get(&self, opcode: u8) -> FrameSize {
        self.sizes[opcode as usize]
    }

    /// Override the size rule for `opcode`.
    pub fn set(&mut self, opcode: u8, size: FrameSize) {
        self.sizes[opcode as usize] = size;
    }
}

impl Default for FrameSizes {
    fn default() -> Self {
        Self::legacy()
    }
}

// =============================================================================
// FRAMES
// =============================================================================

/// One complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// De-obfuscated opcode.
    pub opcode: u8,
    /// Payload bytes, without header.
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame from parts.
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True for header-only frames.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Reader positioned at the start of the payload.
    pub fn reader(&self) -> ReadBuffer<'_> {
        ReadBuffer::new(&self.payload)
    }
}

/// Incremental frame parser for one session.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    opcode: Option<u8>,
    length: Option<usize>,
}

impl FrameAssembler {
    /// Create an assembler with no frame in progress.
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a frame header has been consumed but its payload has not.
    pub fn is_partial(&self) -> bool {
        self.opcode.is_some()
    }

    /// Pull the next complete frame out of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; whatever was consumed so
    /// far is remembered for the next call.
    pub fn next_frame(
        &mut self,
        buf: &mut BytesMut,
        cipher: &mut IsaacCipher,
        sizes: &FrameSizes,
    ) -> Result<Option<Frame>, FrameError> {
        let opcode = match self.opcode {
            Some(opcode) => opcode,
            None => {
                if !buf.has_remaining() {
                    return Ok(None);
                }
                let opcode = buf.get_u8().wrapping_sub(cipher.next_u32() as u8);
                self.opcode = Some(opcode);
                opcode
            }
        };

        let length = match self.length {
            Some(length) => length,
            None => {
                let length = match sizes.get(opcode) {
                    FrameSize::Fixed(n) => n as usize,
                    FrameSize::VariableByte => {
                        if buf.remaining() < 1 {
                            return Ok(None);
                        }
                        buf.get_u8() as usize
                    }
                    FrameSize::VariableShort => {
                        if buf.remaining() < 2 {
                            return Ok(None);
                        }
                        buf.get_u16() as usize
                    }
                };
                if length > MAX_FRAME_LEN {
                    return Err(FrameError::TooLong { opcode, length });
                }
                self.length = Some(length);
                length
            }
        };

        if buf.remaining() < length {
            return Ok(None);
        }

        let payload = buf.split_to(length).freeze();
        self.opcode = None;
        self.length = None;
        Ok(Some(Frame { opcode, payload }))
    }
}
