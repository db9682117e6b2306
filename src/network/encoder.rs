//! Packet Encoder
//!
//! The single place that frames outbound payloads. Game logic builds payload
//! bytes and queues an [`OutboundPacket`] on the player; the encoder prefixes
//! the obfuscated opcode and length header and appends the result to the
//! session's outbound buffer.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::core::WriteBuffer;
use crate::game::entity::Player;
use crate::network::frame::FrameSize;
use crate::network::session::{Session, SessionError};

/// Encoder failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Fixed packet built with the wrong payload size.
    #[error("packet {opcode} expects {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Packet opcode.
        opcode: u8,
        /// Declared size.
        expected: usize,
        /// Built size.
        actual: usize,
    },

    /// Variable packet too long for its length prefix.
    #[error("packet {opcode} is {length} bytes, prefix allows {max}")]
    TooLong {
        /// Packet opcode.
        opcode: u8,
        /// Built size.
        length: usize,
        /// Largest size the prefix can carry.
        max: usize,
    },

    /// Framed packet sent before the session has a cipher.
    #[error("session has no cipher")]
    NoCipher,

    /// Session refused the bytes.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// A payload waiting to be framed and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    header: Option<(u8, FrameSize)>,
    payload: Bytes,
}

impl OutboundPacket {
    /// Packet with a fixed-size payload.
    pub fn fixed(opcode: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let size = FrameSize::Fixed(payload.len().min(u16::MAX as usize) as u16);
        Self {
            header: Some((opcode, size)),
            payload,
        }
    }

    /// Packet whose size must match `size` exactly when encoded.
    pub fn sized(opcode: u8, size: FrameSize, payload: impl Into<Bytes>) -> Self {
        Self {
            header: Some((opcode, size)),
            payload: payload.into(),
        }
    }

    /// Packet with a one byte length prefix.
    pub fn variable_byte(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self::sized(opcode, FrameSize::VariableByte, payload)
    }

    /// Packet with a two byte length prefix.
    pub fn variable_short(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self::sized(opcode, FrameSize::VariableShort, payload)
    }

    /// Bytes sent as-is, with no header. Used during login.
    pub fn raw(payload: impl Into<Bytes>) -> Self {
        Self {
            header: None,
            payload: payload.into(),
        }
    }

    /// Chatbox message.
    pub fn message(text: &str) -> Self {
        let mut buf = WriteBuffer::with_capacity(text.len() + 1);
        buf.write_string(text);
        Self::variable_byte(253, buf.freeze())
    }

    /// Tells the client to return to the title screen.
    pub fn logout() -> Self {
        Self::fixed(109, Bytes::new())
    }

    /// Opcode, `None` for raw packets.
    pub fn opcode(&self) -> Option<u8> {
        self.header.map(|(opcode, _)| opcode)
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn check_length(&self) -> Result<(), EncodeError> {
        let Some((opcode, size)) = self.header else {
            return Ok(());
        };
        let length = self.payload.len();
        match size {
            FrameSize::Fixed(expected) if expected as usize != length => Err(EncodeError::LengthMismatch {
                opcode,
                expected: expected as usize,
                actual: length,
            }),
            FrameSize::VariableByte if length > u8::MAX as usize => Err(EncodeError::TooLong {
                opcode,
                length,
                max: u8::MAX as usize,
            }),
            FrameSize::VariableShort if length > u16::MAX as usize => Err(EncodeError::TooLong {
                opcode,
                length,
                max: u16::MAX as usize,
            }),
            _ => Ok(()),
        }
    }
}

/// Frames packets onto sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketEncoder;

impl PacketEncoder {
    /// Create an encoder.
    pub fn new() -> Self {
        Self
    }

    /// Frame `packet` and queue it on `session`.
    pub fn encode(&self, session: &Session, packet: &OutboundPacket) -> Result<(), EncodeError> {
        packet.check_length()?;

        let Some((opcode, size)) = packet.header else {
            session.queue_raw(&packet.payload)?;
            return Ok(());
        };

        // The opcode key and the append happen under one encryptor lock, so
        // wire order always matches cipher order.
        session
            .with_encryptor(|cipher| {
                let mut out = BytesMut::with_capacity(packet.payload.len() + 3);
                out.put_u8(opcode.wrapping_add(cipher.next_u32() as u8));
                match size {
                    FrameSize::Fixed(_) => {}
                    FrameSize::VariableByte => out.put_u8(packet.payload.len() as u8),
                    FrameSize::VariableShort => out.put_u16(packet.payload.len() as u16),
                }
                out.put_slice(&packet.payload);
                session.queue_raw(&out)
            })
            .ok_or(EncodeError::NoCipher)?
            .map_err(EncodeError::from)
    }

    /// Send everything in the player's outbox. Returns the number sent.
    ///
    /// A player without a session drops its outbox.
    pub fn flush(&self, player: &mut Player) -> Result<usize, EncodeError> {
        let packets = player.take_outbox();
        let Some(session) = player.session() else {
            return Ok(0);
        };
        for packet in &packets {
            self.encode(session, packet)?;
        }
        Ok(packets.len())
    }
}
