//! Opcode Dispatch
//!
//! Maps each opcode to the decoder that owns it. The table is built once at
//! startup from an explicit decoder list and never changes afterwards, so a
//! lookup is a single array index. Opcodes with no decoder are discarded.

use thiserror::Error;
use tracing::debug;

use crate::config::ConfigError;
use crate::core::{CodecError, ReadBuffer};
use crate::game::entity::Player;
use crate::network::decoders;
use crate::network::frame::Frame;

/// Failure while decoding a frame body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Payload was shorter than its fields.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Payload was well-formed bytes but nonsense.
    #[error("malformed frame {opcode}: {reason}")]
    Malformed {
        /// Frame opcode.
        opcode: u8,
        /// What was wrong.
        reason: String,
    },
}

/// Decodes the frames of one or more opcodes against the owning player.
pub trait PacketDecoder: Send + Sync {
    /// Opcodes this decoder owns.
    fn opcodes(&self) -> &'static [u8];

    /// Apply `frame` to `player`. `buf` is positioned at the payload start.
    fn decode(&self, player: &mut Player, frame: &Frame, buf: &mut ReadBuffer<'_>) -> Result<(), DecodeError>;

    /// Name used in logs.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// What happened to a dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A decoder ran.
    Handled,
    /// No decoder owns the opcode; the frame was dropped.
    Discarded,
}

/// Immutable opcode -> decoder table.
pub struct DecoderRegistry {
    slots: [Option<usize>; 256],
    decoders: Vec<Box<dyn PacketDecoder>>,
}

impl DecoderRegistry {
    /// Build a table from `decoders`.
    ///
    /// Fails if two decoders claim the same opcode.
    pub fn new(decoders: Vec<Box<dyn PacketDecoder>>) -> Result<Self, ConfigError> {
        let mut slots: [Option<usize>; 256] = [None; 256];
        for (index, decoder) in decoders.iter().enumerate() {
            for &opcode in decoder.opcodes() {
                let slot = &mut slots[opcode as usize];
                if let Some(existing) = *slot {
                    let existing: &dyn PacketDecoder = decoders[existing].as_ref();
                    return Err(ConfigError::DuplicateOpcode {
                        opcode,
                        first: existing.name(),
                        second: decoder.name(),
                    });
                }
                *slot = Some(index);
            }
        }
        Ok(Self { slots, decoders })
    }

    /// Built-in protocol decoders followed by `extra`.
    pub fn with_builtins(extra: Vec<Box<dyn PacketDecoder>>) -> Result<Self, ConfigError> {
        let mut all = decoders::builtin();
        all.extend(extra);
        Self::new(all)
    }

    /// True if some decoder owns `opcode`.
    pub fn contains(&self, opcode: u8) -> bool {
        self.slots[opcode as usize].is_some()
    }

    /// Number of opcodes with a decoder.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// True if no opcode has a decoder.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode `frame` against `player`.
    pub fn dispatch(&self, player: &mut Player, frame: &Frame) -> Result<Dispatch, DecodeError> {
        let Some(index) = self.slots[frame.opcode as usize] else {
            debug!(opcode = frame.opcode, len = frame.len(), player = %player, "Discarding unknown opcode");
            return Ok(Dispatch::Discarded);
        };
        let mut buf = frame.reader();
        self.decoders[index].decode(player, frame, &mut buf)?;
        Ok(Dispatch::Handled)
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("decoders", &self.decoders.len())
            .field("opcodes", &self.len())
            .finish()
    }
}
