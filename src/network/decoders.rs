//! Built-in Decoders
//!
//! Decoders for the protocol messages every world needs regardless of
//! content: walking, camera rotation and typed commands.

use tracing::debug;

use crate::core::{ByteOrder, ReadBuffer, ValueType};
use crate::game::entity::{Command, Entity, Player, Position};
use crate::network::dispatch::{DecodeError, PacketDecoder};
use crate::network::frame::Frame;

/// Minimap click.
pub const WALK_MINIMAP: u8 = 248;
/// Yellow-x ground click.
pub const WALK_GROUND: u8 = 164;
/// Red-x click on an object or entity.
pub const WALK_INTERACT: u8 = 98;
/// Arrow-key camera rotation.
pub const CAMERA_ROTATION: u8 = 86;
/// `::command` input.
pub const COMMAND: u8 = 103;

/// Anti-cheat trailer appended to minimap clicks.
const MINIMAP_TRAILER: usize = 14;

/// All built-in decoders.
pub fn builtin() -> Vec<Box<dyn PacketDecoder>> {
    vec![
        Box::new(WalkDecoder),
        Box::new(CameraDecoder),
        Box::new(CommandDecoder),
    ]
}

/// Walking requests.
///
/// Layout: first step X (`u16`, A, little-endian), N pairs of signed byte
/// offsets from the first step, first step Y (`u16`, little-endian), run
/// flag (`u8`, C).
#[derive(Debug, Clone, Copy)]
pub struct WalkDecoder;

impl PacketDecoder for WalkDecoder {
    fn opcodes(&self) -> &'static [u8] {
        &[WALK_MINIMAP, WALK_GROUND, WALK_INTERACT]
    }

    fn decode(&self, player: &mut Player, frame: &Frame, buf: &mut ReadBuffer<'_>) -> Result<(), DecodeError> {
        let mut length = frame.len();
        if frame.opcode == WALK_MINIMAP {
            length = length.checked_sub(MINIMAP_TRAILER).ok_or_else(|| DecodeError::Malformed {
                opcode: frame.opcode,
                reason: format!("minimap click of {} bytes", frame.len()),
            })?;
        }

        // Clicking away interrupts whatever the player was doing. A red-x
        // click walks towards the target, so it leaves skilling alone.
        if frame.opcode != WALK_INTERACT {
            player.activity.clear_all();
        }

        if player.movement.is_locked() {
            return Ok(());
        }

        if length < 5 {
            return Err(DecodeError::Malformed {
                opcode: frame.opcode,
                reason: format!("walk payload of {} bytes", length),
            });
        }
        let steps = (length - 5) / 2;

        let first_x = buf.read_u16(ValueType::A, ByteOrder::Little)?;
        let mut offsets = Vec::with_capacity(steps);
        for _ in 0..steps {
            let dx = buf.read_i8(ValueType::Standard)?;
            let dy = buf.read_i8(ValueType::Standard)?;
            offsets.push((dx, dy));
        }
        let first_y = buf.read_u16(ValueType::Standard, ByteOrder::Little)?;
        let run = buf.read_u8(ValueType::C)? == 1;

        let z = player.position.z;
        player.movement.begin_path(player.position, run);
        player.movement.add_to_path(Position::new(first_x, first_y, z));
        for (dx, dy) in offsets {
            let x = first_x.wrapping_add_signed(dx as i16);
            let y = first_y.wrapping_add_signed(dy as i16);
            player.movement.add_to_path(Position::new(x, y, z));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "walk"
    }
}

/// Camera rotation. Accepted and ignored.
#[derive(Debug, Clone, Copy)]
pub struct CameraDecoder;

impl PacketDecoder for CameraDecoder {
    fn opcodes(&self) -> &'static [u8] {
        &[CAMERA_ROTATION]
    }

    fn decode(&self, _player: &mut Player, _frame: &Frame, _buf: &mut ReadBuffer<'_>) -> Result<(), DecodeError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "camera"
    }
}

/// Typed commands, queued on the player for content.
#[derive(Debug, Clone, Copy)]
pub struct CommandDecoder;

impl PacketDecoder for CommandDecoder {
    fn opcodes(&self) -> &'static [u8] {
        &[COMMAND]
    }

    fn decode(&self, player: &mut Player, _frame: &Frame, buf: &mut ReadBuffer<'_>) -> Result<(), DecodeError> {
        let raw = buf.read_string()?;
        if let Some(command) = Command::parse(&raw) {
            if let Some(dropped) = player.queue_command(command) {
                debug!(player = %player.key(), "Command queue full, dropped ::{}", dropped.name);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "command"
    }
}
