//! Content Contract
//!
//! Game mechanics plug into the engine through [`Content`]. Every hook has a
//! no-op default, so a content crate implements only what it needs.
//!
//! Hook threading:
//! - `pulse_*`, `on_login`, `on_logout` run serially on the engine thread
//! - `update_player`, `reset_*` run on the worker pool, one entity per task

use thiserror::Error;

use crate::game::entity::{Entity, EntityKey, Npc, Player, Position, UpdateFlags};
use crate::game::task::{Scheduler, Task, TaskHandle};
use crate::game::world::{RegistryOps, World};
use crate::network::dispatch::{DecodeError, PacketDecoder};
use crate::network::encoder::EncodeError;
use crate::network::handshake::{LoginRequest, LoginResponse};

/// Per-entity failure. The entity is removed; the tick carries on.
#[derive(Debug, Error)]
pub enum EntityError {
    /// A frame could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    /// Outbound packets could not be framed.
    #[error("encode failed: {0}")]
    Encode(#[from] EncodeError),

    /// Content reported a failure.
    #[error("{0}")]
    Content(String),

    /// Content panicked.
    #[error("panicked: {0}")]
    Panicked(String),
}

impl EntityError {
    /// Content failure with a message.
    pub fn content(message: impl Into<String>) -> Self {
        EntityError::Content(message.into())
    }
}

// =============================================================================
// PULSE CONTEXT
// =============================================================================

/// What serial hooks may do besides mutating their own entity.
///
/// Registry changes are deferred until the pulse step ends.
pub struct PulseContext<'a> {
    tick: u64,
    scheduler: &'a mut Scheduler,
    registry: &'a mut RegistryOps,
}

impl<'a> PulseContext<'a> {
    /// Context for one serial step.
    pub fn new(tick: u64, scheduler: &'a mut Scheduler, registry: &'a mut RegistryOps) -> Self {
        Self {
            tick,
            scheduler,
            registry,
        }
    }

    /// Current tick number.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Schedule a task. It is first counted down on the next tick.
    pub fn submit(&mut self, task: Task) -> TaskHandle {
        self.scheduler.submit(task)
    }

    /// Spawn an npc once the pulse step ends.
    pub fn spawn_npc(&mut self, npc: Npc) {
        self.registry.register_npc(npc);
    }

    /// Remove an entity once the pulse step ends.
    pub fn unregister(&mut self, key: EntityKey) {
        self.registry.unregister(key);
    }
}

// =============================================================================
// WORLD VIEW
// =============================================================================

/// Read-only facts about one entity at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySnapshot {
    /// Entity key.
    pub key: EntityKey,
    /// Tile at snapshot time.
    pub position: Position,
    /// Update markers raised this tick.
    pub update_flags: UpdateFlags,
}

impl EntitySnapshot {
    fn of<T: Entity>(entity: &T) -> Self {
        Self {
            key: entity.key(),
            position: entity.position(),
            update_flags: entity.update_flags(),
        }
    }
}

/// Snapshot of every live entity, taken once after the serial steps and
/// shared by all update tasks of the tick.
#[derive(Debug, Clone, Default)]
pub struct WorldView {
    tick: u64,
    players: Vec<EntitySnapshot>,
    npcs: Vec<EntitySnapshot>,
}

impl WorldView {
    /// Snapshot `world`.
    pub fn capture(tick: u64, world: &World) -> Self {
        Self {
            tick,
            players: world.players().map(EntitySnapshot::of).collect(),
            npcs: world.npcs().map(EntitySnapshot::of).collect(),
        }
    }

    /// Tick the snapshot was taken on.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Every player, in slot order.
    pub fn players(&self) -> &[EntitySnapshot] {
        &self.players
    }

    /// Every npc, in slot order.
    pub fn npcs(&self) -> &[EntitySnapshot] {
        &self.npcs
    }

    /// Players visible from `position`.
    pub fn players_near(&self, position: Position) -> impl Iterator<Item = &EntitySnapshot> {
        self.players
            .iter()
            .filter(move |snapshot| snapshot.position.is_viewable_from(&position))
    }

    /// Npcs visible from `position`.
    pub fn npcs_near(&self, position: Position) -> impl Iterator<Item = &EntitySnapshot> {
        self.npcs
            .iter()
            .filter(move |snapshot| snapshot.position.is_viewable_from(&position))
    }
}

// =============================================================================
// CONTENT
// =============================================================================

/// Game content hooks.
pub trait Content: Send + Sync + 'static {
    /// Per-tick player logic, after movement.
    fn pulse_player(&self, _player: &mut Player, _ctx: &mut PulseContext<'_>) -> Result<(), EntityError> {
        Ok(())
    }

    /// Per-tick npc logic, after movement.
    fn pulse_npc(&self, _npc: &mut Npc, _ctx: &mut PulseContext<'_>) -> Result<(), EntityError> {
        Ok(())
    }

    /// Build this player's view of the world. Packets queued here are sent
    /// right after the hook returns.
    fn update_player(&self, _player: &mut Player, _view: &WorldView) -> Result<(), EntityError> {
        Ok(())
    }

    /// End-of-tick player cleanup.
    fn reset_player(&self, _player: &mut Player) -> Result<(), EntityError> {
        Ok(())
    }

    /// End-of-tick npc cleanup.
    fn reset_npc(&self, _npc: &mut Npc) -> Result<(), EntityError> {
        Ok(())
    }

    /// Accept or refuse a login. The player is not registered yet; set
    /// `rights` or position here.
    fn on_login(&self, _player: &mut Player, _request: &LoginRequest) -> Result<(), LoginResponse> {
        Ok(())
    }

    /// A player left the world.
    fn on_logout(&self, _player: &Player) {}

    /// Extra decoders, registered after the built-ins.
    fn decoders(&self) -> Vec<Box<dyn PacketDecoder>> {
        Vec::new()
    }
}

/// Content with no behavior at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContent;

impl Content for NoContent {}
