//! Game Logic Module
//!
//! The authoritative simulation. Everything in here is mutated by the engine
//! thread, except during the parallel phases, when each worker holds exactly
//! one entity.
//!
//! ## Module Structure
//!
//! - `entity`: Players, npcs, positions, flags and movement
//! - `world`: Entity registry with generational keys
//! - `task`: Deferred task scheduler
//! - `phase`: Countdown latch and parallel-for-with-barrier
//! - `content`: Hooks for game content
//! - `engine`: Tick orchestrator and tick clock

pub mod entity;
pub mod world;
pub mod task;
pub mod phase;
pub mod content;
pub mod engine;

// Re-export key types
pub use entity::{
    Activity, ActivityFlags, Command, Direction, Entity, EntityKey, EntityKind, MovementQueue, Npc, Player,
    Position, UpdateFlag, UpdateFlags,
};
pub use world::{EntityList, RegistryOps, Removed, World, WorldError};
pub use task::{Scheduler, Task, TaskContext, TaskError, TaskHandle, WorkRate};
pub use phase::{CountdownLatch, Phase, PhaseReport, WorkerPool};
pub use content::{Content, EntityError, NoContent, PulseContext, WorldView};
pub use engine::{Engine, EngineHandle, OverrunPolicy, TickClock, TickReport};
