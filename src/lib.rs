//! # RS2 Engine
//!
//! Tick-driven game server core for the legacy RS2 (revision 317) binary
//! protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        RS2 ENGINE                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Wire primitives                          │
//! │  ├── value.rs     - Value transforms and byte orders         │
//! │  ├── buffer.rs    - Read/write buffers, bit access           │
//! │  └── isaac.rs     - ISAAC stream cipher                      │
//! │                                                              │
//! │  game/            - Simulation (engine thread + workers)     │
//! │  ├── entity.rs    - Players, npcs, flags, movement           │
//! │  ├── world.rs     - Entity registry                          │
//! │  ├── task.rs      - Deferred task scheduler                  │
//! │  ├── phase.rs     - Countdown latch, parallel phases         │
//! │  ├── content.rs   - Game content hooks                       │
//! │  └── engine.rs    - Tick orchestrator                        │
//! │                                                              │
//! │  network/         - I/O (reactor thread)                     │
//! │  ├── frame.rs     - Frame sizes and assembly                 │
//! │  ├── dispatch.rs  - Opcode -> decoder table                  │
//! │  ├── decoders.rs  - Built-in decoders                        │
//! │  ├── encoder.rs   - Outbound packet framing                  │
//! │  ├── handshake.rs - Login exchange                           │
//! │  ├── session.rs   - Per-connection shared state              │
//! │  └── reactor.rs   - Socket event loop                        │
//! │                                                              │
//! │  config.rs        - Server configuration                     │
//! │  server.rs        - start() / shutdown()                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! - **reactor**: one thread, owns every socket, never touches game state
//! - **engine**: one thread, the only writer of the world
//! - **worker-N**: fixed pool, one entity per task during parallel phases
//!
//! The reactor and the engine share two things: the bounded ingress queue
//! and each connection's [`network::Session`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod config;
pub mod server;

// Re-export commonly used types
pub use crate::config::{ConfigError, ServerConfig};
pub use crate::core::{ByteOrder, ReadBuffer, ValueType, WriteBuffer};
pub use crate::game::{Content, Engine, NoContent, Npc, Player, Position, World};
pub use crate::network::{Frame, OutboundPacket, PacketDecoder};
pub use crate::server::{Server, StartupError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tick period (ms)
pub const TICK_PERIOD_MS: u64 = 600;

/// Client revision spoken by default
pub const REVISION: u16 = config::DEFAULT_REVISION;
