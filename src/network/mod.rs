//! Network Layer
//!
//! Socket I/O, the login handshake and the frame protocol. Nothing in here
//! mutates game state: the reactor hands everything to the engine as
//! [`NetworkEvent`]s, and the engine calls back into the encoder.

pub mod frame;
pub mod dispatch;
pub mod decoders;
pub mod encoder;
pub mod handshake;
pub mod session;
pub mod reactor;

pub use frame::{Frame, FrameAssembler, FrameError, FrameSize, FrameSizes, MAX_FRAME_LEN};
pub use dispatch::{DecodeError, DecoderRegistry, Dispatch, PacketDecoder};
pub use encoder::{EncodeError, OutboundPacket, PacketEncoder};
pub use handshake::{Handshake, HandshakeError, HandshakeStep, LoginRequest, LoginResponse};
pub use session::{Session, SessionError, SessionId, SessionState};
pub use reactor::{NetworkEvent, Reactor, ReactorHandle};
