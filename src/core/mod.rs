//! Wire-level primitives.
//!
//! Value transforms, byte orders, packet buffers and the session cipher.
//! Nothing in here knows about sessions or entities.

pub mod value;
pub mod buffer;
pub mod isaac;

// Re-export core types
pub use value::{ByteOrder, ValueType};
pub use buffer::{CodecError, ReadBuffer, WriteBuffer, STRING_TERMINATOR};
pub use isaac::IsaacCipher;
