//! Value Transforms and Byte Orders
//!
//! The legacy wire format obfuscates individual values: the least significant
//! byte of every field is passed through a reversible transform, and multi-byte
//! fields may be laid out in one of four byte orders.

/// Reversible transform applied to the least significant byte of a value.
///
/// All arithmetic wraps at the byte width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ValueType {
    /// No transform.
    #[default]
    Standard,
    /// Additive offset: `v + 128` on the wire.
    A,
    /// Negation: `-v` on the wire.
    C,
    /// Subtractive offset: `128 - v` on the wire.
    S,
}

impl ValueType {
    /// Every supported transform.
    pub const ALL: [ValueType; 4] = [ValueType::Standard, ValueType::A, ValueType::C, ValueType::S];

    /// Apply the forward transform (logical byte -> wire byte).
    #[inline]
    pub fn encode(self, byte: u8) -> u8 {
        match self {
            ValueType::Standard => byte,
            ValueType::A => byte.wrapping_add(128),
            ValueType::C => byte.wrapping_neg(),
            ValueType::S => 128u8.wrapping_sub(byte),
        }
    }

    /// Apply the inverse transform (wire byte -> logical byte).
    #[inline]
    pub fn decode(self, byte: u8) -> u8 {
        match self {
            ValueType::Standard => byte,
            ValueType::A => byte.wrapping_sub(128),
            ValueType::C => byte.wrapping_neg(),
            ValueType::S => 128u8.wrapping_sub(byte),
        }
    }
}

/// Byte layout of a multi-byte value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// Most significant byte first.
    #[default]
    Big,
    /// Least significant byte first.
    Little,
    /// 32-bit only: bytes at shifts `8, 0, 24, 16`.
    Middle,
    /// 32-bit only: bytes at shifts `16, 24, 0, 8`.
    InverseMiddle,
}

impl ByteOrder {
    /// Every supported byte order.
    pub const ALL: [ByteOrder; 4] = [
        ByteOrder::Big,
        ByteOrder::Little,
        ByteOrder::Middle,
        ByteOrder::InverseMiddle,
    ];

    /// Bit shifts of each wire byte, in wire order, for a value of `width` bytes.
    ///
    /// Returns `None` when the order is not defined for that width.
    pub fn shifts(self, width: usize) -> Option<&'static [u32]> {
        match (self, width) {
            (_, 1) => Some(&[0]),
            (ByteOrder::Big, 2) => Some(&[8, 0]),
            (ByteOrder::Little, 2) => Some(&[0, 8]),
            (ByteOrder::Big, 3) => Some(&[16, 8, 0]),
            (ByteOrder::Little, 3) => Some(&[0, 8, 16]),
            (ByteOrder::Big, 4) => Some(&[24, 16, 8, 0]),
            (ByteOrder::Little, 4) => Some(&[0, 8, 16, 24]),
            (ByteOrder::Middle, 4) => Some(&[8, 0, 24, 16]),
            (ByteOrder::InverseMiddle, 4) => Some(&[16, 24, 0, 8]),
            (ByteOrder::Big, 8) => Some(&[56, 48, 40, 32, 24, 16, 8, 0]),
            (ByteOrder::Little, 8) => Some(&[0, 8, 16, 24, 32, 40, 48, 56]),
            _ => None,
        }
    }
}
