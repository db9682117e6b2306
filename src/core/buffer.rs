//! Packet Buffers
//!
//! `ReadBuffer` decodes logical integers from a frame body, undoing the value
//! transform and byte order the sender used. `WriteBuffer` is the mirror image,
//! plus the bit-access mode used by entity update blocks.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::value::{ByteOrder, ValueType};

/// Byte terminating strings on the wire.
pub const STRING_TERMINATOR: u8 = 10;

/// Codec failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Not enough bytes left for the requested read.
    #[error("buffer underflow: needed {needed} bytes, {remaining} remaining")]
    Underflow {
        /// Bytes the read required.
        needed: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// Byte order is not defined for this width.
    #[error("byte order {order:?} is not supported for {width}-byte values")]
    UnsupportedOrder {
        /// Requested order.
        order: ByteOrder,
        /// Width of the value in bytes.
        width: usize,
    },

    /// String ran off the end of the buffer.
    #[error("string is missing its terminator")]
    UnterminatedString,

    /// Bit writes must be 1..=32 bits wide.
    #[error("invalid bit count {0}")]
    InvalidBitCount(u32),

    /// Bit write outside of bit-access mode.
    #[error("bit access has not been started")]
    NotInBitAccess,
}

// =============================================================================
// READ BUFFER
// =============================================================================

/// Cursor over an inbound frame body.
#[derive(Debug, Clone)]
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ReadBuffer<'a> {
    /// Wrap a frame body.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    /// Current read offset.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Underflow {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.data[start..start + len])
    }

    /// Read a `width`-byte value, undoing `value_type` on its low byte.
    pub fn read_value(
        &mut self,
        width: usize,
        value_type: ValueType,
        order: ByteOrder,
    ) -> Result<u64, CodecError> {
        let shifts = order
            .shifts(width)
            .ok_or(CodecError::UnsupportedOrder { order, width })?;
        let bytes = self.take(width)?;

        let mut value = 0u64;
        for (&byte, &shift) in bytes.iter().zip(shifts) {
            let byte = if shift == 0 { value_type.decode(byte) } else { byte };
            value |= (byte as u64) << shift;
        }
        Ok(value)
    }

    /// Read an unsigned byte.
    pub fn read_u8(&mut self, value_type: ValueType) -> Result<u8, CodecError> {
        Ok(self.read_value(1, value_type, ByteOrder::Big)? as u8)
    }

    /// Read a signed byte.
    pub fn read_i8(&mut self, value_type: ValueType) -> Result<i8, CodecError> {
        Ok(self.read_u8(value_type)? as i8)
    }

    /// Read an unsigned short.
    pub fn read_u16(&mut self, value_type: ValueType, order: ByteOrder) -> Result<u16, CodecError> {
        Ok(self.read_value(2, value_type, order)? as u16)
    }

    /// Read a signed short.
    pub fn read_i16(&mut self, value_type: ValueType, order: ByteOrder) -> Result<i16, CodecError> {
        Ok(self.read_u16(value_type, order)? as i16)
    }

    /// Read an unsigned int.
    pub fn read_u32(&mut self, value_type: ValueType, order: ByteOrder) -> Result<u32, CodecError> {
        Ok(self.read_value(4, value_type, order)? as u32)
    }

    /// Read a signed int.
    pub fn read_i32(&mut self, value_type: ValueType, order: ByteOrder) -> Result<i32, CodecError> {
        Ok(self.read_u32(value_type, order)? as i32)
    }

    /// Read a long (big or little endian only).
    pub fn read_u64(&mut self, order: ByteOrder) -> Result<u64, CodecError> {
        self.read_value(8, ValueType::Standard, order)
    }

    /// Read raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    /// Read a string up to (and consuming) the terminator byte.
    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == STRING_TERMINATOR)
            .ok_or(CodecError::UnterminatedString)?;
        let text = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(text)
    }
}

// =============================================================================
// WRITE BUFFER
// =============================================================================

/// Growable outbound payload builder.
#[derive(Debug, Default, Clone)]
pub struct WriteBuffer {
    buf: BytesMut,
    bit_position: Option<usize>,
}

impl WriteBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer with reserved capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            bit_position: None,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// View the written bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Finish the buffer.
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }

    /// Write a `width`-byte value, applying `value_type` to its low byte.
    pub fn write_value(
        &mut self,
        value: u64,
        width: usize,
        value_type: ValueType,
        order: ByteOrder,
    ) -> Result<(), CodecError> {
        let shifts = order
            .shifts(width)
            .ok_or(CodecError::UnsupportedOrder { order, width })?;
        for &shift in shifts {
            let byte = (value >> shift) as u8;
            let byte = if shift == 0 { value_type.encode(byte) } else { byte };
            self.buf.put_u8(byte);
        }
        Ok(())
    }

    /// Write a byte.
    pub fn write_u8(&mut self, value: u8, value_type: ValueType) {
        self.buf.put_u8(value_type.encode(value));
    }

    /// Write a short.
    pub fn write_u16(&mut self, value: u16, value_type: ValueType, order: ByteOrder) -> Result<(), CodecError> {
        self.write_value(value as u64, 2, value_type, order)
    }

    /// Write an int.
    pub fn write_u32(&mut self, value: u32, value_type: ValueType, order: ByteOrder) -> Result<(), CodecError> {
        self.write_value(value as u64, 4, value_type, order)
    }

    /// Write a long (big or little endian only).
    pub fn write_u64(&mut self, value: u64, order: ByteOrder) -> Result<(), CodecError> {
        self.write_value(value, 8, ValueType::Standard, order)
    }

    /// Write raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Write a terminated string.
    pub fn write_string(&mut self, text: &str) {
        self.buf.put_slice(text.as_bytes());
        self.buf.put_u8(STRING_TERMINATOR);
    }

    /// Switch to bit access, starting at the next whole byte.
    pub fn start_bit_access(&mut self) {
        self.bit_position = Some(self.buf.len() * 8);
    }

    /// Write the low `count` bits of `value`, most significant bit first.
    pub fn write_bits(&mut self, count: u32, value: u32) -> Result<(), CodecError> {
        if !(1..=32).contains(&count) {
            return Err(CodecError::InvalidBitCount(count));
        }
        let mut position = self.bit_position.ok_or(CodecError::NotInBitAccess)?;

        for bit in (0..count).rev() {
            let byte_index = position / 8;
            if byte_index >= self.buf.len() {
                self.buf.put_u8(0);
            }
            let mask = 0x80u8 >> (position % 8);
            if (value >> bit) & 1 == 1 {
                self.buf[byte_index] |= mask;
            } else {
                self.buf[byte_index] &= !mask;
            }
            position += 1;
        }

        self.bit_position = Some(position);
        Ok(())
    }

    /// Leave bit access; the next byte write starts on a byte boundary.
    pub fn finish_bit_access(&mut self) {
        if let Some(position) = self.bit_position.take() {
            self.buf.truncate(position.div_ceil(8));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(value: u32, width: usize, vt: ValueType, order: ByteOrder) -> Option<u64> {
        let mut out = WriteBuffer::new();
        out.write_value(value as u64, width, vt, order).ok()?;
        let bytes = out.freeze();
        assert_eq!(bytes.len(), width);
        let mut reader = ReadBuffer::new(&bytes);
        let decoded = reader.read_value(width, vt, order).ok()?;
        assert_eq!(reader.remaining(), 0);
        Some(decoded)
    }

    proptest! {
        #[test]
        fn test_round_trip_all_orders_and_transforms(value in any::<u32>()) {
            for vt in ValueType::ALL {
                for order in ByteOrder::ALL {
                    for (width, mask) in [(1usize, 0xffu64), (2, 0xffff), (4, 0xffff_ffff)] {
                        if order.shifts(width).is_none() {
                            continue;
                        }
                        let decoded = round_trip(value, width, vt, order);
                        prop_assert_eq!(decoded, Some(value as u64 & mask));
                    }
                }
            }
        }
    }

    #[test]
    fn test_additive_little_endian_full_short_range() {
        for value in 0..=u16::MAX {
            let mut out = WriteBuffer::new();
            out.write_u16(value, ValueType::A, ByteOrder::Little).unwrap();
            let bytes = out.freeze();
            let mut reader = ReadBuffer::new(&bytes);
            assert_eq!(reader.read_u16(ValueType::A, ByteOrder::Little).unwrap(), value);
        }
    }

    #[test]
    fn test_wire_layouts() {
        let value = 0x1122_3344u32;

        let mut out = WriteBuffer::new();
        out.write_u32(value, ValueType::Standard, ByteOrder::Middle).unwrap();
        assert_eq!(out.as_slice(), &[0x33, 0x44, 0x11, 0x22]);

        let mut out = WriteBuffer::new();
        out.write_u32(value, ValueType::Standard, ByteOrder::InverseMiddle).unwrap();
        assert_eq!(out.as_slice(), &[0x22, 0x11, 0x44, 0x33]);

        // Only the low byte is transformed.
        let mut out = WriteBuffer::new();
        out.write_u16(0x0102, ValueType::A, ByteOrder::Little).unwrap();
        assert_eq!(out.as_slice(), &[0x82, 0x01]);
    }

    #[test]
    fn test_u64_round_trip() {
        let mut out = WriteBuffer::new();
        out.write_u64(0x0102_0304_0506_0708, ByteOrder::Little).unwrap();
        let bytes = out.freeze();
        assert_eq!(bytes[0], 0x08);
        let mut reader = ReadBuffer::new(&bytes);
        assert_eq!(reader.read_u64(ByteOrder::Little).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_middle_order_rejected_for_short() {
        let mut out = WriteBuffer::new();
        assert_eq!(
            out.write_u16(1, ValueType::Standard, ByteOrder::Middle),
            Err(CodecError::UnsupportedOrder { order: ByteOrder::Middle, width: 2 })
        );
        assert!(out.is_empty());

        let mut reader = ReadBuffer::new(&[0, 0]);
        assert!(reader.read_u16(ValueType::Standard, ByteOrder::InverseMiddle).is_err());
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn test_underflow() {
        let mut reader = ReadBuffer::new(&[1, 2, 3]);
        assert_eq!(
            reader.read_u32(ValueType::Standard, ByteOrder::Big),
            Err(CodecError::Underflow { needed: 4, remaining: 3 })
        );
    }

    #[test]
    fn test_strings() {
        let mut out = WriteBuffer::new();
        out.write_string("tele 3222 3218");
        out.write_u8(7, ValueType::Standard);
        let bytes = out.freeze();

        let mut reader = ReadBuffer::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "tele 3222 3218");
        assert_eq!(reader.read_u8(ValueType::Standard).unwrap(), 7);

        let mut reader = ReadBuffer::new(b"no terminator");
        assert_eq!(reader.read_string(), Err(CodecError::UnterminatedString));
    }

    #[test]
    fn test_signed_reads() {
        let mut reader = ReadBuffer::new(&[0xff, 0x80, 0x00]);
        assert_eq!(reader.read_i8(ValueType::Standard).unwrap(), -1);
        assert_eq!(reader.read_i16(ValueType::Standard, ByteOrder::Big).unwrap(), i16::MIN);
    }

    #[test]
    fn test_bit_access() {
        let mut out = WriteBuffer::new();
        out.write_u8(0xAA, ValueType::Standard);
        out.start_bit_access();
        out.write_bits(1, 1).unwrap();
        out.write_bits(2, 0b10).unwrap();
        out.write_bits(11, 2047).unwrap();
        out.finish_bit_access();
        out.write_u8(0x55, ValueType::Standard);

        // 1 10 11111111111 + 2 padding bits = 1101_1111 1111_1100
        assert_eq!(out.as_slice(), &[0xAA, 0xDF, 0xFC, 0x55]);
    }

    #[test]
    fn test_bit_access_errors() {
        let mut out = WriteBuffer::new();
        assert_eq!(out.write_bits(3, 1), Err(CodecError::NotInBitAccess));
        out.start_bit_access();
        assert_eq!(out.write_bits(0, 1), Err(CodecError::InvalidBitCount(0)));
        assert_eq!(out.write_bits(33, 1), Err(CodecError::InvalidBitCount(33)));
    }
}
