/// Errors produced while pulling a typed value out of a `DecoderBuffer`.
///
/// `UnexpectedEof` and `InvalidValue` both map to `InvalidWireFormat` at the
/// frame layer (see `nc_core::error`); the distinction is kept here purely
/// for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecoderError {
    #[error("buffer ended before the expected value could be read")]
    UnexpectedEof,
    #[error("a decoded value violated an invariant of its type")]
    InvalidValue,
    #[error("trailing bytes remained after decoding a fixed-size message")]
    TrailingBytes,
}

/// A cursor over an immutable byte slice.
///
/// Every `decode_*` method consumes the prefix it describes and returns the
/// remaining buffer, the same split-borrow shape used throughout this
/// codebase's encoder/decoder pair.
#[derive(Debug, Clone, Copy)]
pub struct DecoderBuffer<'a> {
    bytes: &'a [u8],
}

impl<'a> DecoderBuffer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn into_less_safe_slice(self) -> &'a [u8] {
        self.bytes
    }

    fn split_at(self, at: usize) -> Result<(&'a [u8], Self), DecoderError> {
        if at > self.bytes.len() {
            return Err(DecoderError::UnexpectedEof);
        }
        let (head, tail) = self.bytes.split_at(at);
        Ok((head, Self { bytes: tail }))
    }

    pub fn decode_slice(self, len: usize) -> Result<(&'a [u8], Self), DecoderError> {
        self.split_at(len)
    }

    pub fn decode_u8(self) -> Result<(u8, Self), DecoderError> {
        let (head, tail) = self.split_at(1)?;
        Ok((head[0], tail))
    }

    pub fn decode_u16(self) -> Result<(u16, Self), DecoderError> {
        let (head, tail) = self.split_at(2)?;
        Ok((u16::from_be_bytes([head[0], head[1]]), tail))
    }

    pub fn decode_u32(self) -> Result<(u32, Self), DecoderError> {
        let (head, tail) = self.split_at(4)?;
        Ok((u32::from_be_bytes(head.try_into().unwrap()), tail))
    }

    pub fn decode_u64(self) -> Result<(u64, Self), DecoderError> {
        let (head, tail) = self.split_at(8)?;
        Ok((u64::from_be_bytes(head.try_into().unwrap()), tail))
    }

    pub fn decode_i64(self) -> Result<(i64, Self), DecoderError> {
        let (value, tail) = self.decode_u64()?;
        Ok((value as i64, tail))
    }

    /// Reads a 4-byte big-endian length prefix followed by that many bytes.
    pub fn decode_len_prefixed(self) -> Result<(&'a [u8], Self), DecoderError> {
        let (len, tail) = self.decode_u32()?;
        tail.decode_slice(len as usize)
    }

    /// Decodes a value and asserts the buffer is fully consumed, the shape
    /// every top-level offline frame decode uses.
    pub fn decode_value_complete<T: DecoderValue<'a>>(self) -> Result<T, DecoderError> {
        let (value, tail) = T::decode(self)?;
        if !tail.is_empty() {
            return Err(DecoderError::TrailingBytes);
        }
        Ok(value)
    }
}

/// A value that knows how to parse itself (and return the remainder of the
/// buffer) from a `DecoderBuffer`.
pub trait DecoderValue<'a>: Sized {
    fn decode(buffer: DecoderBuffer<'a>) -> Result<(Self, DecoderBuffer<'a>), DecoderError>;
}

impl<'a> DecoderValue<'a> for &'a [u8] {
    fn decode(buffer: DecoderBuffer<'a>) -> Result<(Self, DecoderBuffer<'a>), DecoderError> {
        buffer.decode_len_prefixed()
    }
}

impl<'a> DecoderValue<'a> for u32 {
    fn decode(buffer: DecoderBuffer<'a>) -> Result<(Self, DecoderBuffer<'a>), DecoderError> {
        buffer.decode_u32()
    }
}

impl<'a> DecoderValue<'a> for i64 {
    fn decode(buffer: DecoderBuffer<'a>) -> Result<(Self, DecoderBuffer<'a>), DecoderError> {
        buffer.decode_i64()
    }
}
