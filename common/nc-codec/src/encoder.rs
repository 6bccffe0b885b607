use alloc::vec::Vec;

/// A sink that wire values are serialized into.
///
/// Implementations only need to provide raw byte writes; the fixed-width
/// integer helpers are derived from `write_slice` so a new backing buffer
/// (e.g. a pooled `BytesMut`) only has to implement one method.
pub trait Encoder {
    fn write_slice(&mut self, bytes: &[u8]);

    fn write_u8(&mut self, value: u8) {
        self.write_slice(&[value]);
    }

    fn write_u16(&mut self, value: u16) {
        self.write_slice(&value.to_be_bytes());
    }

    fn write_u32(&mut self, value: u32) {
        self.write_slice(&value.to_be_bytes());
    }

    fn write_u64(&mut self, value: u64) {
        self.write_slice(&value.to_be_bytes());
    }

    fn write_i64(&mut self, value: i64) {
        self.write_u64(value as u64);
    }

    /// Writes a 4-byte big-endian length prefix followed by `bytes`.
    fn write_len_prefixed(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_slice(bytes);
    }

    fn encode<T: EncoderValue>(&mut self, value: &T)
    where
        Self: Sized,
    {
        value.encode(self);
    }
}

/// A growable, in-memory `Encoder`. Every offline frame is built with one
/// of these before being handed to the channel for a single atomic write.
#[derive(Debug, Default, Clone)]
pub struct EncoderBuffer {
    buf: Vec<u8>,
}

impl EncoderBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

impl Encoder for EncoderBuffer {
    fn write_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

/// A value that knows how to serialize itself into any `Encoder`.
pub trait EncoderValue {
    fn encode<E: Encoder>(&self, encoder: &mut E);

    /// Convenience for callers that just want owned bytes.
    fn encode_to_vec(&self) -> Vec<u8> {
        let mut buffer = EncoderBuffer::new();
        self.encode(&mut buffer);
        buffer.into_bytes()
    }
}

impl EncoderValue for &[u8] {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_len_prefixed(self);
    }
}

impl EncoderValue for Vec<u8> {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_len_prefixed(self);
    }
}

impl EncoderValue for u32 {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_u32(*self);
    }
}

impl EncoderValue for i64 {
    fn encode<E: Encoder>(&self, encoder: &mut E) {
        encoder.write_i64(*self);
    }
}
