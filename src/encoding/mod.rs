//! # Byte Encoding Helpers
//!
//! Little-endian cursor types and the variable-length integer used for
//! counts and script lengths in wire and slab codecs. All functions operate
//! on slices directly and perform no hidden allocation; truncation is
//! reported through `eyre::Result`.

pub mod varint;

pub use varint::{decode_varint, encode_varint, varint_len};

use eyre::{ensure, Result};

/// Forward-only reader over a byte slice.
pub struct ByteReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn skip(&mut self, count: usize) -> Result<()> {
        ensure!(
            self.remaining() >= count,
            "cannot skip {} bytes, {} remain",
            count,
            self.remaining()
        );
        self.position += count;
        Ok(())
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<&'a [u8]> {
        ensure!(
            self.remaining() >= count,
            "cannot read {} bytes, {} remain",
            count,
            self.remaining()
        );
        let slice = &self.data[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("length checked")))
    }

    pub fn read_hash(&mut self) -> Result<[u8; 32]> {
        let bytes = self.read_bytes(32)?;
        Ok(bytes.try_into().expect("length checked"))
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, consumed) = decode_varint(&self.data[self.position..])?;
        self.position += consumed;
        Ok(value)
    }

    /// Reads a varint length followed by that many bytes.
    pub fn read_var_bytes(&mut self) -> Result<&'a [u8]> {
        let length = self.read_varint()? as usize;
        self.read_bytes(length)
    }
}

/// Growable little-endian writer.
#[derive(Default)]
pub struct ByteWriter {
    buffer: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_varint(&mut self, value: u64) {
        let mut scratch = [0u8; 9];
        let written = encode_varint(value, &mut scratch);
        self.buffer.extend_from_slice(&scratch[..written]);
    }

    /// Writes a varint length followed by the bytes themselves.
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.write_bytes(bytes);
    }
}
