//! # Hash Table Header
//!
//! A fixed bucket array at file offset 0 of a lookup file:
//!
//! ```text
//! [ bucket_count:4 ][ cell 0 ][ cell 1 ] ... [ cell B-1 ]
//! ```
//!
//! Cells are 32-bit record indexes or 64-bit file offsets, chosen by the
//! table built on top. The bucket count is fixed at creation and verified
//! on every open; there is no runtime resizing. Cells read and write as
//! plain little-endian loads and stores — ordering comes from the table's
//! chain lock above.

use std::marker::PhantomData;
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::error::StoreError;
use crate::storage::{ArrayIndex, FileOffset, MapPin, MappedFile};

/// One bucket cell: a 32-bit record index or a 64-bit file offset.
pub trait BucketCell: Copy + Eq {
    const WIDTH: u64;
    const EMPTY: Self;
    /// Both sentinels are uniform byte patterns, so creation can fill the
    /// array with bulk writes.
    const EMPTY_BYTE: u8;

    fn read(pin: &MapPin, offset: u64) -> Result<Self>;
    fn write(self, pin: &MapPin, offset: u64) -> Result<()>;
}

impl BucketCell for ArrayIndex {
    const WIDTH: u64 = 4;
    const EMPTY: Self = ArrayIndex::MAX;
    const EMPTY_BYTE: u8 = 0xFF;

    fn read(pin: &MapPin, offset: u64) -> Result<Self> {
        pin.read_u32(offset)
    }

    fn write(self, pin: &MapPin, offset: u64) -> Result<()> {
        pin.write_u32(offset, self)
    }
}

impl BucketCell for FileOffset {
    const WIDTH: u64 = 8;
    const EMPTY: Self = 0;
    const EMPTY_BYTE: u8 = 0x00;

    fn read(pin: &MapPin, offset: u64) -> Result<Self> {
        pin.read_u64(offset)
    }

    fn write(self, pin: &MapPin, offset: u64) -> Result<()> {
        pin.write_u64(offset, self)
    }
}

pub struct HashHeader<C: BucketCell> {
    file: Arc<MappedFile>,
    buckets: u64,
    _cell: PhantomData<C>,
}

impl<C: BucketCell> HashHeader<C> {
    pub fn new(file: Arc<MappedFile>, buckets: u64) -> Self {
        debug_assert!(buckets > 0);
        Self {
            file,
            buckets,
            _cell: PhantomData,
        }
    }

    /// Total header bytes for `buckets` cells.
    pub fn size(buckets: u64) -> u64 {
        4 + buckets * C::WIDTH
    }

    pub fn buckets(&self) -> u64 {
        self.buckets
    }

    /// Writes the bucket count and fills every cell with the empty
    /// sentinel. The file must already span the header.
    pub fn create(&self) -> Result<()> {
        let pin = self.file.pin();
        pin.write_u32(0, self.buckets as u32)?;

        let fill = vec![C::EMPTY_BYTE; 1 << 16];
        let mut remaining = self.buckets * C::WIDTH;
        let mut offset = 4u64;
        while remaining > 0 {
            let chunk = remaining.min(fill.len() as u64);
            pin.write(offset, &fill[..chunk as usize])?;
            offset += chunk;
            remaining -= chunk;
        }
        Ok(())
    }

    /// Verifies the stored bucket count matches the configured one.
    pub fn start(&self) -> Result<()> {
        let stored = self.file.pin().read_u32(0)? as u64;
        ensure!(stored == self.buckets, StoreError::CorruptStore);
        Ok(())
    }

    /// Maps a key fold to its bucket.
    pub fn bucket_of(&self, fold: u64) -> u64 {
        fold % self.buckets
    }

    pub fn read(&self, pin: &MapPin, bucket: u64) -> Result<C> {
        debug_assert!(bucket < self.buckets);
        C::read(pin, self.cell_offset(bucket))
    }

    pub fn write(&self, pin: &MapPin, bucket: u64, value: C) -> Result<()> {
        debug_assert!(bucket < self.buckets);
        value.write(pin, self.cell_offset(bucket))
    }

    fn cell_offset(&self, bucket: u64) -> u64 {
        4 + bucket * C::WIDTH
    }
}
