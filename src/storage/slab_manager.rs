//! # Slab Manager
//!
//! Variable-width bump arena inside a mapped file. A `size:u64` cell at the
//! header offset records the next free byte; allocation advances it and
//! returns the absolute file offset of the fresh region. Because the arena
//! always sits behind at least its own size cell, no allocation can land at
//! file offset 0 — which is what lets slab tables use `0` as their empty
//! sentinel.
//!
//! ```text
//! header_offset: [ size:8 ][ slab ][ slab ] ...
//! ```

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::storage::{FileOffset, MappedFile, SIZE_SIZE};

pub struct SlabManager {
    file: Arc<MappedFile>,
    header_offset: u64,
    size: Mutex<u64>,
}

impl SlabManager {
    pub fn new(file: Arc<MappedFile>, header_offset: u64) -> Self {
        Self {
            file,
            header_offset,
            size: Mutex::new(0),
        }
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }

    /// Zeroes the size cell of a freshly resized file.
    pub fn create(&self) -> Result<()> {
        self.file.reserve(self.header_offset + SIZE_SIZE)?;
        self.file.pin().write_u64(self.header_offset, 0)?;
        *self.size.lock() = 0;
        Ok(())
    }

    /// Loads the size cell and validates it against the file length.
    pub fn start(&self) -> Result<()> {
        let stored = self.file.pin().read_u64(self.header_offset)?;
        let required = self.header_offset + SIZE_SIZE + stored;
        ensure!(
            required <= self.file.size() as u64,
            StoreError::CorruptStore
        );
        *self.size.lock() = stored;
        Ok(())
    }

    /// Writes the in-memory size back to its header cell.
    pub fn sync(&self) -> Result<()> {
        let size = *self.size.lock();
        self.file.pin().write_u64(self.header_offset, size)
    }

    /// Bytes allocated so far.
    pub fn allocated(&self) -> u64 {
        *self.size.lock()
    }

    /// Allocates `n` fresh bytes and returns their absolute file offset.
    /// Callers must not hold a pin when allocating.
    pub fn allocate(&self, n: u64) -> Result<FileOffset> {
        ensure!(n > 0, StoreError::CorruptStore);
        let mut size = self.size.lock();
        let start = *size;
        *size += n;
        self.file
            .reserve(self.header_offset + SIZE_SIZE + *size)?;
        Ok(self.header_offset + SIZE_SIZE + start)
    }
}
