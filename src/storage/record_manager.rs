//! # Record Manager
//!
//! Fixed-width record arena inside a mapped file. The arena keeps a
//! `count:u32` cell at its header offset, followed by `count` records of
//! `record_size` bytes each. Allocation is append-only and logical; records
//! are never physically reclaimed. The in-memory counter is authoritative
//! between `sync()` calls, which write it back to the header cell.
//!
//! ```text
//! header_offset: [ count:4 ][ record 0 ][ record 1 ] ...
//! ```

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::storage::{ArrayIndex, FileOffset, MappedFile, COUNT_SIZE};

pub struct RecordManager {
    file: Arc<MappedFile>,
    header_offset: u64,
    record_size: u64,
    count: Mutex<u64>,
}

impl RecordManager {
    pub fn new(file: Arc<MappedFile>, header_offset: u64, record_size: u64) -> Self {
        debug_assert!(record_size > 0);
        Self {
            file,
            header_offset,
            record_size,
            count: Mutex::new(0),
        }
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }

    pub fn record_size(&self) -> u64 {
        self.record_size
    }

    /// Zeroes the counter cell of a freshly resized file.
    pub fn create(&self) -> Result<()> {
        self.file.reserve(self.header_offset + COUNT_SIZE)?;
        self.file.pin().write_u32(self.header_offset, 0)?;
        *self.count.lock() = 0;
        Ok(())
    }

    /// Loads the counter from the file and validates it against the file
    /// length.
    pub fn start(&self) -> Result<()> {
        let stored = self.file.pin().read_u32(self.header_offset)? as u64;
        let required = self.header_offset + COUNT_SIZE + stored * self.record_size;
        ensure!(
            required <= self.file.size() as u64,
            StoreError::CorruptStore
        );
        *self.count.lock() = stored;
        Ok(())
    }

    /// Writes the in-memory counter back to its header cell.
    pub fn sync(&self) -> Result<()> {
        let count = *self.count.lock();
        self.file.pin().write_u32(self.header_offset, count as u32)
    }

    pub fn count(&self) -> u64 {
        *self.count.lock()
    }

    /// Logical truncation; the only way the arena shrinks. Used when a
    /// block index pops above a height. Bytes past the new count become
    /// unreachable garbage.
    pub fn set_count(&self, count: u64) {
        let mut current = self.count.lock();
        debug_assert!(count <= *current);
        *current = count;
    }

    /// Appends `n` records, growing the file, and returns the index of the
    /// first. Callers must not hold a pin when allocating.
    pub fn new_records(&self, n: u64) -> Result<ArrayIndex> {
        let mut count = self.count.lock();
        let first = *count;
        *count += n;
        self.file
            .reserve(self.header_offset + COUNT_SIZE + *count * self.record_size)?;
        ensure!(first <= ArrayIndex::MAX as u64 - n, StoreError::CorruptStore);
        Ok(first as ArrayIndex)
    }

    /// File offset of record `index`.
    pub fn offset(&self, index: ArrayIndex) -> FileOffset {
        self.header_offset + COUNT_SIZE + index as u64 * self.record_size
    }
}
