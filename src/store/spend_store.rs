//! # Spend Store
//!
//! Record table keyed by output point with the spending input point as the
//! value: "which input consumed this output". Maintained only when address
//! indexing is enabled; rows are unlinked when their spend is popped.
//!
//! Record: `[ point-hash:32 | point-index:4 ]` key and value alike.

use std::sync::Arc;

use eyre::Result;

use crate::chain::OutPoint;
use crate::storage::{MappedFile, RecordTable};

const VALUE_SIZE: u64 = 36;

pub struct SpendStore {
    table: RecordTable<OutPoint>,
}

impl SpendStore {
    pub fn new(file: Arc<MappedFile>, buckets: u64) -> Self {
        Self {
            table: RecordTable::new(file, buckets, VALUE_SIZE),
        }
    }

    pub fn initial_size(buckets: u64) -> u64 {
        RecordTable::<OutPoint>::initial_size(buckets)
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        self.table.file()
    }

    pub fn create(&self) -> Result<()> {
        self.table.create()
    }

    pub fn start(&self) -> Result<()> {
        self.table.start()?;
        self.table.file().advise_random();
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.table.sync()
    }

    pub fn flush(&self) -> Result<()> {
        self.table.file().flush()
    }

    /// Number of stored spend rows.
    pub fn count(&self) -> u64 {
        self.table.count()
    }

    /// Records that `outpoint` was consumed by `spend`.
    pub fn store(&self, outpoint: &OutPoint, spend: &OutPoint) -> Result<()> {
        self.table.store(outpoint, |writer| {
            writer.write_bytes(&spend.hash);
            writer.write_u32(spend.index);
        })?;
        Ok(())
    }

    /// The input point that spent `outpoint`, if indexed.
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<OutPoint>> {
        let Some(index) = self.table.find(outpoint)? else {
            return Ok(None);
        };
        let pin = self.table.file().pin();
        let value = self.table.value_offset(index);
        let hash = pin.bytes(value, 32)?.try_into().expect("32 bytes");
        let spend_index = pin.read_u32(value + 32)?;
        Ok(Some(OutPoint::new(hash, spend_index)))
    }

    /// Removes the spend row for `outpoint` (reorganization).
    pub fn unlink(&self, outpoint: &OutPoint) -> Result<bool> {
        self.table.unlink(outpoint)
    }
}
