//! # Stealth Store
//!
//! Unindexed arena of stealth rows. The query filter is a 0-32 bit prefix,
//! so the rows cannot be hash-indexed and are scanned linearly. Row
//! [92 bytes]:
//!
//! ```text
//! [ height:4 ][ prefix:4 ][ ephemeral_key:32 ][ address:20 ][ tx_hash:32 ]
//! ```
//!
//! There is no unlink: rows reorganized out of the chain remain until a
//! full re-index. Height leads the row so a scan can short-circuit on the
//! `from_height` bound before touching the rest.

use std::sync::Arc;

use eyre::Result;
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::chain::{Hash, ShortHash};
use crate::error::StoreError;
use crate::storage::{MappedFile, RecordManager, COUNT_SIZE};

const ROW_SIZE: u64 = 92;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct StealthRow {
    height: U32,
    prefix: U32,
    ephemeral_key: [u8; 32],
    address: [u8; 20],
    tx_hash: [u8; 32],
}

const _: () = assert!(std::mem::size_of::<StealthRow>() == ROW_SIZE as usize);

/// One indexed stealth payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealthRecord {
    pub height: u32,
    pub prefix: u32,
    pub ephemeral_key: Hash,
    pub address: ShortHash,
    pub transaction_hash: Hash,
}

/// Matches the leading `bits` of a stealth prefix; zero bits matches all.
#[derive(Debug, Clone, Copy)]
pub struct StealthFilter {
    pub bits: u8,
    pub prefix: u32,
}

impl StealthFilter {
    pub fn matches(&self, prefix: u32) -> bool {
        debug_assert!(self.bits <= 32);
        if self.bits == 0 {
            return true;
        }
        let shift = 32 - self.bits as u32;
        prefix >> shift == self.prefix >> shift
    }
}

/// Row count statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealthStats {
    pub rows: u64,
}

pub struct StealthStore {
    rows: RecordManager,
}

impl StealthStore {
    pub fn new(rows_file: Arc<MappedFile>) -> Self {
        Self {
            rows: RecordManager::new(rows_file, 0, ROW_SIZE),
        }
    }

    pub fn initial_size() -> u64 {
        COUNT_SIZE
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        self.rows.file()
    }

    pub fn create(&self) -> Result<()> {
        self.rows.create()
    }

    pub fn start(&self) -> Result<()> {
        self.rows.start()
    }

    pub fn commit(&self) -> Result<()> {
        self.rows.sync()
    }

    pub fn flush(&self) -> Result<()> {
        self.rows.file().flush()
    }

    /// Appends one stealth row.
    pub fn store(&self, record: StealthRecord) -> Result<()> {
        let index = self.rows.new_records(1)?;
        let row = StealthRow {
            height: U32::new(record.height),
            prefix: U32::new(record.prefix),
            ephemeral_key: record.ephemeral_key,
            address: record.address,
            tx_hash: record.transaction_hash,
        };
        self.rows
            .file()
            .pin()
            .write(self.rows.offset(index), row.as_bytes())
    }

    /// Linear scan of all rows at or above `from_height` matching `filter`.
    pub fn get(&self, filter: StealthFilter, from_height: u32) -> Result<Vec<StealthRecord>> {
        let mut records = Vec::new();
        let pin = self.rows.file().pin();

        for index in 0..self.rows.count() {
            let offset = self.rows.offset(index as u32);
            let bytes = pin.bytes(offset, ROW_SIZE as usize)?;
            let row = StealthRow::ref_from_bytes(bytes)
                .map_err(|_| StoreError::CorruptStore)?;
            if row.height.get() < from_height || !filter.matches(row.prefix.get()) {
                continue;
            }
            records.push(StealthRecord {
                height: row.height.get(),
                prefix: row.prefix.get(),
                ephemeral_key: row.ephemeral_key,
                address: row.address,
                transaction_hash: row.tx_hash,
            });
        }
        Ok(records)
    }

    pub fn stats(&self) -> StealthStats {
        StealthStats {
            rows: self.rows.count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::new_remap_mutex;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> StealthStore {
        let file = MappedFile::open(dir.join("stealth_rows"), new_remap_mutex(), 50).unwrap();
        file.resize(StealthStore::initial_size()).unwrap();
        let store = StealthStore::new(file);
        store.create().unwrap();
        store
    }

    fn record(height: u32, prefix: u32) -> StealthRecord {
        StealthRecord {
            height,
            prefix,
            ephemeral_key: [height as u8; 32],
            address: [prefix as u8; 20],
            transaction_hash: [0xCC; 32],
        }
    }

    #[test]
    fn rows_round_trip_through_scan() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.store(record(1, 0xAABB_0000)).unwrap();
        store.store(record(2, 0x1122_0000)).unwrap();

        let all = store
            .get(StealthFilter { bits: 0, prefix: 0 }, 0)
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], record(1, 0xAABB_0000));
    }

    #[test]
    fn prefix_filter_matches_leading_bits() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.store(record(1, 0xAABB_CCDD)).unwrap();
        store.store(record(2, 0xAA00_0000)).unwrap();
        store.store(record(3, 0x5500_0000)).unwrap();

        let matched = store
            .get(
                StealthFilter {
                    bits: 8,
                    prefix: 0xAA00_0000,
                },
                0,
            )
            .unwrap();
        assert_eq!(matched.len(), 2);
        assert!(matched.iter().all(|r| r.prefix >> 24 == 0xAA));
    }

    #[test]
    fn from_height_bounds_the_scan() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        for height in 1..=4 {
            store.store(record(height, 0)).unwrap();
        }
        let recent = store.get(StealthFilter { bits: 0, prefix: 0 }, 3).unwrap();
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn stats_track_row_count() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.store(record(1, 0)).unwrap();
        store.store(record(2, 0)).unwrap();
        assert_eq!(store.stats().rows, 2);
    }
}
