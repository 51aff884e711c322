//! # History Store
//!
//! Address history multimap: one list of payment rows per 20-byte address
//! hash, newest first. Payment row [47 bytes]:
//!
//! ```text
//! [ height:4 ][ kind:1 ][ point-hash:32 ][ point-index:2 ][ data:8 ]
//! ```
//!
//! `kind` distinguishes an output credit from an input debit; `data` holds
//! the output value for credits and the prevout checksum for debits (the
//! checksum lets a caller pair a debit with the credit it consumed without
//! another lookup).

use std::sync::Arc;

use eyre::Result;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::chain::{OutPoint, ShortHash};
use crate::error::StoreError;
use crate::storage::{
    MappedFile, RecordManager, RecordMultimap, RecordTable, COUNT_SIZE,
};

const ROW_NEXT_SIZE: u64 = 4;
const PAYMENT_SIZE: u64 = 47;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PointKind {
    Output = 0,
    Input = 1,
}

impl PointKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Output),
            1 => Ok(Self::Input),
            _ => Err(StoreError::CorruptStore.into()),
        }
    }
}

/// On-disk payment row.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PaymentRow {
    height: U32,
    kind: u8,
    point_hash: [u8; 32],
    point_index: U16,
    data: U64,
}

const _: () = assert!(std::mem::size_of::<PaymentRow>() == PAYMENT_SIZE as usize);

/// One address history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentRecord {
    pub height: u32,
    pub kind: PointKind,
    pub point: OutPoint,
    /// Output value for `Output` rows, prevout checksum for `Input` rows.
    pub data: u64,
}

/// Statistics counters, mirroring the lookup/rows split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStats {
    pub buckets: u64,
    pub addresses: u64,
    pub rows: u64,
}

pub struct HistoryStore {
    multimap: RecordMultimap<ShortHash>,
}

impl HistoryStore {
    pub fn new(lookup_file: Arc<MappedFile>, rows_file: Arc<MappedFile>, buckets: u64) -> Self {
        let table = RecordTable::new(lookup_file, buckets, 4);
        let rows = RecordManager::new(rows_file, 0, ROW_NEXT_SIZE + PAYMENT_SIZE);
        Self {
            multimap: RecordMultimap::new(table, rows),
        }
    }

    pub fn initial_lookup_size(buckets: u64) -> u64 {
        RecordTable::<ShortHash>::initial_size(buckets)
    }

    pub fn initial_rows_size() -> u64 {
        COUNT_SIZE
    }

    pub fn files(&self) -> [&Arc<MappedFile>; 2] {
        [
            self.multimap.table().file(),
            self.multimap.rows().file(),
        ]
    }

    pub fn create(&self) -> Result<()> {
        self.multimap.create()
    }

    pub fn start(&self) -> Result<()> {
        self.multimap.start()?;
        self.multimap.table().file().advise_random();
        Ok(())
    }

    pub fn commit(&self) -> Result<()> {
        self.multimap.sync()
    }

    pub fn flush(&self) -> Result<()> {
        self.multimap.table().file().flush()?;
        self.multimap.rows().file().flush()
    }

    /// Appends one payment row to `address`'s history.
    pub fn store(&self, address: &ShortHash, payment: PaymentRecord) -> Result<()> {
        let row = PaymentRow {
            height: U32::new(payment.height),
            kind: payment.kind as u8,
            point_hash: payment.point.hash,
            point_index: U16::new(payment.point.index as u16),
            data: U64::new(payment.data),
        };
        self.multimap
            .add_row(address, |writer| writer.write_bytes(row.as_bytes()))?;
        Ok(())
    }

    /// The newest rows for `address`, skipping entries below `from_height`;
    /// `limit == 0` means unlimited.
    pub fn get(
        &self,
        address: &ShortHash,
        limit: usize,
        from_height: u32,
    ) -> Result<Vec<PaymentRecord>> {
        let mut records = Vec::new();
        let Some(head) = self.multimap.lookup(address)? else {
            return Ok(records);
        };

        let mut walker = self.multimap.walk(head);
        while let Some(row) = walker.next()? {
            if limit > 0 && records.len() >= limit {
                break;
            }
            let offset = self.multimap.payload_offset(row);
            let pin = self.multimap.rows().file().pin();
            let bytes = pin.bytes(offset, PAYMENT_SIZE as usize)?;
            let row = PaymentRow::ref_from_bytes(bytes)
                .map_err(|_| StoreError::CorruptStore)?;
            if row.height.get() < from_height {
                continue;
            }
            records.push(PaymentRecord {
                height: row.height.get(),
                kind: PointKind::from_u8(row.kind)?,
                point: OutPoint::new(row.point_hash, row.point_index.get() as u32),
                data: row.data.get(),
            });
        }
        Ok(records)
    }

    /// Unlinks the most recent row for `address` (reorganization).
    pub fn unlink_last(&self, address: &ShortHash) -> Result<bool> {
        self.multimap.delete_last_row(address)
    }

    pub fn stats(&self) -> HistoryStats {
        HistoryStats {
            buckets: self.multimap.table().buckets(),
            addresses: self.multimap.table().count(),
            rows: self.multimap.rows().count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::new_remap_mutex;
    use tempfile::tempdir;

    fn store(dir: &std::path::Path) -> HistoryStore {
        let remap = new_remap_mutex();
        let lookup = MappedFile::open(dir.join("history_table"), remap.clone(), 50).unwrap();
        lookup.resize(HistoryStore::initial_lookup_size(13)).unwrap();
        let rows = MappedFile::open(dir.join("history_rows"), remap, 50).unwrap();
        rows.resize(HistoryStore::initial_rows_size()).unwrap();

        let store = HistoryStore::new(lookup, rows, 13);
        store.create().unwrap();
        store
    }

    fn address(seed: u8) -> ShortHash {
        [seed; 20]
    }

    fn credit(height: u32, value: u64) -> PaymentRecord {
        PaymentRecord {
            height,
            kind: PointKind::Output,
            point: OutPoint::new([height as u8; 32], 0),
            data: value,
        }
    }

    #[test]
    fn history_accumulates_newest_first() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let addr = address(1);

        for height in 1..=3 {
            store.store(&addr, credit(height, height as u64 * 10)).unwrap();
        }

        let rows = store.get(&addr, 0, 0).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].height, 3);
        assert_eq!(rows[2].height, 1);
    }

    #[test]
    fn from_height_and_limit_filter() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let addr = address(2);

        for height in 1..=5 {
            store.store(&addr, credit(height, 1)).unwrap();
        }

        let filtered = store.get(&addr, 0, 3).unwrap();
        assert_eq!(filtered.len(), 3);
        assert!(filtered.iter().all(|row| row.height >= 3));

        let limited = store.get(&addr, 2, 0).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].height, 5);
    }

    #[test]
    fn input_rows_keep_their_checksum() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let addr = address(3);
        let prevout = OutPoint::new([7u8; 32], 1);

        store
            .store(
                &addr,
                PaymentRecord {
                    height: 9,
                    kind: PointKind::Input,
                    point: OutPoint::new([8u8; 32], 0),
                    data: prevout.checksum(),
                },
            )
            .unwrap();

        let rows = store.get(&addr, 0, 0).unwrap();
        assert_eq!(rows[0].kind, PointKind::Input);
        assert_eq!(rows[0].data, prevout.checksum());
    }

    #[test]
    fn unlink_last_pops_newest_row() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let addr = address(4);

        store.store(&addr, credit(1, 10)).unwrap();
        store.store(&addr, credit(2, 20)).unwrap();

        assert!(store.unlink_last(&addr).unwrap());
        let rows = store.get(&addr, 0, 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].height, 1);
    }

    #[test]
    fn stats_count_addresses_and_rows() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.store(&address(1), credit(1, 1)).unwrap();
        store.store(&address(1), credit(2, 2)).unwrap();
        store.store(&address(2), credit(3, 3)).unwrap();

        let stats = store.stats();
        assert_eq!(stats.addresses, 2);
        assert_eq!(stats.rows, 3);
        assert_eq!(stats.buckets, 13);
    }
}
