//! # Record Hash Table
//!
//! Intrusive separate-chaining hash map over a fixed-width record arena.
//! Row layout:
//!
//! ```text
//! [ key:K ][ next:4 ][ value ]
//! ```
//!
//! `next` is an index into the same arena, `0xFFFF_FFFF` when the row is
//! the tail of its chain. Buckets hold the head index of each chain.
//!
//! `store` always allocates — duplicate keys coexist in insertion order,
//! newest first. Linearization: under the chain lock the new row's `next`
//! is written before the bucket head is published, so a lock-free `find`
//! sees either the old head or the new head, never a torn chain. `update`
//! and `unlink` mutate in place and rely on the caller (the write
//! orchestrator) to serialize conflicting writers.
//!
//! Chain walks are bounded by the arena's record count; exceeding it means
//! a cycle or a stray link and is reported as store corruption.

use std::marker::PhantomData;
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::encoding::ByteWriter;
use crate::error::StoreError;
use crate::storage::{
    ArrayIndex, FileOffset, HashHeader, MapPin, MappedFile, RecordManager, TableKey, COUNT_SIZE,
    EMPTY_RECORD,
};

const NEXT_SIZE: u64 = 4;

pub struct RecordTable<K: TableKey> {
    file: Arc<MappedFile>,
    header: HashHeader<ArrayIndex>,
    manager: RecordManager,
    chain_lock: Mutex<()>,
    _key: PhantomData<K>,
}

impl<K: TableKey> RecordTable<K> {
    /// Builds a table whose rows carry `value_size` bytes of payload after
    /// the key and link.
    pub fn new(file: Arc<MappedFile>, buckets: u64, value_size: u64) -> Self {
        let header = HashHeader::new(file.clone(), buckets);
        let record_size = K::SIZE as u64 + NEXT_SIZE + value_size;
        let manager = RecordManager::new(
            file.clone(),
            HashHeader::<ArrayIndex>::size(buckets),
            record_size,
        );
        Self {
            file,
            header,
            manager,
            chain_lock: Mutex::new(()),
            _key: PhantomData,
        }
    }

    /// File length required by an empty table.
    pub fn initial_size(buckets: u64) -> u64 {
        HashHeader::<ArrayIndex>::size(buckets) + COUNT_SIZE
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }

    pub fn buckets(&self) -> u64 {
        self.header.buckets()
    }

    pub fn count(&self) -> u64 {
        self.manager.count()
    }

    fn value_size(&self) -> u64 {
        self.manager.record_size() - K::SIZE as u64 - NEXT_SIZE
    }

    pub fn create(&self) -> Result<()> {
        self.header.create()?;
        self.manager.create()
    }

    pub fn start(&self) -> Result<()> {
        self.header.start()?;
        self.manager.start()
    }

    /// Writes the record counter back to the file header.
    pub fn sync(&self) -> Result<()> {
        self.manager.sync()
    }

    /// File offset of row `index`'s value bytes.
    pub fn value_offset(&self, index: ArrayIndex) -> FileOffset {
        self.manager.offset(index) + K::SIZE as u64 + NEXT_SIZE
    }

    /// The raw key bytes of row `index`.
    pub fn key_at<'p>(&self, pin: &'p MapPin, index: ArrayIndex) -> Result<&'p [u8]> {
        pin.bytes(self.manager.offset(index), K::SIZE)
    }

    fn next_offset(&self, index: ArrayIndex) -> FileOffset {
        self.manager.offset(index) + K::SIZE as u64
    }

    /// Allocates a new row for `key`, fills its value from `write`, and
    /// prepends it to the key's bucket chain. Returns the new row's index.
    pub fn store(&self, key: &K, write: impl FnOnce(&mut ByteWriter)) -> Result<ArrayIndex> {
        let mut value = ByteWriter::with_capacity(self.value_size() as usize);
        write(&mut value);
        let value = value.into_bytes();
        ensure!(
            value.len() as u64 == self.value_size(),
            "record value is {} bytes, table rows carry {}",
            value.len(),
            self.value_size()
        );

        // Allocate before pinning; reserve takes the exclusive remap side.
        let index = self.manager.new_records(1)?;
        let row = self.manager.offset(index);

        let pin = self.file.pin();
        let mut key_bytes = vec![0u8; K::SIZE];
        key.copy_to(&mut key_bytes);
        pin.write(row, &key_bytes)?;
        pin.write(row + K::SIZE as u64 + NEXT_SIZE, &value)?;

        let bucket = self.header.bucket_of(key.fold());
        let _chain = self.chain_lock.lock();
        let head = self.header.read(&pin, bucket)?;
        pin.write_u32(self.next_offset(index), head)?;
        self.header.write(&pin, bucket, index)?;
        Ok(index)
    }

    /// Index of the most recently stored row with `key`, if any. Lock-free;
    /// relies on the remap pin and on `store`'s publication order.
    pub fn find(&self, key: &K) -> Result<Option<ArrayIndex>> {
        let pin = self.file.pin();
        self.find_in(&pin, key).map(|found| found.map(|(index, _)| index))
    }

    /// Walks `key`'s chain, returning the first match and its predecessor.
    fn find_in(
        &self,
        pin: &MapPin,
        key: &K,
    ) -> Result<Option<(ArrayIndex, Option<ArrayIndex>)>> {
        let bucket = self.header.bucket_of(key.fold());
        let mut index = self.header.read(pin, bucket)?;
        let mut previous = None;
        let mut steps = 0u64;
        let limit = self.manager.count();

        while index != EMPTY_RECORD {
            ensure!(steps < limit, StoreError::CorruptStore);
            let row = self.manager.offset(index);
            if key.matches(pin.bytes(row, K::SIZE)?) {
                return Ok(Some((index, previous)));
            }
            previous = Some(index);
            index = pin.read_u32(row + K::SIZE as u64)?;
            steps += 1;
        }
        Ok(None)
    }

    /// Applies `update` to the first matching row's value bytes in place.
    /// No locking: the caller must serialize against conflicting writers.
    pub fn update(
        &self,
        key: &K,
        update: impl FnOnce(&MapPin, FileOffset) -> Result<()>,
    ) -> Result<Option<ArrayIndex>> {
        let pin = self.file.pin();
        match self.find_in(&pin, key)? {
            Some((index, _)) => {
                update(&pin, self.value_offset(index))?;
                Ok(Some(index))
            }
            None => Ok(None),
        }
    }

    /// Unlinks the first matching row from its bucket chain. The row's
    /// bytes remain allocated but unreachable. Not safe against concurrent
    /// writers of the same chain.
    pub fn unlink(&self, key: &K) -> Result<bool> {
        let _chain = self.chain_lock.lock();
        let pin = self.file.pin();
        let Some((index, previous)) = self.find_in(&pin, key)? else {
            return Ok(false);
        };

        let next = pin.read_u32(self.next_offset(index))?;
        match previous {
            Some(previous) => pin.write_u32(self.next_offset(previous), next)?,
            None => {
                let bucket = self.header.bucket_of(key.fold());
                self.header.write(&pin, bucket, next)?;
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::new_remap_mutex;
    use tempfile::tempdir;

    type Key = [u8; 32];

    fn table(dir: &std::path::Path, buckets: u64) -> RecordTable<Key> {
        let file = MappedFile::open(dir.join("table"), new_remap_mutex(), 50).unwrap();
        file.resize(RecordTable::<Key>::initial_size(buckets)).unwrap();
        let table = RecordTable::new(file, buckets, 8);
        table.create().unwrap();
        table
    }

    fn key(seed: u8) -> Key {
        [seed; 32]
    }

    fn read_value(table: &RecordTable<Key>, index: ArrayIndex) -> u64 {
        table
            .file()
            .pin()
            .read_u64(table.value_offset(index))
            .unwrap()
    }

    #[test]
    fn find_returns_most_recent_store() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 13);

        table.store(&key(1), |w| w.write_u64(100)).unwrap();
        table.store(&key(1), |w| w.write_u64(200)).unwrap();

        let found = table.find(&key(1)).unwrap().unwrap();
        assert_eq!(read_value(&table, found), 200);
    }

    #[test]
    fn missing_keys_are_not_found() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 13);
        table.store(&key(1), |w| w.write_u64(1)).unwrap();
        assert!(table.find(&key(2)).unwrap().is_none());
    }

    #[test]
    fn colliding_keys_share_a_chain() {
        let dir = tempdir().unwrap();
        // One bucket forces every key onto the same chain.
        let table = table(dir.path(), 1);

        for seed in 0..20 {
            table.store(&key(seed), |w| w.write_u64(seed as u64)).unwrap();
        }
        for seed in 0..20 {
            let found = table.find(&key(seed)).unwrap().unwrap();
            assert_eq!(read_value(&table, found), seed as u64);
        }
    }

    #[test]
    fn update_mutates_in_place() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 13);
        let stored = table.store(&key(5), |w| w.write_u64(1)).unwrap();

        let updated = table
            .update(&key(5), |pin, value| pin.write_u64(value, 2))
            .unwrap();
        assert_eq!(updated, Some(stored));
        assert_eq!(read_value(&table, stored), 2);
        assert_eq!(table.count(), 1, "update must not allocate");
    }

    #[test]
    fn update_on_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 13);
        let updated = table
            .update(&key(9), |pin, value| pin.write_u64(value, 2))
            .unwrap();
        assert!(updated.is_none());
    }

    #[test]
    fn unlink_removes_newest_first() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 1);

        table.store(&key(1), |w| w.write_u64(10)).unwrap();
        table.store(&key(1), |w| w.write_u64(20)).unwrap();
        table.store(&key(2), |w| w.write_u64(30)).unwrap();

        assert!(table.unlink(&key(1)).unwrap());
        let found = table.find(&key(1)).unwrap().unwrap();
        assert_eq!(read_value(&table, found), 10);

        assert!(table.unlink(&key(1)).unwrap());
        assert!(table.find(&key(1)).unwrap().is_none());
        assert!(!table.unlink(&key(1)).unwrap());

        // Unrelated chain entry survives the unlinks.
        let other = table.find(&key(2)).unwrap().unwrap();
        assert_eq!(read_value(&table, other), 30);
    }

    #[test]
    fn reachable_rows_match_stores_minus_unlinks() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 3);

        for _ in 0..5 {
            table.store(&key(7), |w| w.write_u64(0)).unwrap();
        }
        for _ in 0..2 {
            assert!(table.unlink(&key(7)).unwrap());
        }

        let mut reachable = 0;
        while table.unlink(&key(7)).unwrap() {
            reachable += 1;
        }
        assert_eq!(reachable, 3);
    }

    #[test]
    fn table_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let table = table(dir.path(), 13);
            table.store(&key(3), |w| w.write_u64(333)).unwrap();
            table.sync().unwrap();
        }
        let file = MappedFile::open(dir.path().join("table"), new_remap_mutex(), 50).unwrap();
        let table = RecordTable::<Key>::new(file, 13, 8);
        table.start().unwrap();

        let found = table.find(&key(3)).unwrap().unwrap();
        assert_eq!(read_value(&table, found), 333);
    }

    #[test]
    fn concurrent_stores_keep_chains_consistent() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 5);

        std::thread::scope(|scope| {
            for worker in 0..4u8 {
                let table = &table;
                scope.spawn(move || {
                    for i in 0..25u8 {
                        table
                            .store(&key(worker * 25 + i), |w| w.write_u64(i as u64))
                            .unwrap();
                    }
                });
            }
        });

        assert_eq!(table.count(), 100);
        for seed in 0..100u8 {
            assert!(table.find(&key(seed)).unwrap().is_some(), "key {} lost", seed);
        }
    }
}
