//! # Slab Hash Table
//!
//! Intrusive separate-chaining hash map over a variable-width slab arena.
//! Row layout:
//!
//! ```text
//! [ next:8 ][ key:K ][ value... ]
//! ```
//!
//! `next` is the absolute file offset of the next row, `0` at the tail.
//! Buckets hold row offsets; the *public* offsets handed to callers point
//! past the prefix, at the value bytes, and remain stable for the life of
//! the store. `key_at` walks backward from a public offset into the row
//! prefix, which is how a caller holding only an offset recovers the key.
//!
//! Operation contracts match the record table: non-unique prepend-on-store
//! under the chain lock, lock-free bounded find, caller-serialized update.

use std::marker::PhantomData;
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::encoding::ByteWriter;
use crate::error::StoreError;
use crate::storage::{
    FileOffset, HashHeader, MapPin, MappedFile, SlabManager, TableKey, EMPTY_SLAB, SIZE_SIZE,
};

const NEXT_SIZE: u64 = 8;

pub struct SlabTable<K: TableKey> {
    file: Arc<MappedFile>,
    header: HashHeader<FileOffset>,
    manager: SlabManager,
    chain_lock: Mutex<()>,
    _key: PhantomData<K>,
}

impl<K: TableKey> SlabTable<K> {
    /// Row prefix: link plus key.
    pub const PREFIX_SIZE: u64 = NEXT_SIZE + K::SIZE as u64;

    pub fn new(file: Arc<MappedFile>, buckets: u64) -> Self {
        let header = HashHeader::new(file.clone(), buckets);
        let manager = SlabManager::new(file.clone(), HashHeader::<FileOffset>::size(buckets));
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
        HashHeader::<FileOffset>::size(buckets) + SIZE_SIZE
    }

    pub fn file(&self) -> &Arc<MappedFile> {
        &self.file
    }

    pub fn create(&self) -> Result<()> {
        self.header.create()?;
        self.manager.create()
    }

    pub fn start(&self) -> Result<()> {
        self.header.start()?;
        self.manager.start()
    }

    pub fn sync(&self) -> Result<()> {
        self.manager.sync()
    }

    /// Upper bound on chain length: every row spans at least its prefix.
    fn walk_limit(&self) -> u64 {
        self.manager.allocated() / Self::PREFIX_SIZE + 1
    }

    /// Allocates a slab of `value_size` bytes for `key`, fills it from
    /// `write`, and prepends it to the key's chain. Returns the public
    /// offset of the value bytes.
    pub fn store(
        &self,
        key: &K,
        value_size: u64,
        write: impl FnOnce(&mut ByteWriter),
    ) -> Result<FileOffset> {
        let mut value = ByteWriter::with_capacity(value_size as usize);
        write(&mut value);
        let value = value.into_bytes();
        ensure!(
            value.len() as u64 == value_size,
            "slab value is {} bytes, {} were reserved",
            value.len(),
            value_size
        );

        // Allocate before pinning; reserve takes the exclusive remap side.
        let row = self.manager.allocate(Self::PREFIX_SIZE + value_size)?;

        let pin = self.file.pin();
        let mut key_bytes = vec![0u8; K::SIZE];
        key.copy_to(&mut key_bytes);
        pin.write(row + NEXT_SIZE, &key_bytes)?;
        pin.write(row + Self::PREFIX_SIZE, &value)?;

        let bucket = self.header.bucket_of(key.fold());
        let _chain = self.chain_lock.lock();
        let head = self.header.read(&pin, bucket)?;
        pin.write_u64(row, head)?;
        self.header.write(&pin, bucket, row)?;
        Ok(row + Self::PREFIX_SIZE)
    }

    /// Public offset of the most recently stored value with `key`, if any.
    pub fn find(&self, key: &K) -> Result<Option<FileOffset>> {
        let pin = self.file.pin();
        self.find_in(&pin, key).map(|found| found.map(|(row, _)| row + Self::PREFIX_SIZE))
    }

    fn find_in(
        &self,
        pin: &MapPin,
        key: &K,
    ) -> Result<Option<(FileOffset, Option<FileOffset>)>> {
        let bucket = self.header.bucket_of(key.fold());
        let mut row = self.header.read(pin, bucket)?;
        let mut previous = None;
        let mut steps = 0u64;
        let limit = self.walk_limit();

        while row != EMPTY_SLAB {
            ensure!(steps < limit, StoreError::CorruptStore);
            if key.matches(pin.bytes(row + NEXT_SIZE, K::SIZE)?) {
                return Ok(Some((row, previous)));
            }
            previous = Some(row);
            row = pin.read_u64(row)?;
            steps += 1;
        }
        Ok(None)
    }

    /// Recovers the key stored in the prefix of the row at `offset`
    /// (a public offset previously returned by `store`).
    pub fn key_at<'a>(&self, pin: &'a MapPin, offset: FileOffset) -> Result<&'a [u8]> {
        ensure!(offset >= Self::PREFIX_SIZE, StoreError::CorruptStore);
        pin.bytes(offset - K::SIZE as u64, K::SIZE)
    }

    /// Applies `update` to the first matching value in place. The caller
    /// serializes conflicting writers.
    pub fn update(
        &self,
        key: &K,
        update: impl FnOnce(&MapPin, FileOffset) -> Result<()>,
    ) -> Result<Option<FileOffset>> {
        let pin = self.file.pin();
        match self.find_in(&pin, key)? {
            Some((row, _)) => {
                let offset = row + Self::PREFIX_SIZE;
                update(&pin, offset)?;
                Ok(Some(offset))
            }
            None => Ok(None),
        }
    }

    /// Unlinks the first matching row from its chain.
    pub fn unlink(&self, key: &K) -> Result<bool> {
        let _chain = self.chain_lock.lock();
        let pin = self.file.pin();
        let Some((row, previous)) = self.find_in(&pin, key)? else {
            return Ok(false);
        };

        let next = pin.read_u64(row)?;
        match previous {
            Some(previous) => pin.write_u64(previous, next)?,
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

    fn table(dir: &std::path::Path, buckets: u64) -> SlabTable<Key> {
        let file = MappedFile::open(dir.join("slabs"), new_remap_mutex(), 50).unwrap();
        file.resize(SlabTable::<Key>::initial_size(buckets)).unwrap();
        let table = SlabTable::new(file, buckets);
        table.create().unwrap();
        table
    }

    fn key(seed: u8) -> Key {
        [seed; 32]
    }

    #[test]
    fn stored_values_are_found_newest_first() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 7);

        table.store(&key(1), 3, |w| w.write_bytes(b"old")).unwrap();
        let newest = table.store(&key(1), 3, |w| w.write_bytes(b"new")).unwrap();

        let found = table.find(&key(1)).unwrap().unwrap();
        assert_eq!(found, newest);
        assert_eq!(table.file().pin().bytes(found, 3).unwrap(), b"new");
    }

    #[test]
    fn variable_sized_values_coexist() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 1);

        let small = table.store(&key(1), 1, |w| w.write_u8(0xAA)).unwrap();
        let large = table
            .store(&key(2), 300, |w| w.write_bytes(&[0xBB; 300]))
            .unwrap();

        let pin = table.file().pin();
        assert_eq!(pin.read_u8(small).unwrap(), 0xAA);
        assert_eq!(pin.bytes(large, 300).unwrap(), &[0xBB; 300][..]);
    }

    #[test]
    fn key_recoverable_from_public_offset() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 7);
        let offset = table.store(&key(9), 4, |w| w.write_u32(1)).unwrap();

        let pin = table.file().pin();
        assert_eq!(table.key_at(&pin, offset).unwrap(), &key(9)[..]);
    }

    #[test]
    fn offsets_stay_valid_across_growth() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 7);

        let offset = table.store(&key(1), 8, |w| w.write_u64(7777)).unwrap();
        for seed in 2..60u8 {
            table
                .store(&key(seed), 512, |w| w.write_bytes(&[seed; 512]))
                .unwrap();
        }
        assert_eq!(table.file().pin().read_u64(offset).unwrap(), 7777);
    }

    #[test]
    fn unlink_skips_to_older_duplicate() {
        let dir = tempdir().unwrap();
        let table = table(dir.path(), 1);

        let old = table.store(&key(1), 1, |w| w.write_u8(1)).unwrap();
        table.store(&key(1), 1, |w| w.write_u8(2)).unwrap();

        assert!(table.unlink(&key(1)).unwrap());
        assert_eq!(table.find(&key(1)).unwrap(), Some(old));
        assert!(table.unlink(&key(1)).unwrap());
        assert_eq!(table.find(&key(1)).unwrap(), None);
    }

    #[test]
    fn table_survives_restart() {
        let dir = tempdir().unwrap();
        {
            let table = table(dir.path(), 7);
            table.store(&key(4), 8, |w| w.write_u64(4444)).unwrap();
            table.sync().unwrap();
        }
        let file = MappedFile::open(dir.path().join("slabs"), new_remap_mutex(), 50).unwrap();
        let table = SlabTable::<Key>::new(file, 7);
        table.start().unwrap();

        let found = table.find(&key(4)).unwrap().unwrap();
        assert_eq!(table.file().pin().read_u64(found).unwrap(), 4444);
    }
}
