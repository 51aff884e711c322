//! # Block Store
//!
//! Record-table store of block headers and block associations, keyed by
//! block hash, plus three side arenas:
//!
//! - a header index (height -> record index, the header branch),
//! - a block index (height -> record index, the confirmed-block branch),
//! - a transaction-offset index (runs of slab offsets, one run per block).
//!
//! Record value [95 bytes]:
//!
//! ```text
//! [ header:80  ] const
//! [ height:4   ] const
//! [ checksum:4 ] \
//! [ tx_start:4 ]  } mutable, guarded by the metadata lock
//! [ tx_count:2 ]  }
//! [ state:1    ] /
//! ```
//!
//! Height indexes are written under the index lock; gaps created by
//! out-of-order parallel import are zeroized to the empty sentinel so
//! `exists`/`gaps` can detect them after a restart. `unconfirm` is the
//! only operation that shrinks an index.

use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::{Mutex, RwLock};

use crate::chain::{Block, Hash, Header, HEADER_SIZE};
use crate::error::StoreError;
use crate::storage::{
    ArrayIndex, FileOffset, MapPin, MappedFile, RecordManager, RecordTable, COUNT_SIZE,
    EMPTY_RECORD,
};

const HEIGHT_OFFSET: u64 = HEADER_SIZE as u64;
const CHECKSUM_OFFSET: u64 = HEIGHT_OFFSET + 4;
const TX_START_OFFSET: u64 = CHECKSUM_OFFSET + 4;
const TX_COUNT_OFFSET: u64 = TX_START_OFFSET + 4;
const STATE_OFFSET: u64 = TX_COUNT_OFFSET + 2;
const VALUE_SIZE: u64 = STATE_OFFSET + 1;

const NO_CHECKSUM: u32 = 0;

const STATE_UNCONFIRMED: u8 = 0;
const STATE_CONFIRMED: u8 = 1;

fn to_state(confirmed: bool) -> u8 {
    if confirmed {
        STATE_CONFIRMED
    } else {
        STATE_UNCONFIRMED
    }
}

/// Which height index to consult: the confirmed-block branch or the
/// header branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Block,
    Header,
}

pub struct BlockStore {
    table: RecordTable<Hash>,
    header_index: RecordManager,
    block_index: RecordManager,
    tx_index: RecordManager,
    metadata_lock: RwLock<()>,
    index_lock: Mutex<()>,
}

impl BlockStore {
    pub fn new(
        lookup_file: Arc<MappedFile>,
        header_index_file: Arc<MappedFile>,
        block_index_file: Arc<MappedFile>,
        tx_index_file: Arc<MappedFile>,
        buckets: u64,
    ) -> Self {
        Self {
            table: RecordTable::new(lookup_file, buckets, VALUE_SIZE),
            header_index: RecordManager::new(header_index_file, 0, 4),
            block_index: RecordManager::new(block_index_file, 0, 4),
            tx_index: RecordManager::new(tx_index_file, 0, 8),
            metadata_lock: RwLock::new(()),
            index_lock: Mutex::new(()),
        }
    }

    /// File length required by an empty lookup file.
    pub fn initial_lookup_size(buckets: u64) -> u64 {
        RecordTable::<Hash>::initial_size(buckets)
    }

    /// File length required by an empty index file.
    pub fn initial_index_size() -> u64 {
        COUNT_SIZE
    }

    pub fn create(&self) -> Result<()> {
        self.table.create()?;
        self.header_index.create()?;
        self.block_index.create()?;
        self.tx_index.create()
    }

    pub fn start(&self) -> Result<()> {
        self.table.start()?;
        self.header_index.start()?;
        self.block_index.start()?;
        self.tx_index.start()?;
        self.table.file().advise_random();
        Ok(())
    }

    /// Writes every arena counter back to its header cell.
    pub fn commit(&self) -> Result<()> {
        self.table.sync()?;
        self.header_index.sync()?;
        self.block_index.sync()?;
        self.tx_index.sync()
    }

    pub fn flush(&self) -> Result<()> {
        self.table.file().flush()?;
        self.header_index.file().flush()?;
        self.block_index.file().flush()?;
        self.tx_index.file().flush()
    }

    pub fn files(&self) -> [&Arc<MappedFile>; 4] {
        [
            self.table.file(),
            self.header_index.file(),
            self.block_index.file(),
            self.tx_index.file(),
        ]
    }

    fn index(&self, kind: IndexKind) -> &RecordManager {
        match kind {
            IndexKind::Block => &self.block_index,
            IndexKind::Header => &self.header_index,
        }
    }

    /// Height of the highest indexed entry, `None` on an empty chain.
    pub fn top(&self, kind: IndexKind) -> Option<u64> {
        let count = self.index(kind).count();
        (count > 0).then(|| count - 1)
    }

    /// True when `height` is populated in the block index (gap-aware).
    pub fn exists(&self, height: u64) -> Result<bool> {
        Ok(self.get_index(height, IndexKind::Block)?.is_some())
    }

    /// Heights left unpopulated by an interrupted parallel import.
    pub fn gaps(&self) -> Result<Vec<u64>> {
        let count = self.block_index.count();
        let mut gaps = Vec::new();
        for height in 0..count {
            if self.get_index(height, IndexKind::Block)?.is_none() {
                gaps.push(height);
            }
        }
        Ok(gaps)
    }

    fn get_index(&self, height: u64, kind: IndexKind) -> Result<Option<ArrayIndex>> {
        let manager = self.index(kind);
        if height >= manager.count() {
            return Ok(None);
        }
        let cell = manager.file().pin().read_u32(manager.offset(height as ArrayIndex))?;
        Ok((cell != EMPTY_RECORD).then_some(cell))
    }

    /// Publishes `record` at `height`, zeroizing any gap this write opens
    /// so interrupted parallel imports remain detectable.
    fn write_index(&self, record: ArrayIndex, height: u64, kind: IndexKind) -> Result<()> {
        let manager = self.index(kind);
        let _index = self.index_lock.lock();

        let count = manager.count();
        if height + 1 > count {
            let first_new = manager.new_records(height + 1 - count)?;
            let pin = manager.file().pin();
            for fresh in first_new as u64..=height {
                pin.write_u32(manager.offset(fresh as ArrayIndex), EMPTY_RECORD)?;
            }
        }
        manager
            .file()
            .pin()
            .write_u32(manager.offset(height as ArrayIndex), record)
    }

    /// Appends one run of transaction offsets, returning its start index.
    pub fn associate(&self, offsets: &[FileOffset]) -> Result<ArrayIndex> {
        if offsets.is_empty() {
            return Ok(0);
        }
        let start = self.tx_index.new_records(offsets.len() as u64)?;
        let pin = self.tx_index.file().pin();
        for (i, offset) in offsets.iter().enumerate() {
            pin.write_u64(self.tx_index.offset(start + i as ArrayIndex), *offset)?;
        }
        Ok(start)
    }

    fn store_record(
        &self,
        header: &Header,
        height: u64,
        tx_start: ArrayIndex,
        tx_count: u16,
        confirmed: bool,
    ) -> Result<ArrayIndex> {
        ensure!(height <= u32::MAX as u64, StoreError::OperationFailed);
        self.table.store(&header.hash(), |writer| {
            writer.write_bytes(&header.to_wire());
            writer.write_u32(height as u32);
            writer.write_u32(NO_CHECKSUM);
            writer.write_u32(tx_start);
            writer.write_u16(tx_count);
            writer.write_u8(to_state(confirmed));
        })
    }

    /// Stores a header into the header branch.
    pub fn store_header(&self, header: &Header, height: u64) -> Result<()> {
        let record = self.store_record(header, height, 0, 0, false)?;
        self.write_index(record, height, IndexKind::Header)
    }

    /// Stores a block whose transactions were already stored, associating
    /// their slab offsets, and publishes it in the block index.
    pub fn store_block(
        &self,
        block: &Block,
        height: u64,
        tx_offsets: &[FileOffset],
    ) -> Result<()> {
        ensure!(
            tx_offsets.len() == block.transactions.len() && tx_offsets.len() <= u16::MAX as usize,
            StoreError::OperationFailed
        );
        let tx_start = self.associate(tx_offsets)?;
        let record = self.store_record(
            &block.header,
            height,
            tx_start,
            tx_offsets.len() as u16,
            true,
        )?;
        self.write_index(record, height, IndexKind::Block)
    }

    fn result_at(&self, record: ArrayIndex) -> Result<BlockResult<'_>> {
        let pin = self.table.file().pin();
        let hash: Hash = self
            .table
            .key_at(&pin, record)?
            .try_into()
            .expect("key is 32 bytes");
        let value = self.table.value_offset(record);
        let height = pin.read_u32(value + HEIGHT_OFFSET)?;

        let (checksum, tx_start, tx_count, state) = {
            let _shared = self.metadata_lock.read();
            (
                pin.read_u32(value + CHECKSUM_OFFSET)?,
                pin.read_u32(value + TX_START_OFFSET)?,
                pin.read_u16(value + TX_COUNT_OFFSET)?,
                pin.read_u8(value + STATE_OFFSET)?,
            )
        };

        Ok(BlockResult {
            store: self,
            pin,
            value,
            hash,
            height,
            checksum,
            tx_start,
            tx_count,
            confirmed: state == STATE_CONFIRMED,
        })
    }

    /// Looks up the entry indexed at `height` in the chosen branch.
    pub fn get(&self, height: u64, kind: IndexKind) -> Result<Option<BlockResult<'_>>> {
        match self.get_index(height, kind)? {
            Some(record) => Ok(Some(self.result_at(record)?)),
            None => Ok(None),
        }
    }

    /// Looks up the most recently stored entry with `hash`.
    pub fn get_by_hash(&self, hash: &Hash) -> Result<Option<BlockResult<'_>>> {
        match self.table.find(hash)? {
            Some(record) => Ok(Some(self.result_at(record)?)),
            None => Ok(None),
        }
    }

    fn set_state_at(&self, record: ArrayIndex, confirmed: bool) -> Result<()> {
        let pin = self.table.file().pin();
        let _exclusive = self.metadata_lock.write();
        pin.write(
            self.table.value_offset(record) + STATE_OFFSET,
            &[to_state(confirmed)],
        )
    }

    /// Marks every entry at and above `from_height` unconfirmed and
    /// truncates the index — the only place a logical count shrinks.
    pub fn unconfirm(&self, from_height: u64, kind: IndexKind) -> Result<()> {
        let manager = self.index(kind);
        let count = manager.count();
        ensure!(from_height < count, StoreError::OperationFailed);

        for height in from_height..count {
            if let Some(record) = self.get_index(height, kind)? {
                self.set_state_at(record, false)?;
            }
        }
        manager.set_count(from_height);
        Ok(())
    }
}

/// Deferred reader over one block record; pins the lookup mapping for its
/// lifetime.
pub struct BlockResult<'a> {
    store: &'a BlockStore,
    pin: MapPin,
    value: FileOffset,
    hash: Hash,
    height: u32,
    checksum: u32,
    tx_start: u32,
    tx_count: u16,
    confirmed: bool,
}

impl BlockResult<'_> {
    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn height(&self) -> u64 {
        self.height as u64
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn transaction_count(&self) -> usize {
        self.tx_count as usize
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn header(&self) -> Result<Header> {
        Header::from_wire(self.pin.bytes(self.value, HEADER_SIZE)?)
    }

    /// The stored slab offsets of this block's transactions, in position
    /// order.
    pub fn tx_offsets(&self) -> Result<Vec<FileOffset>> {
        let manager = &self.store.tx_index;
        let pin = manager.file().pin();
        let mut offsets = Vec::with_capacity(self.tx_count as usize);
        for i in 0..self.tx_count as u32 {
            offsets.push(pin.read_u64(manager.offset(self.tx_start + i))?);
        }
        Ok(offsets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::new_remap_mutex;
    use tempfile::tempdir;

    const BUCKETS: u64 = 31;

    fn store(dir: &std::path::Path) -> BlockStore {
        let remap = new_remap_mutex();
        let lookup = MappedFile::open(dir.join("block_table"), remap.clone(), 50).unwrap();
        lookup
            .resize(BlockStore::initial_lookup_size(BUCKETS))
            .unwrap();
        let headers = MappedFile::open(dir.join("header_index"), remap.clone(), 50).unwrap();
        headers.resize(BlockStore::initial_index_size()).unwrap();
        let blocks = MappedFile::open(dir.join("block_index"), remap.clone(), 50).unwrap();
        blocks.resize(BlockStore::initial_index_size()).unwrap();
        let txs = MappedFile::open(dir.join("transaction_index"), remap, 50).unwrap();
        txs.resize(BlockStore::initial_index_size()).unwrap();

        let store = BlockStore::new(lookup, headers, blocks, txs, BUCKETS);
        store.create().unwrap();
        store
    }

    fn header(seed: u8) -> Header {
        Header {
            version: 1,
            previous_block_hash: [seed; 32],
            merkle_root: [seed.wrapping_add(1); 32],
            timestamp: 1000 + seed as u32,
            bits: 0x1d00ffff,
            nonce: seed as u32,
        }
    }

    fn block(seed: u8) -> Block {
        Block {
            header: header(seed),
            transactions: vec![],
        }
    }

    #[test]
    fn header_branch_and_block_branch_are_independent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.store_header(&header(1), 0).unwrap();
        assert_eq!(store.top(IndexKind::Header), Some(0));
        assert_eq!(store.top(IndexKind::Block), None);

        store.store_block(&block(1), 0, &[]).unwrap();
        assert_eq!(store.top(IndexKind::Block), Some(0));
    }

    #[test]
    fn stored_block_is_queryable_by_height_and_hash() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let block = block(3);

        store.store_block(&block, 0, &[]).unwrap();

        let by_height = store.get(0, IndexKind::Block).unwrap().unwrap();
        assert_eq!(by_height.hash(), block.hash());
        assert_eq!(by_height.header().unwrap(), block.header);
        assert!(by_height.confirmed());

        let by_hash = store.get_by_hash(&block.hash()).unwrap().unwrap();
        assert_eq!(by_hash.height(), 0);
    }

    #[test]
    fn tx_offset_runs_are_contiguous_and_readable() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let first = store.associate(&[111u64, 222, 333]).unwrap();
        let second = store.associate(&[444u64]).unwrap();
        assert_eq!(second, first + 3);

        let pin = store.tx_index.file().pin();
        for (i, expected) in [111u64, 222, 333].iter().enumerate() {
            let cell = store.tx_index.offset(first + i as u32);
            assert_eq!(pin.read_u64(cell).unwrap(), *expected);
        }
        assert_eq!(pin.read_u64(store.tx_index.offset(second)).unwrap(), 444);
    }

    #[test]
    fn unconfirm_truncates_index_and_flips_state() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        for height in 0..3u64 {
            store.store_block(&block(height as u8), height, &[]).unwrap();
        }
        store.unconfirm(2, IndexKind::Block).unwrap();

        assert_eq!(store.top(IndexKind::Block), Some(1));
        assert!(store.get(2, IndexKind::Block).unwrap().is_none());

        // The record survives by hash, unconfirmed.
        let result = store.get_by_hash(&block(2).hash()).unwrap().unwrap();
        assert!(!result.confirmed());
    }

    #[test]
    fn unconfirm_of_empty_index_fails() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.unconfirm(0, IndexKind::Block).is_err());
    }

    #[test]
    fn out_of_order_writes_leave_detectable_gaps() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.store_block(&block(0), 0, &[]).unwrap();
        // Height 1 skipped.
        store.store_block(&block(2), 2, &[]).unwrap();

        assert!(store.exists(0).unwrap());
        assert!(!store.exists(1).unwrap());
        assert!(store.exists(2).unwrap());
        assert_eq!(store.gaps().unwrap(), vec![1]);
    }
}
