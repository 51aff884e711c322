//! # Transaction Store
//!
//! Slab-table store of transactions keyed by hash, carrying mutable
//! metadata in front of the transaction body. Record format:
//!
//! ```text
//! [ height/forks/code:4 ]  \
//! [ position:2          ]   }  metadata, guarded by the metadata lock
//! [ state:1             ]  /
//! [ output_count:varint ]
//! [ per output:
//!     [ index_spend:1 ][ spender_height:4 ]   <- mutated in place on spend
//!     [ value:8 ][ script:varint ]
//! ]...
//! [ input_count:varint ]
//! [ per input: [ hash:32 ][ index:2 ][ script:varint ][ sequence:4 ] ]...
//! [ locktime:varint ]
//! [ version:varint ]
//! ```
//!
//! When `state` is `Invalid` the height field holds an error code; when the
//! transaction is not confirmed the position is the `0xFFFF` sentinel and
//! the height field holds the validation fork context instead.
//!
//! The three metadata fields form one atomic unit behind `metadata_lock`:
//! writers take it exclusively, readers snapshot all three under the shared
//! side. Per-output spender heights are 32-bit stores through the mapping's
//! atomic helper; readers outside the serialized validation sequence may
//! observe them mid-update, which the deferred reader documents.

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::RwLock;

use crate::chain::{Hash, OutPoint, Output, Transaction};
use crate::encoding::{decode_varint, ByteWriter};
use crate::error::StoreError;
use crate::storage::{FileOffset, MapPin, MappedFile, SlabTable};
use crate::store::transaction_result::TransactionResult;
use crate::store::utxo_cache::UtxoCache;

/// Height + position + state.
pub const METADATA_SIZE: u64 = 7;

/// Spender-height sentinel for an unspent output.
pub const NOT_SPENT: u32 = u32::MAX;

/// Position sentinel for a transaction not associated with a block.
pub const UNCONFIRMED_POSITION: u16 = u16::MAX;

/// Height sentinel for a transaction verified under an unknown fork state.
pub const UNVERIFIED_HEIGHT: u32 = u32::MAX;

/// Confirmation state of a stored transaction. `missing` exists only at
/// the interface (an absent lookup), never on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TxState {
    Invalid = 1,
    Pooled = 2,
    Indexed = 3,
    Confirmed = 4,
}

impl TxState {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Invalid),
            2 => Ok(Self::Pooled),
            3 => Ok(Self::Indexed),
            4 => Ok(Self::Confirmed),
            _ => Err(StoreError::CorruptStore)
                .wrap_err_with(|| format!("invalid transaction state {}", value)),
        }
    }
}

/// Validation view of a previous output, as consumed by the consensus
/// layer.
#[derive(Debug, Clone)]
pub struct PrevoutInfo {
    pub output: Output,
    pub height: u32,
    pub coinbase_height: Option<u32>,
    pub confirmed: bool,
    pub spent: bool,
}

/// Reads a varint from the mapping without running past the file end.
pub(crate) fn read_varint_at(pin: &MapPin, offset: u64) -> Result<(u64, u64)> {
    let available = (pin.len() as u64).saturating_sub(offset).min(9);
    ensure!(available > 0, StoreError::CorruptStore);
    let bytes = pin.bytes(offset, available as usize)?;
    let (value, consumed) = decode_varint(bytes)?;
    Ok((value, consumed as u64))
}

/// Walks to output `index` of the slab at `offset`, returning the file
/// offset of its `index_spend` byte, or `None` if the index is out of
/// range.
pub(crate) fn locate_output(
    pin: &MapPin,
    offset: FileOffset,
    index: u32,
) -> Result<Option<FileOffset>> {
    let mut cursor = offset + METADATA_SIZE;
    let (output_count, consumed) = read_varint_at(pin, cursor)?;
    cursor += consumed;
    if index as u64 >= output_count {
        return Ok(None);
    }
    for _ in 0..index {
        cursor += 1 + 4 + 8;
        let (script_len, consumed) = read_varint_at(pin, cursor)?;
        cursor += consumed + script_len;
    }
    Ok(Some(cursor))
}

/// Serializes the transaction body in slab form, all outputs unspent.
pub(crate) fn encode_body(tx: &Transaction) -> Vec<u8> {
    let mut writer = ByteWriter::with_capacity(64 + 48 * tx.inputs.len() + 48 * tx.outputs.len());
    writer.write_varint(tx.outputs.len() as u64);
    for output in &tx.outputs {
        writer.write_u8(0);
        writer.write_u32(NOT_SPENT);
        writer.write_u64(output.value);
        writer.write_var_bytes(&output.script);
    }
    writer.write_varint(tx.inputs.len() as u64);
    for input in &tx.inputs {
        writer.write_bytes(&input.previous_output.hash);
        writer.write_u16(squeeze_index(input.previous_output.index));
        writer.write_var_bytes(&input.script);
        writer.write_u32(input.sequence);
    }
    writer.write_varint(tx.locktime as u64);
    writer.write_varint(tx.version as u64);
    writer.into_bytes()
}

/// Prevout indexes store in two bytes; the null-point marker maps onto the
/// 16-bit sentinel and back.
fn squeeze_index(index: u32) -> u16 {
    if index == OutPoint::NULL_INDEX {
        u16::MAX
    } else {
        index as u16
    }
}

pub(crate) fn expand_index(index: u16) -> u32 {
    if index == u16::MAX {
        OutPoint::NULL_INDEX
    } else {
        index as u32
    }
}

pub struct TransactionStore {
    table: SlabTable<Hash>,
    metadata_lock: RwLock<()>,
    cache: UtxoCache,
}

impl TransactionStore {
    pub fn new(file: Arc<MappedFile>, buckets: u64, cache_capacity: usize) -> Self {
        Self {
            table: SlabTable::new(file, buckets),
            metadata_lock: RwLock::new(()),
            cache: UtxoCache::new(cache_capacity),
        }
    }

    /// File length required by an empty store.
    pub fn initial_size(buckets: u64) -> u64 {
        SlabTable::<Hash>::initial_size(buckets)
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

    /// Writes the arena counter back to the file header.
    pub fn commit(&self) -> Result<()> {
        self.table.sync()
    }

    pub fn flush(&self) -> Result<()> {
        self.table.file().flush()
    }

    fn metadata_at(&self, pin: &MapPin, offset: FileOffset) -> Result<(u32, u16, TxState)> {
        let _shared = self.metadata_lock.read();
        let height = pin.read_u32(offset)?;
        let position = pin.read_u16(offset + 4)?;
        let state = TxState::from_u8(pin.read_u8(offset + 6)?)?;
        Ok((height, position, state))
    }

    /// Offset of the most recently stored transaction with `hash`.
    pub fn find_offset(&self, hash: &Hash) -> Result<Option<FileOffset>> {
        self.table.find(hash)
    }

    /// Looks a transaction up by hash.
    pub fn get(&self, hash: &Hash) -> Result<Option<TransactionResult>> {
        let Some(offset) = self.table.find(hash)? else {
            return Ok(None);
        };
        Ok(Some(self.result_at(offset, *hash)?))
    }

    /// Looks a transaction up by its stored offset, recovering the hash
    /// from the slab prefix.
    pub fn get_at(&self, offset: FileOffset) -> Result<TransactionResult> {
        let pin = self.table.file().pin();
        let hash: Hash = self
            .table
            .key_at(&pin, offset)?
            .try_into()
            .expect("prefix key is 32 bytes");
        drop(pin);
        self.result_at(offset, hash)
    }

    fn result_at(&self, offset: FileOffset, hash: Hash) -> Result<TransactionResult> {
        let pin = self.table.file().pin();
        let (height, position, state) = self.metadata_at(&pin, offset)?;
        Ok(TransactionResult::new(pin, offset, hash, height, position, state))
    }

    /// Stores `tx`. A confirming store first spends the transaction's
    /// previous outputs at `height`, then either promotes an existing copy
    /// in place or writes a fresh slab whose metadata is populated before
    /// the slab is linked.
    pub fn store(
        &self,
        tx: &Transaction,
        height: u32,
        position: u16,
        state: TxState,
    ) -> Result<FileOffset> {
        let confirming = state == TxState::Confirmed;
        let hash = tx.hash();

        if confirming {
            for input in &tx.inputs {
                self.spend(&input.previous_output, height)
                    .wrap_err("failed to spend a previous output")?;
            }
            if let Some(offset) = self.table.find(&hash)? {
                self.cache.add(tx, height, confirming);
                self.confirm(offset, height, position, state)?;
                return Ok(offset);
            }
        }

        let body = encode_body(tx);
        let size = METADATA_SIZE + body.len() as u64;
        let offset = self.table.store(&hash, size, |writer| {
            writer.write_u32(height);
            writer.write_u16(position);
            writer.write_u8(state as u8);
            writer.write_bytes(&body);
        })?;
        self.cache.add(tx, height, confirming);
        Ok(offset)
    }

    /// Marks the `point.index`-th output of the pointed-at transaction as
    /// spent at `spender_height` (or unspent for the `NOT_SPENT`
    /// sentinel). The previous transaction must be confirmed at or below
    /// the spender height.
    pub fn spend(&self, point: &OutPoint, spender_height: u32) -> Result<()> {
        // Coinbase inputs have nothing to spend.
        if point.is_null() {
            return Ok(());
        }
        if spender_height != NOT_SPENT {
            self.cache.remove(point);
        }

        let Some(offset) = self.table.find(&point.hash)? else {
            return Err(StoreError::StateViolation.into());
        };

        let pin = self.table.file().pin();
        let (height, _, state) = self.metadata_at(&pin, offset)?;
        ensure!(
            state == TxState::Confirmed && height <= spender_height,
            StoreError::StateViolation
        );

        let Some(field) = locate_output(&pin, offset, point.index)? else {
            return Err(StoreError::StateViolation.into());
        };
        pin.write(field, &[(spender_height != NOT_SPENT) as u8])?;
        pin.store_u32_atomic(field + 1, spender_height)
    }

    /// Reverses a confirmed transaction to the pool: unspends its previous
    /// outputs and downgrades its metadata to the unverified sentinels.
    pub fn pool(&self, tx: &Transaction, offset: FileOffset) -> Result<()> {
        for input in &tx.inputs {
            self.spend(&input.previous_output, NOT_SPENT)
                .wrap_err("failed to unspend a previous output")?;
        }

        // The cache holds confirmed outputs only; this tx no longer is.
        let hash = tx.hash();
        for index in 0..tx.outputs.len() as u32 {
            self.cache.remove(&OutPoint::new(hash, index));
        }

        self.confirm(offset, UNVERIFIED_HEIGHT, UNCONFIRMED_POSITION, TxState::Pooled)
    }

    /// Rewrites the metadata tuple in place as one atomic unit.
    pub fn confirm(
        &self,
        offset: FileOffset,
        height: u32,
        position: u16,
        state: TxState,
    ) -> Result<()> {
        let pin = self.table.file().pin();
        let _exclusive = self.metadata_lock.write();
        pin.write_u32(offset, height)?;
        pin.write_u16(offset + 4, position)?;
        pin.write(offset + 6, &[state as u8])
    }

    /// Populates the validation view of `point` at `fork_height`. Returns
    /// `None` when the prevout cannot be populated: unknown hash, genesis
    /// coinbase, insufficient confirmation, or index out of range.
    pub fn get_output(&self, point: &OutPoint, fork_height: u32) -> Result<Option<PrevoutInfo>> {
        if point.is_null() {
            return Ok(None);
        }

        if let Some(hit) = self.cache.populate(point, fork_height) {
            return Ok(Some(PrevoutInfo {
                output: Output {
                    value: hit.value,
                    script: hit.script,
                },
                height: hit.height,
                coinbase_height: hit.coinbase.then_some(hit.height),
                confirmed: true,
                spent: false,
            }));
        }

        let Some(result) = self.get(&point.hash)? else {
            return Ok(None);
        };

        // The genesis coinbase is never spendable.
        let height = result.height();
        if height == 0 {
            return Ok(None);
        }

        let state = result.state();
        let require_confirmed = fork_height != u32::MAX;
        let confirmed = (state == TxState::Indexed && require_confirmed)
            || (state == TxState::Confirmed && height <= fork_height);
        if require_confirmed && !confirmed {
            return Ok(None);
        }

        let Some(record) = result.output(point.index)? else {
            return Ok(None);
        };

        let spent = confirmed
            && record.spender_height != NOT_SPENT
            && record.spender_height <= fork_height;

        Ok(Some(PrevoutInfo {
            output: record.output,
            height,
            coinbase_height: (result.position() == 0).then_some(height),
            confirmed: state == TxState::Indexed || state == TxState::Confirmed,
            spent,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Input;
    use crate::storage::new_remap_mutex;
    use tempfile::tempdir;

    const BUCKETS: u64 = 101;

    fn store(dir: &std::path::Path) -> TransactionStore {
        let file = MappedFile::open(dir.join("tx_table"), new_remap_mutex(), 50).unwrap();
        file.resize(TransactionStore::initial_size(BUCKETS)).unwrap();
        let store = TransactionStore::new(file, BUCKETS, 100);
        store.create().unwrap();
        store
    }

    fn coinbase(height_tag: u8, outputs: usize) -> Transaction {
        Transaction {
            version: 1,
            locktime: 0,
            inputs: vec![Input {
                previous_output: OutPoint::null(),
                script: vec![height_tag],
                sequence: u32::MAX,
            }],
            outputs: (0..outputs)
                .map(|i| Output {
                    value: 50 + i as u64,
                    script: vec![height_tag, i as u8],
                })
                .collect(),
        }
    }

    fn spender(prev: &Transaction, prev_index: u32) -> Transaction {
        Transaction {
            version: 1,
            locktime: 0,
            inputs: vec![Input {
                previous_output: OutPoint::new(prev.hash(), prev_index),
                script: vec![0xEE],
                sequence: u32::MAX,
            }],
            outputs: vec![Output {
                value: 1,
                script: vec![0xDD],
            }],
        }
    }

    #[test]
    fn stored_transaction_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let tx = coinbase(1, 3);

        store.store(&tx, 1, 0, TxState::Confirmed).unwrap();
        let result = store.get(&tx.hash()).unwrap().unwrap();
        assert_eq!(result.height(), 1);
        assert_eq!(result.position(), 0);
        assert_eq!(result.state(), TxState::Confirmed);
        assert_eq!(result.transaction().unwrap(), tx);
    }

    #[test]
    fn get_at_recovers_hash_from_prefix() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let tx = coinbase(2, 1);

        let offset = store.store(&tx, 1, 0, TxState::Confirmed).unwrap();
        let result = store.get_at(offset).unwrap();
        assert_eq!(result.hash(), tx.hash());
        assert_eq!(result.transaction().unwrap(), tx);
    }

    #[test]
    fn spend_requires_confirmed_at_or_below_height() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let tx = coinbase(3, 1);
        store.store(&tx, 5, 0, TxState::Confirmed).unwrap();
        let point = OutPoint::new(tx.hash(), 0);

        // Earlier spender height than the confirmation is a violation.
        let err = store.spend(&point, 4).unwrap_err();
        assert_eq!(crate::error::store_error(&err), Some(StoreError::StateViolation));

        store.spend(&point, 9).unwrap();
        let result = store.get(&tx.hash()).unwrap().unwrap();
        assert_eq!(result.output(0).unwrap().unwrap().spender_height, 9);
    }

    #[test]
    fn spend_of_unknown_or_pooled_tx_is_a_violation() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        let missing = OutPoint::new([9u8; 32], 0);
        let err = store.spend(&missing, 4).unwrap_err();
        assert_eq!(crate::error::store_error(&err), Some(StoreError::StateViolation));

        let pooled = coinbase(4, 1);
        store
            .store(&pooled, UNVERIFIED_HEIGHT, UNCONFIRMED_POSITION, TxState::Pooled)
            .unwrap();
        let err = store.spend(&OutPoint::new(pooled.hash(), 0), 4).unwrap_err();
        assert_eq!(crate::error::store_error(&err), Some(StoreError::StateViolation));
    }

    #[test]
    fn is_spent_needs_every_output_spent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let tx = coinbase(5, 2);
        store.store(&tx, 1, 0, TxState::Confirmed).unwrap();

        store.spend(&OutPoint::new(tx.hash(), 0), 2).unwrap();
        let result = store.get(&tx.hash()).unwrap().unwrap();
        assert!(!result.is_spent(u32::MAX).unwrap());

        store.spend(&OutPoint::new(tx.hash(), 1), 3).unwrap();
        let result = store.get(&tx.hash()).unwrap().unwrap();
        assert!(result.is_spent(u32::MAX).unwrap());
        // Relative to a fork below the second spend, one output is unspent.
        assert!(!result.is_spent(2).unwrap());
    }

    #[test]
    fn confirming_a_pooled_transaction_promotes_in_place() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let parent = coinbase(6, 1);
        store.store(&parent, 1, 0, TxState::Confirmed).unwrap();

        let child = spender(&parent, 0);
        let pooled_offset = store
            .store(&child, UNVERIFIED_HEIGHT, UNCONFIRMED_POSITION, TxState::Pooled)
            .unwrap();

        let confirmed_offset = store.store(&child, 2, 1, TxState::Confirmed).unwrap();
        assert_eq!(pooled_offset, confirmed_offset, "promotion must reuse the slab");

        let result = store.get(&child.hash()).unwrap().unwrap();
        assert_eq!(result.height(), 2);
        assert_eq!(result.position(), 1);
        assert_eq!(result.state(), TxState::Confirmed);

        // The parent output is now spent at height 2.
        let parent_result = store.get(&parent.hash()).unwrap().unwrap();
        assert_eq!(parent_result.output(0).unwrap().unwrap().spender_height, 2);
    }

    #[test]
    fn pool_reverses_spends_and_metadata() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let parent = coinbase(7, 1);
        store.store(&parent, 1, 0, TxState::Confirmed).unwrap();

        let child = spender(&parent, 0);
        let offset = store.store(&child, 2, 1, TxState::Confirmed).unwrap();

        store.pool(&child, offset).unwrap();

        let result = store.get(&child.hash()).unwrap().unwrap();
        assert_eq!(result.state(), TxState::Pooled);
        assert_eq!(result.position(), UNCONFIRMED_POSITION);
        assert_eq!(result.height(), UNVERIFIED_HEIGHT);

        let parent_result = store.get(&parent.hash()).unwrap().unwrap();
        assert_eq!(
            parent_result.output(0).unwrap().unwrap().spender_height,
            NOT_SPENT
        );
    }

    #[test]
    fn get_output_applies_confirmation_rules() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let tx = coinbase(8, 1);
        store.store(&tx, 4, 0, TxState::Confirmed).unwrap();
        let point = OutPoint::new(tx.hash(), 0);

        let info = store.get_output(&point, u32::MAX).unwrap().unwrap();
        assert!(!info.spent);
        assert_eq!(info.coinbase_height, Some(4));

        // Below the confirmation height the output is not populated.
        assert!(store.get_output(&point, 3).unwrap().is_none());

        // Out-of-range index is not populated.
        let bad = OutPoint::new(tx.hash(), 9);
        assert!(store.get_output(&bad, u32::MAX).unwrap().is_none());
    }

    #[test]
    fn indexed_state_counts_only_at_bounded_fork_heights() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let tx = coinbase(12, 1);
        store.store(&tx, 1, 0, TxState::Confirmed).unwrap();
        let point = OutPoint::new(tx.hash(), 0);

        // Spend while confirmed, then demote to the indexed branch; the
        // spender height stays in the record.
        store.spend(&point, 4).unwrap();
        let offset = store.find_offset(&tx.hash()).unwrap().unwrap();
        store.confirm(offset, 1, 0, TxState::Indexed).unwrap();

        let result = store.get(&tx.hash()).unwrap().unwrap();
        assert_eq!(result.state(), TxState::Indexed);

        // The unbounded current-state check does not trust the indexed
        // branch, so the tx reads as unspent there.
        assert!(!result.is_spent(u32::MAX).unwrap());
        // Bounded at or above the spender height it is fully spent.
        assert!(result.is_spent(4).unwrap());
        // Bounded below the spender height the output is still unspent.
        assert!(!result.is_spent(3).unwrap());

        // get_output mirrors the same rule: populated and spent at a
        // bounded fork height covering the spend...
        let bounded = store.get_output(&point, 4).unwrap().unwrap();
        assert!(bounded.confirmed);
        assert!(bounded.spent);
        let earlier = store.get_output(&point, 3).unwrap().unwrap();
        assert!(!earlier.spent);
        // ...and populated unspent at the unbounded check, where indexed
        // does not count as confirmed.
        let unbounded = store.get_output(&point, u32::MAX).unwrap().unwrap();
        assert!(!unbounded.spent);
    }

    #[test]
    fn genesis_output_is_never_populated() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let genesis = coinbase(0, 1);
        store.store(&genesis, 0, 0, TxState::Confirmed).unwrap();

        let point = OutPoint::new(genesis.hash(), 0);
        assert!(store.get_output(&point, u32::MAX).unwrap().is_none());
        assert!(store.get_output(&point, 10).unwrap().is_none());
    }

    #[test]
    fn spent_output_reports_spent_relative_to_fork() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let parent = coinbase(9, 1);
        store.store(&parent, 1, 0, TxState::Confirmed).unwrap();
        let child = spender(&parent, 0);
        store.store(&child, 2, 1, TxState::Confirmed).unwrap();

        let point = OutPoint::new(parent.hash(), 0);
        let at_two = store.get_output(&point, 2).unwrap().unwrap();
        assert!(at_two.spent);
        assert_eq!(at_two.coinbase_height, Some(1));

        // At fork height 1 the spend has not happened yet.
        let at_one = store.get_output(&point, 1).unwrap().unwrap();
        assert!(!at_one.spent);
    }
}
