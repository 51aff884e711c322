//! # Write Orchestrator
//!
//! `Database` owns every store, serializes all mutation behind one write
//! mutex, and brackets each mutation with the flush lock:
//!
//! ```text
//! lock write mutex
//!   verify (heights, parents, duplicates)
//!   begin_write            <- flush-lock sentinel appears
//!     mutate stores        <- per-block transaction fan-out
//!     commit counters
//!   end_write              <- flush (optional) then sentinel removed
//! ```
//!
//! A failure after `begin_write` returns without `end_write`, so the
//! sentinel survives the crash and the next `open` refuses until the
//! operator intervenes.
//!
//! ## Parallel transaction push
//!
//! A block of `T` transactions fans out over `K = min(workers, T)` scoped
//! threads; worker `k` owns positions `k, k+K, k+2K, ...`. Slab and row
//! allocation is internally serialized, bucket-chain prepends take their
//! table lock, and everything else lands in disjoint regions, so workers
//! never conflict. A join gates the block-store write and the final
//! commit.
//!
//! ## Reorganization
//!
//! Synchronous: pop every block above the fork point (reversing each
//! transaction to the pool), then push the incoming branch with the same
//! per-block fan-out. One flush bracket spans the whole sequence.

mod files;
mod settings;

pub use files::StoreDirectory;
pub use settings::Settings;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::chain::{Block, Checkpoint, Header, OutPoint, Transaction, NULL_HASH};
use crate::error::StoreError;
use crate::storage::{new_remap_mutex, FileOffset, MappedFile, RemapMutex};
use crate::store::{
    BlockStore, HistoryStore, IndexKind, PaymentRecord, PointKind, SpendStore, StealthRecord,
    StealthStore, TransactionStore, TxState, UNCONFIRMED_POSITION,
};

const MAX_PUSH_WORKERS: usize = 8;

pub struct Database {
    settings: Settings,
    directory: Mutex<StoreDirectory>,
    #[allow(dead_code)]
    remap: RemapMutex,
    blocks: BlockStore,
    transactions: TransactionStore,
    spends: Option<SpendStore>,
    history: Option<HistoryStore>,
    stealth: Option<StealthStore>,
    write_mutex: Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Creates a fresh store in an empty directory, initializes every
    /// file, and pushes the genesis header and block at height 0.
    pub fn create(settings: Settings, genesis: &Block) -> Result<Self> {
        let mut directory = StoreDirectory::new(&settings.directory);
        directory.create()?;
        directory.open()?;

        let db = Self::build(settings, directory)?;
        db.initialize_files()?;

        db.push_header(&genesis.header, 0)
            .wrap_err("failed to push the genesis header")?;
        db.push_block(genesis, 0)
            .wrap_err("failed to push the genesis block")?;

        info!(directory = %db.settings.directory.display(), "created store");
        Ok(db)
    }

    /// Opens an existing store. Refuses when another process holds the
    /// directory or when the flush-lock sentinel marks a torn write.
    pub fn open(settings: Settings) -> Result<Self> {
        let mut directory = StoreDirectory::new(&settings.directory);
        directory.open()?;

        let db = Self::build(settings, directory)?;
        db.blocks.start()?;
        db.transactions.start()?;
        if let Some(spends) = &db.spends {
            spends.start()?;
        }
        if let Some(history) = &db.history {
            history.start()?;
        }
        if let Some(stealth) = &db.stealth {
            stealth.start()?;
        }

        info!(directory = %db.settings.directory.display(), "opened store");
        Ok(db)
    }

    fn build(settings: Settings, directory: StoreDirectory) -> Result<Self> {
        let remap = new_remap_mutex();
        let growth = settings.file_growth_rate;
        let open = |name: &str| -> Result<Arc<MappedFile>> {
            MappedFile::open(directory.file_path(name), remap.clone(), growth)
        };

        let blocks = BlockStore::new(
            open(files::BLOCK_TABLE)?,
            open(files::HEADER_INDEX)?,
            open(files::BLOCK_INDEX)?,
            open(files::TRANSACTION_INDEX)?,
            settings.block_table_buckets,
        );
        let transactions = TransactionStore::new(
            open(files::TRANSACTION_TABLE)?,
            settings.transaction_table_buckets,
            settings.cache_capacity,
        );

        let (spends, history, stealth) = if settings.index_addresses {
            (
                Some(SpendStore::new(
                    open(files::SPEND_TABLE)?,
                    settings.spend_table_buckets,
                )),
                Some(HistoryStore::new(
                    open(files::HISTORY_TABLE)?,
                    open(files::HISTORY_ROWS)?,
                    settings.history_table_buckets,
                )),
                Some(StealthStore::new(open(files::STEALTH_ROWS)?)),
            )
        } else {
            (None, None, None)
        };

        Ok(Self {
            settings,
            directory: Mutex::new(directory),
            remap,
            blocks,
            transactions,
            spends,
            history,
            stealth,
            write_mutex: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    /// Sizes all fresh files and writes their headers and counters.
    fn initialize_files(&self) -> Result<()> {
        let settings = &self.settings;
        let [lookup, headers, blocks, txs] = self.blocks.files();
        lookup.resize(BlockStore::initial_lookup_size(settings.block_table_buckets))?;
        headers.resize(BlockStore::initial_index_size())?;
        blocks.resize(BlockStore::initial_index_size())?;
        txs.resize(BlockStore::initial_index_size())?;
        self.blocks.create()?;

        self.transactions
            .file()
            .resize(TransactionStore::initial_size(
                settings.transaction_table_buckets,
            ))?;
        self.transactions.create()?;

        if let Some(spends) = &self.spends {
            spends
                .file()
                .resize(SpendStore::initial_size(settings.spend_table_buckets))?;
            spends.create()?;
        }
        if let Some(history) = &self.history {
            let [lookup, rows] = history.files();
            lookup.resize(HistoryStore::initial_lookup_size(
                settings.history_table_buckets,
            ))?;
            rows.resize(HistoryStore::initial_rows_size())?;
            history.create()?;
        }
        if let Some(stealth) = &self.stealth {
            stealth.file().resize(StealthStore::initial_size())?;
            stealth.create()?;
        }
        Ok(())
    }

    // Reader interfaces.
    // ------------------------------------------------------------------

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn transactions(&self) -> &TransactionStore {
        &self.transactions
    }

    /// Present only when `index_addresses` is enabled.
    pub fn spends(&self) -> Option<&SpendStore> {
        self.spends.as_ref()
    }

    pub fn history(&self) -> Option<&HistoryStore> {
        self.history.as_ref()
    }

    pub fn stealth(&self) -> Option<&StealthStore> {
        self.stealth.as_ref()
    }

    // Lifecycle.
    // ------------------------------------------------------------------

    /// Commits counters, flushes every file, and releases the directory.
    /// Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.commit_stores()?;
        self.flush_stores()?;
        self.directory.lock().close()
    }

    fn commit_stores(&self) -> Result<()> {
        if let Some(spends) = &self.spends {
            spends.commit()?;
        }
        if let Some(history) = &self.history {
            history.commit()?;
        }
        if let Some(stealth) = &self.stealth {
            stealth.commit()?;
        }
        self.transactions.commit()?;
        self.blocks.commit()
    }

    fn flush_stores(&self) -> Result<()> {
        self.blocks.flush()?;
        self.transactions.flush()?;
        if let Some(spends) = &self.spends {
            spends.flush()?;
        }
        if let Some(history) = &self.history {
            history.flush()?;
        }
        if let Some(stealth) = &self.stealth {
            stealth.flush()?;
        }
        Ok(())
    }

    fn begin_write(&self) -> Result<()> {
        self.directory.lock().begin_write()
    }

    /// Flushes (when configured) and clears the sentinel. Skipping the
    /// flush narrows durability, not consistency: the sentinel bracket
    /// still marks torn writes.
    fn finish_write(&self) -> Result<()> {
        if self.settings.flush_writes {
            self.flush_stores()?;
        }
        self.directory.lock().end_write()
    }

    // Verification.
    // ------------------------------------------------------------------

    fn next_height(&self, kind: IndexKind) -> u64 {
        self.blocks.top(kind).map_or(0, |top| top + 1)
    }

    fn previous_hash(&self, height: u64, kind: IndexKind) -> Result<[u8; 32]> {
        if height == 0 {
            return Ok(NULL_HASH);
        }
        let result = self
            .blocks
            .get(height - 1, kind)?
            .ok_or(StoreError::OperationFailed)?;
        Ok(result.hash())
    }

    fn verify_push_header(&self, header: &Header, height: u64) -> Result<()> {
        ensure!(
            self.next_height(IndexKind::Header) == height,
            StoreError::BlockInvalidHeight
        );
        ensure!(
            self.previous_hash(height, IndexKind::Header)? == header.previous_block_hash,
            StoreError::BlockMissingParent
        );
        Ok(())
    }

    fn verify_push_block(&self, block: &Block, height: u64) -> Result<()> {
        ensure!(!block.transactions.is_empty(), StoreError::EmptyBlock);
        ensure!(
            self.next_height(IndexKind::Block) == height,
            StoreError::BlockInvalidHeight
        );
        ensure!(
            self.previous_hash(height, IndexKind::Block)? == block.header.previous_block_hash,
            StoreError::BlockMissingParent
        );
        Ok(())
    }

    fn verify_push_transaction(&self, tx: &Transaction) -> Result<()> {
        if let Some(result) = self.transactions.get(&tx.hash())? {
            ensure!(result.is_spent(u32::MAX)?, StoreError::UnspentDuplicate);
        }
        Ok(())
    }

    fn verify_top(&self, height: u64, kind: IndexKind) -> Result<()> {
        ensure!(
            self.blocks.top(kind) == Some(height),
            StoreError::OperationFailed
        );
        Ok(())
    }

    fn verify_fork_point(&self, fork_point: &Checkpoint, kind: IndexKind) -> Result<()> {
        let result = self
            .blocks
            .get(fork_point.height, kind)?
            .ok_or(StoreError::OperationFailed)?;
        ensure!(result.hash() == fork_point.hash, StoreError::OperationFailed);
        Ok(())
    }

    // Synchronous writers.
    // ------------------------------------------------------------------

    /// Pushes a validated header onto the header branch.
    pub fn push_header(&self, header: &Header, height: u64) -> Result<()> {
        let _write = self.write_mutex.lock();
        self.verify_push_header(header, height)?;

        self.begin_write()?;
        self.blocks.store_header(header, height)?;
        self.blocks.commit()?;
        self.finish_write()
    }

    /// Pushes a validated, unconfirmed transaction into the pool. The
    /// height field stores the validation fork context.
    pub fn push_transaction(&self, tx: &Transaction, forks: u32) -> Result<()> {
        let _write = self.write_mutex.lock();
        self.verify_push_transaction(tx)?;

        self.begin_write()?;
        self.transactions
            .store(tx, forks, UNCONFIRMED_POSITION, TxState::Pooled)?;
        self.transactions.commit()?;
        self.finish_write()
    }

    /// Pushes a validated block onto the block branch, confirming its
    /// transactions in parallel.
    pub fn push_block(&self, block: &Block, height: u64) -> Result<()> {
        let _write = self.write_mutex.lock();
        self.verify_push_block(block, height)?;

        self.begin_write()?;
        self.push_block_inner(block, height)?;
        self.finish_write()
    }

    fn push_block_inner(&self, block: &Block, height: u64) -> Result<()> {
        let offsets = self.push_transactions(block, height)?;
        self.blocks.store_block(block, height, &offsets)?;
        self.commit_stores()?;
        debug!(height, txs = block.transactions.len(), "pushed block");
        Ok(())
    }

    /// Stores every transaction of `block` as confirmed, fanning out over
    /// `position mod K` slices, and returns the slab offsets in position
    /// order.
    fn push_transactions(&self, block: &Block, height: u64) -> Result<Vec<FileOffset>> {
        let count = block.transactions.len();
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(MAX_PUSH_WORKERS)
            .min(count)
            .max(1);

        if workers == 1 {
            let mut offsets = Vec::with_capacity(count);
            for (position, tx) in block.transactions.iter().enumerate() {
                offsets.push(self.push_one_transaction(tx, height, position)?);
            }
            return Ok(offsets);
        }

        let mut offsets = vec![0u64; count];
        std::thread::scope(|scope| -> Result<()> {
            let mut handles = Vec::with_capacity(workers);
            for bucket in 0..workers {
                let transactions = &block.transactions;
                handles.push(scope.spawn(move || -> Result<Vec<(usize, FileOffset)>> {
                    let mut stored = Vec::new();
                    let mut position = bucket;
                    while position < transactions.len() {
                        let offset =
                            self.push_one_transaction(&transactions[position], height, position)?;
                        stored.push((position, offset));
                        position += workers;
                    }
                    Ok(stored)
                }));
            }
            for handle in handles {
                let stored = handle
                    .join()
                    .map_err(|_| StoreError::OperationFailed)
                    .wrap_err("transaction push worker panicked")??;
                for (position, offset) in stored {
                    offsets[position] = offset;
                }
            }
            Ok(())
        })?;
        Ok(offsets)
    }

    fn push_one_transaction(
        &self,
        tx: &Transaction,
        height: u64,
        position: usize,
    ) -> Result<FileOffset> {
        let offset = self
            .transactions
            .store(tx, height as u32, position as u16, TxState::Confirmed)
            .wrap_err_with(|| format!("failed to store transaction at position {}", position))?;

        if self.settings.index_addresses {
            self.push_inputs(tx, height as u32)?;
            self.push_outputs(tx, height as u32)?;
            self.push_stealth(tx, height as u32)?;
        }
        Ok(offset)
    }

    // Address indexing.
    // ------------------------------------------------------------------

    fn push_inputs(&self, tx: &Transaction, height: u32) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let spends = self.spends.as_ref().expect("indexing enabled");
        let history = self.history.as_ref().expect("indexing enabled");
        let hash = tx.hash();

        for (index, input) in tx.inputs.iter().enumerate() {
            let point = OutPoint::new(hash, index as u32);
            let prevout = &input.previous_output;
            spends.store(prevout, &point)?;

            if let Some(address) = input.address_hash() {
                history.store(
                    &address,
                    PaymentRecord {
                        height,
                        kind: PointKind::Input,
                        point,
                        data: prevout.checksum(),
                    },
                )?;
            }
        }
        Ok(())
    }

    fn push_outputs(&self, tx: &Transaction, height: u32) -> Result<()> {
        let history = self.history.as_ref().expect("indexing enabled");
        let hash = tx.hash();

        for (index, output) in tx.outputs.iter().enumerate() {
            if let Some(address) = output.address_hash() {
                history.store(
                    &address,
                    PaymentRecord {
                        height,
                        kind: PointKind::Output,
                        point: OutPoint::new(hash, index as u32),
                        data: output.value,
                    },
                )?;
            }
        }
        Ok(())
    }

    /// Stealth outputs are paired by convention: the ephemeral key and
    /// prefix ride in one output, the payment address in the next.
    fn push_stealth(&self, tx: &Transaction, height: u32) -> Result<()> {
        let stealth = self.stealth.as_ref().expect("indexing enabled");
        if tx.outputs.is_empty() {
            return Ok(());
        }
        let hash = tx.hash();

        for index in 0..tx.outputs.len() - 1 {
            let Some(address) = tx.outputs[index + 1].address_hash() else {
                continue;
            };
            let Some((ephemeral_key, prefix)) = tx.outputs[index].stealth_metadata() else {
                continue;
            };
            stealth.store(StealthRecord {
                height,
                prefix,
                ephemeral_key,
                address,
                transaction_hash: hash,
            })?;
        }
        Ok(())
    }

    fn pop_inputs(&self, tx: &Transaction) -> Result<()> {
        if tx.is_coinbase() {
            return Ok(());
        }
        let spends = self.spends.as_ref().expect("indexing enabled");
        let history = self.history.as_ref().expect("indexing enabled");

        for input in &tx.inputs {
            ensure!(
                spends.unlink(&input.previous_output)?,
                StoreError::CorruptStore
            );
        }
        for input in &tx.inputs {
            if let Some(address) = input.address_hash() {
                ensure!(history.unlink_last(&address)?, StoreError::CorruptStore);
            }
        }
        Ok(())
    }

    fn pop_outputs(&self, tx: &Transaction) -> Result<()> {
        let history = self.history.as_ref().expect("indexing enabled");
        for output in &tx.outputs {
            if let Some(address) = output.address_hash() {
                ensure!(history.unlink_last(&address)?, StoreError::CorruptStore);
            }
        }
        Ok(())
    }

    // Stealth rows cannot be correlated back to their transaction, so a
    // pop leaves them behind until a re-index.

    // Pop.
    // ------------------------------------------------------------------

    /// Pops the top block, reversing its transactions to the pool, and
    /// returns it.
    pub fn pop_block(&self, height: u64) -> Result<Block> {
        let _write = self.write_mutex.lock();
        self.verify_top(height, IndexKind::Block)?;

        self.begin_write()?;
        let block = self.pop_block_inner(height)?;
        self.finish_write()?;
        Ok(block)
    }

    /// Pops the top header from the header branch.
    pub fn pop_header(&self, height: u64) -> Result<Header> {
        let _write = self.write_mutex.lock();
        self.verify_top(height, IndexKind::Header)?;

        self.begin_write()?;
        let header = self.pop_header_inner(height)?;
        self.finish_write()?;
        Ok(header)
    }

    fn pop_block_inner(&self, height: u64) -> Result<Block> {
        let (header, offsets) = {
            let result = self
                .blocks
                .get(height, IndexKind::Block)?
                .ok_or(StoreError::OperationFailed)?;
            (result.header()?, result.tx_offsets()?)
        };

        let transactions = self.to_transactions(&offsets)?;
        self.pop_transactions(&transactions, &offsets)?;
        self.blocks.unconfirm(height, IndexKind::Block)?;
        self.commit_stores()?;

        debug!(height, txs = transactions.len(), "popped block");
        Ok(Block {
            header,
            transactions,
        })
    }

    fn pop_header_inner(&self, height: u64) -> Result<Header> {
        let (header, offsets) = {
            let result = self
                .blocks
                .get(height, IndexKind::Header)?
                .ok_or(StoreError::OperationFailed)?;
            (result.header()?, result.tx_offsets()?)
        };

        let transactions = self.to_transactions(&offsets)?;
        self.pop_transactions(&transactions, &offsets)?;
        self.blocks.unconfirm(height, IndexKind::Header)?;
        self.commit_stores()?;
        Ok(header)
    }

    /// Reconstructs a block's transactions from its stored offset run.
    fn to_transactions(&self, offsets: &[FileOffset]) -> Result<Vec<Transaction>> {
        let mut transactions = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let result = self.transactions.get_at(*offset)?;
            transactions.push(result.transaction()?);
        }
        Ok(transactions)
    }

    /// Reverses every transaction to the pool, newest position first.
    fn pop_transactions(
        &self,
        transactions: &[Transaction],
        offsets: &[FileOffset],
    ) -> Result<()> {
        for (tx, offset) in transactions.iter().zip(offsets).rev() {
            self.transactions.pool(tx, *offset)?;
            if self.settings.index_addresses {
                self.pop_inputs(tx)?;
                self.pop_outputs(tx)?;
            }
        }
        Ok(())
    }

    // Reorganization.
    // ------------------------------------------------------------------

    /// Replaces everything above `fork_point` with `incoming`, returning
    /// the outgoing blocks oldest first. One flush bracket spans the whole
    /// sequence, so a mid-reorg failure poisons the store for recovery.
    pub fn reorganize(
        &self,
        fork_point: &Checkpoint,
        incoming: &[Block],
    ) -> Result<Vec<Block>> {
        ensure!(
            fork_point.height <= u64::MAX - incoming.len() as u64,
            StoreError::OperationFailed
        );
        let _write = self.write_mutex.lock();
        self.verify_fork_point(fork_point, IndexKind::Block)?;
        let top = self
            .blocks
            .top(IndexKind::Block)
            .ok_or(StoreError::OperationFailed)?;

        self.begin_write()?;

        let mut outgoing = Vec::new();
        for height in (fork_point.height + 1..=top).rev() {
            outgoing.push(self.pop_block_inner(height)?);
        }
        outgoing.reverse();

        for (index, block) in incoming.iter().enumerate() {
            let height = fork_point.height + 1 + index as u64;
            self.verify_push_block(block, height)?;
            self.push_block_inner(block, height)?;
        }

        self.finish_write()?;
        info!(
            fork = fork_point.height,
            popped = outgoing.len(),
            pushed = incoming.len(),
            "reorganized block branch"
        );
        Ok(outgoing)
    }

    /// Header-branch counterpart of `reorganize`.
    pub fn reorganize_headers(
        &self,
        fork_point: &Checkpoint,
        incoming: &[Header],
    ) -> Result<Vec<Header>> {
        ensure!(
            fork_point.height <= u64::MAX - incoming.len() as u64,
            StoreError::OperationFailed
        );
        let _write = self.write_mutex.lock();
        self.verify_fork_point(fork_point, IndexKind::Header)?;
        let top = self
            .blocks
            .top(IndexKind::Header)
            .ok_or(StoreError::OperationFailed)?;

        self.begin_write()?;

        let mut outgoing = Vec::new();
        for height in (fork_point.height + 1..=top).rev() {
            outgoing.push(self.pop_header_inner(height)?);
        }
        outgoing.reverse();

        for (index, header) in incoming.iter().enumerate() {
            let height = fork_point.height + 1 + index as u64;
            self.verify_push_header(header, height)?;
            self.blocks.store_header(header, height)?;
        }
        self.blocks.commit()?;

        self.finish_write()?;
        Ok(outgoing)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
