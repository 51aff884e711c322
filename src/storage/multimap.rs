//! # Record Multimap
//!
//! One primary row per distinct key mapping to the head of an intrusive
//! list of value rows that share the key. The primary rows live in a record
//! hash table (value = 4-byte head index); the value rows live in a
//! separate record arena, usually in their own file:
//!
//! ```text
//! lookup file:  [ key ][ next ][ head_index ]
//! rows file:    [ next:4 ][ payload ]  <- newest row first
//! ```
//!
//! `add_row` prepends; `delete_last_row` unlinks the newest row and leaves
//! the primary in place even when its list empties. Iteration is forward
//! only and bounded by the arena's row count.

use eyre::{ensure, Result};
use parking_lot::Mutex;

use crate::error::StoreError;
use crate::encoding::ByteWriter;
use crate::storage::{ArrayIndex, MapPin, RecordManager, RecordTable, TableKey, EMPTY_RECORD};

const NEXT_SIZE: u64 = 4;

pub struct RecordMultimap<K: TableKey> {
    table: RecordTable<K>,
    rows: RecordManager,
    map_lock: Mutex<()>,
}

impl<K: TableKey> RecordMultimap<K> {
    /// `table` must carry 4-byte values (the head index); `rows` carries
    /// `[next:4 | payload]` records.
    pub fn new(table: RecordTable<K>, rows: RecordManager) -> Self {
        Self {
            table,
            rows,
            map_lock: Mutex::new(()),
        }
    }

    pub fn table(&self) -> &RecordTable<K> {
        &self.table
    }

    pub fn rows(&self) -> &RecordManager {
        &self.rows
    }

    pub fn payload_size(&self) -> u64 {
        self.rows.record_size() - NEXT_SIZE
    }

    pub fn create(&self) -> Result<()> {
        self.table.create()?;
        self.rows.create()
    }

    pub fn start(&self) -> Result<()> {
        self.table.start()?;
        self.rows.start()
    }

    pub fn sync(&self) -> Result<()> {
        self.table.sync()?;
        self.rows.sync()
    }

    /// File offset of a value row's payload.
    pub fn payload_offset(&self, row: ArrayIndex) -> u64 {
        self.rows.offset(row) + NEXT_SIZE
    }

    /// Allocates a value row, fills its payload from `write`, and prepends
    /// it to `key`'s list, creating the primary row on first use.
    pub fn add_row(&self, key: &K, write: impl FnOnce(&mut ByteWriter)) -> Result<ArrayIndex> {
        let mut payload = ByteWriter::with_capacity(self.payload_size() as usize);
        write(&mut payload);
        let payload = payload.into_bytes();
        ensure!(
            payload.len() as u64 == self.payload_size(),
            "multimap payload is {} bytes, rows carry {}",
            payload.len(),
            self.payload_size()
        );

        // Allocate outside any pin.
        let row = self.rows.new_records(1)?;
        let row_offset = self.rows.offset(row);

        let _map = self.map_lock.lock();
        match self.table.find(key)? {
            Some(primary) => {
                let rows_pin = self.rows.file().pin();
                let table_pin = self.table.file().pin();
                let head = table_pin.read_u32(self.table.value_offset(primary))?;
                rows_pin.write_u32(row_offset, head)?;
                rows_pin.write(row_offset + NEXT_SIZE, &payload)?;
                // Publish after the row is fully written.
                table_pin.write_u32(self.table.value_offset(primary), row)?;
            }
            None => {
                let rows_pin = self.rows.file().pin();
                rows_pin.write_u32(row_offset, EMPTY_RECORD)?;
                rows_pin.write(row_offset + NEXT_SIZE, &payload)?;
                drop(rows_pin);
                self.table.store(key, |value| value.write_u32(row))?;
            }
        }
        Ok(row)
    }

    /// Head row index of `key`'s list, `None` when the key has no rows.
    pub fn lookup(&self, key: &K) -> Result<Option<ArrayIndex>> {
        let Some(primary) = self.table.find(key)? else {
            return Ok(None);
        };
        let head = self
            .table
            .file()
            .pin()
            .read_u32(self.table.value_offset(primary))?;
        Ok((head != EMPTY_RECORD).then_some(head))
    }

    /// Unlinks the newest row of `key`'s list. The primary row remains even
    /// when the list becomes empty.
    pub fn delete_last_row(&self, key: &K) -> Result<bool> {
        let _map = self.map_lock.lock();
        let Some(primary) = self.table.find(key)? else {
            return Ok(false);
        };

        let table_pin = self.table.file().pin();
        let head = table_pin.read_u32(self.table.value_offset(primary))?;
        if head == EMPTY_RECORD {
            return Ok(false);
        }

        let next = self.rows.file().pin().read_u32(self.rows.offset(head))?;
        table_pin.write_u32(self.table.value_offset(primary), next)?;
        Ok(true)
    }

    /// Walks `key`'s list from `head`, newest first.
    pub fn walk(&self, head: ArrayIndex) -> RowWalker<'_> {
        RowWalker {
            rows: &self.rows,
            pin: self.rows.file().pin(),
            next: head,
            steps: 0,
            limit: self.rows.count(),
        }
    }
}

/// Forward-only, finite, non-restartable iteration over a value-row list.
pub struct RowWalker<'a> {
    rows: &'a RecordManager,
    pin: MapPin,
    next: ArrayIndex,
    steps: u64,
    limit: u64,
}

impl RowWalker<'_> {
    /// Next row index, or `None` at the tail. A walk longer than the arena
    /// has rows means a cycle: store corruption.
    pub fn next(&mut self) -> Result<Option<ArrayIndex>> {
        if self.next == EMPTY_RECORD {
            return Ok(None);
        }
        ensure!(self.steps < self.limit, StoreError::CorruptStore);
        self.steps += 1;

        let current = self.next;
        self.next = self.pin.read_u32(self.rows.offset(current))?;
        Ok(Some(current))
    }
}
