//! # Store Directory
//!
//! The database is a directory with a fixed set of named files, an
//! exclusive-access lockfile, and the flush-lock sentinel.
//!
//! ```text
//! store_dir/
//! ├── exclusive_lock       # fs2 exclusive lock, one process at a time
//! ├── flush_lock           # present only inside a write bracket
//! ├── block_table          # block record hash table
//! ├── header_index         # height -> block record (header branch)
//! ├── block_index          # height -> block record (block branch)
//! ├── transaction_index    # per-block runs of tx slab offsets
//! ├── transaction_table    # tx slab hash table
//! ├── spend_table          # outpoint -> inpoint       (indexes only)
//! ├── history_table        # address -> row list head  (indexes only)
//! ├── history_rows         # payment rows              (indexes only)
//! └── stealth_rows         # stealth rows              (indexes only)
//! ```
//!
//! ## Flush lock
//!
//! `begin_write` creates the zero-byte sentinel; `end_write` removes it
//! after the stores flushed. A failure in between leaves the sentinel on
//! disk, and `open` refuses to proceed while it exists — an intentional
//! poison pill that forces explicit recovery after a torn write.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use fs2::FileExt;
use tracing::warn;

use crate::error::StoreError;

pub const BLOCK_TABLE: &str = "block_table";
pub const HEADER_INDEX: &str = "header_index";
pub const BLOCK_INDEX: &str = "block_index";
pub const TRANSACTION_INDEX: &str = "transaction_index";
pub const TRANSACTION_TABLE: &str = "transaction_table";
pub const SPEND_TABLE: &str = "spend_table";
pub const HISTORY_TABLE: &str = "history_table";
pub const HISTORY_ROWS: &str = "history_rows";
pub const STEALTH_ROWS: &str = "stealth_rows";

const EXCLUSIVE_LOCK: &str = "exclusive_lock";
const FLUSH_LOCK: &str = "flush_lock";

pub struct StoreDirectory {
    directory: PathBuf,
    lock_file: Option<File>,
}

impl StoreDirectory {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            lock_file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.directory
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn flush_lock_path(&self) -> PathBuf {
        self.directory.join(FLUSH_LOCK)
    }

    /// Creates the directory for a fresh store. Fails when it already
    /// holds files, so an existing store is never silently clobbered.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.directory)
            .wrap_err_with(|| format!("failed to create '{}'", self.directory.display()))?;
        let occupied = fs::read_dir(&self.directory)
            .wrap_err("failed to scan store directory")?
            .next()
            .is_some();
        ensure!(
            !occupied,
            "store directory '{}' is not empty",
            self.directory.display()
        );
        Ok(())
    }

    /// Takes the exclusive process lock and verifies no flush lock was
    /// left behind by a torn write.
    pub fn open(&mut self) -> Result<()> {
        let lock_path = self.directory.join(EXCLUSIVE_LOCK);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&lock_path)
            .wrap_err_with(|| format!("failed to open lockfile '{}'", lock_path.display()))?;
        lock_file.try_lock_exclusive().wrap_err_with(|| {
            format!(
                "store directory '{}' is locked by another process",
                self.directory.display()
            )
        })?;

        if self.flush_lock_path().exists() {
            warn!(
                directory = %self.directory.display(),
                "flush lock present, refusing to open"
            );
            return Err(StoreError::FlushLockPresent.into());
        }

        self.lock_file = Some(lock_file);
        Ok(())
    }

    /// Creates the flush-lock sentinel, marking a write in progress.
    pub fn begin_write(&self) -> Result<()> {
        File::create(self.flush_lock_path())
            .map(drop)
            .wrap_err("failed to create the flush lock")
    }

    /// Removes the sentinel after a completed (and flushed) write.
    pub fn end_write(&self) -> Result<()> {
        fs::remove_file(self.flush_lock_path()).wrap_err("failed to remove the flush lock")
    }

    pub fn close(&mut self) -> Result<()> {
        if let Some(lock_file) = self.lock_file.take() {
            let _ = fs2::FileExt::unlock(&lock_file);
        }
        Ok(())
    }
}
