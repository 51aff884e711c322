//! # Storage Substrate
//!
//! Memory-mapped arenas and the hash-indexed containers built on them.
//! Every indexed store in the database is assembled from the same five
//! pieces:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ RecordTable / SlabTable     (bucket chains)  │
//! ├──────────────────────────────────────────────┤
//! │ HashHeader                  (bucket array)   │
//! ├──────────────────────────────────────────────┤
//! │ RecordManager / SlabManager (bump arenas)    │
//! ├──────────────────────────────────────────────┤
//! │ MappedFile                  (mmap + growth)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## File layout
//!
//! Each file carries an optional hash-table header at offset 0 (bucket
//! count plus a fixed bucket array), then the arena's counter cell, then
//! the arena itself. All integers are little-endian; a 64-bit host is
//! assumed.
//!
//! ## Remap coordination
//!
//! Growth never invalidates a reader's view: all files of one database
//! share a single `RemapMutex`. Readers pin the mapping by holding the
//! shared side for the duration of one operation (or the life of one
//! deferred result); `reserve`/`resize` take the exclusive side. Pins are
//! recursive, so nested reads on one thread never deadlock behind a queued
//! writer — but no thread may allocate while it holds a pin.
//!
//! ## Sentinels
//!
//! Record tables use 32-bit cells with `0xFFFF_FFFF` as "empty"; slab
//! tables use 64-bit cells with `0` (slab offsets are absolute file
//! offsets, and offset 0 always lands inside a header, so no slab can
//! ever legitimately be at 0).

mod hash_header;
mod mmfile;
mod multimap;
mod record_manager;
mod record_table;
mod slab_manager;
mod slab_table;

pub use hash_header::{BucketCell, HashHeader};
pub use mmfile::{new_remap_mutex, MapPin, MappedFile, RemapMutex};
pub use multimap::{RecordMultimap, RowWalker};
pub use record_manager::RecordManager;
pub use record_table::RecordTable;
pub use slab_manager::SlabManager;
pub use slab_table::SlabTable;

use crate::chain::fold_bytes;

/// Element index into a record arena.
pub type ArrayIndex = u32;

/// Byte offset into a mapped file.
pub type FileOffset = u64;

/// Empty sentinel for record-table cells and `next` links.
pub const EMPTY_RECORD: ArrayIndex = ArrayIndex::MAX;

/// Empty sentinel for slab-table cells and `next` links.
pub const EMPTY_SLAB: FileOffset = 0;

/// Width of a record-arena counter cell.
pub const COUNT_SIZE: u64 = 4;

/// Width of a slab-arena size cell.
pub const SIZE_SIZE: u64 = 8;

/// A fixed-width key stored inline in table rows.
///
/// Keys are expected to already be uniformly distributed (chain hashes and
/// address hashes), so the bucket fold is a plain byte xor.
pub trait TableKey {
    const SIZE: usize;

    /// Writes the key's on-disk form into `dst` (`dst.len() == SIZE`).
    fn copy_to(&self, dst: &mut [u8]);

    /// Compares against a raw on-disk key of `SIZE` bytes.
    fn matches(&self, raw: &[u8]) -> bool;

    /// Folds the key for bucket selection.
    fn fold(&self) -> u64;
}

impl TableKey for [u8; 32] {
    const SIZE: usize = 32;

    fn copy_to(&self, dst: &mut [u8]) {
        dst.copy_from_slice(self);
    }

    fn matches(&self, raw: &[u8]) -> bool {
        self[..] == raw[..]
    }

    fn fold(&self) -> u64 {
        fold_bytes(self)
    }
}

impl TableKey for [u8; 20] {
    const SIZE: usize = 20;

    fn copy_to(&self, dst: &mut [u8]) {
        dst.copy_from_slice(self);
    }

    fn matches(&self, raw: &[u8]) -> bool {
        self[..] == raw[..]
    }

    fn fold(&self) -> u64 {
        fold_bytes(self)
    }
}

impl TableKey for crate::chain::OutPoint {
    const SIZE: usize = 36;

    fn copy_to(&self, dst: &mut [u8]) {
        dst[..32].copy_from_slice(&self.hash);
        dst[32..36].copy_from_slice(&self.index.to_le_bytes());
    }

    fn matches(&self, raw: &[u8]) -> bool {
        raw[..32] == self.hash[..]
            && raw[32..36] == self.index.to_le_bytes()[..]
    }

    fn fold(&self) -> u64 {
        fold_bytes(&self.hash) ^ self.index as u64
    }
}
