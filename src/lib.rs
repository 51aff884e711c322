//! # chaindb - Blockchain Storage Engine
//!
//! Memory-mapped persistent storage for a blockchain full node: block
//! headers, confirmed and unconfirmed transactions, and the derived spend,
//! history, and stealth indexes. Reads are zero-copy against the mapped
//! files and proceed concurrently; writes are serialized by a single
//! orchestrator and survive crashes through a flush-lock sentinel.
//!
//! ## Quick Start
//!
//! ```ignore
//! use chaindb::{Database, Settings};
//!
//! let settings = Settings::with_directory("./chain");
//! let db = Database::create(settings, &genesis_block)?;
//!
//! db.push_block(&block, 1)?;
//! let result = db.transactions().get(&tx_hash)?.unwrap();
//! let tx = result.transaction()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Write Orchestrator (Database)         │
//! ├──────────────────────────────────────────────┤
//! │  Block │ Transaction │ Spend/History/Stealth │
//! ├──────────────────────────────────────────────┤
//! │   Hash Tables / Multimap (bucket chains)     │
//! ├──────────────────────────────────────────────┤
//! │   Record / Slab Arenas (bump allocation)     │
//! ├──────────────────────────────────────────────┤
//! │   Memory-Mapped Files (growth + remap lock)  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Records and slabs are created once and never physically deleted;
//! offsets handed out by the tables stay valid for the life of the store.
//! A database-wide remap lock lets readers pin the mappings while files
//! grow 1.5x under the exclusive side.
//!
//! ## Module Overview
//!
//! - [`storage`]: mapped files, arenas, hash tables, multimap
//! - [`store`]: block, transaction, spend, history, and stealth stores
//! - [`database`]: write orchestration, flush lock, reorganization
//! - [`chain`]: minimal block/transaction model and identifiers
//! - [`encoding`]: little-endian cursors and varints

pub mod chain;
pub mod database;
pub mod encoding;
pub mod error;
pub mod storage;
pub mod store;

pub use database::{Database, Settings};
pub use error::{store_error, StoreError};
