//! # Chain Stores
//!
//! The databases assembled from the storage substrate:
//!
//! - `block_store`: headers, block associations, height indexes
//! - `transaction_store`: transactions with mutable confirmation metadata
//!   and the unspent-output cache
//! - `spend_store`: output point -> spending input point
//! - `history_store`: address hash -> payment rows (multimap)
//! - `stealth_store`: unindexed stealth rows, prefix-filtered scans
//!
//! Each store owns its file(s); a shared remap mutex coordinates growth
//! across all of them. `commit()` writes arena counters back to their
//! header cells; `flush()` forces dirty pages to disk. The orchestrator
//! brackets every mutation between the two.

pub mod block_store;
pub mod history_store;
pub mod spend_store;
pub mod stealth_store;
pub mod transaction_result;
pub mod transaction_store;
pub mod utxo_cache;

pub use block_store::{BlockResult, BlockStore, IndexKind};
pub use history_store::{HistoryStats, HistoryStore, PaymentRecord, PointKind};
pub use spend_store::SpendStore;
pub use stealth_store::{StealthFilter, StealthRecord, StealthStats, StealthStore};
pub use transaction_result::{OutputRecord, TransactionResult};
pub use transaction_store::{
    PrevoutInfo, TransactionStore, TxState, NOT_SPENT, UNCONFIRMED_POSITION, UNVERIFIED_HEIGHT,
};
pub use utxo_cache::{CachedOutput, UtxoCache};
