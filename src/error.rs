//! # Store Error Kinds
//!
//! Typed failure kinds surfaced by the write orchestrator and the stores.
//! Everything else in the crate reports through `eyre::Result` with context;
//! the kinds below are the ones callers need to distinguish programmatically
//! (duplicate push, corrupt store, flush-lock recovery). They are attached to
//! the `eyre::Report` and recoverable with `Report::downcast_ref`.
//!
//! Propagation rules:
//! - `NotFound` conditions are not errors on read paths; those APIs return
//!   `Option` instead.
//! - Any other kind raised after `begin_write` aborts the orchestrator call
//!   without `end_write`, leaving the flush-lock sentinel in place so the
//!   next open refuses until the operator intervenes.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Push height is not exactly one past the current top.
    #[error("block height is not the next expected height")]
    BlockInvalidHeight,

    /// Parent hash of the pushed header does not match the stored top.
    #[error("block parent hash does not match the stored chain")]
    BlockMissingParent,

    /// Blocks must carry at least a coinbase transaction.
    #[error("block has no transactions")]
    EmptyBlock,

    /// A transaction with the same hash exists and is not fully spent.
    #[error("an unspent transaction with the same hash already exists")]
    UnspentDuplicate,

    /// A bucket head, chain link, or counter is inconsistent with the arena.
    /// Non-recoverable; the flush-lock sentinel is left in place.
    #[error("store is corrupted")]
    CorruptStore,

    /// `spend` found a missing, unconfirmed, or later previous transaction.
    #[error("spend references a missing, unconfirmed, or later transaction")]
    StateViolation,

    /// The flush-lock sentinel exists; a prior write sequence did not finish.
    #[error("flush lock present, store requires recovery")]
    FlushLockPresent,

    /// Catch-all for a mutation that failed mid-sequence.
    #[error("storage operation failed")]
    OperationFailed,
}

/// Extracts the typed kind from an `eyre` report, if one was attached.
pub fn store_error(report: &eyre::Report) -> Option<StoreError> {
    report.downcast_ref::<StoreError>().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_context_wrapping() {
        let report = eyre::Report::new(StoreError::UnspentDuplicate)
            .wrap_err("pushing transaction");
        assert_eq!(store_error(&report), Some(StoreError::UnspentDuplicate));
    }

    #[test]
    fn unrelated_report_has_no_kind() {
        let report = eyre::eyre!("plain failure");
        assert_eq!(store_error(&report), None);
    }
}
