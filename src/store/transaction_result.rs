//! # Transaction Result
//!
//! Deferred reader over a stored transaction slab. The result owns a
//! mapping pin, so the slab bytes stay valid (and the file cannot remap)
//! for as long as the result lives — keep results short-lived and never
//! park one in long-term storage, or growth stalls behind it.
//!
//! The `(height, position, state)` snapshot is taken atomically at
//! construction; body decoding is lazy. Per-output spender heights are
//! read through the 32-bit atomic helper but are only guaranteed
//! consistent inside the serialized validation sequence — a reader racing
//! a spend may see the old or the new height.

use eyre::Result;

use crate::chain::{Hash, Input, OutPoint, Output, Transaction};
use crate::storage::{FileOffset, MapPin};
use crate::store::transaction_store::{
    expand_index, locate_output, read_varint_at, TxState, METADATA_SIZE, NOT_SPENT,
};

/// One decoded output plus its spend metadata.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub output: Output,
    pub spender_height: u32,
    pub index_spend: bool,
}

pub struct TransactionResult {
    pin: MapPin,
    offset: FileOffset,
    hash: Hash,
    height: u32,
    position: u16,
    state: TxState,
}

impl TransactionResult {
    pub(crate) fn new(
        pin: MapPin,
        offset: FileOffset,
        hash: Hash,
        height: u32,
        position: u16,
        state: TxState,
    ) -> Self {
        Self {
            pin,
            offset,
            hash,
            height,
            position,
            state,
        }
    }

    pub fn offset(&self) -> FileOffset {
        self.offset
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    /// Overloaded: block height when confirmed, fork context otherwise,
    /// error code when invalid.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Block position when confirmed, the `0xFFFF` sentinel otherwise.
    pub fn position(&self) -> u16 {
        self.position
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    /// The stored error code of an invalid transaction.
    pub fn error_code(&self) -> Option<u32> {
        (self.state == TxState::Invalid).then_some(self.height)
    }

    /// Decodes the `index`-th output, skipping the ones before it.
    pub fn output(&self, index: u32) -> Result<Option<OutputRecord>> {
        let Some(field) = locate_output(&self.pin, self.offset, index)? else {
            return Ok(None);
        };
        let index_spend = self.pin.read_u8(field)? != 0;
        let spender_height = self.pin.load_u32_atomic(field + 1)?;
        let value = self.pin.read_u64(field + 5)?;
        let (script_len, consumed) = read_varint_at(&self.pin, field + 13)?;
        let script = self
            .pin
            .bytes(field + 13 + consumed, script_len as usize)?
            .to_vec();
        Ok(Some(OutputRecord {
            output: Output { value, script },
            spender_height,
            index_spend,
        }))
    }

    /// True iff every output is spent relative to `fork_height`, applying
    /// the confirmed/indexed rule: the indexed state is trusted only when
    /// the check is bounded to a specific fork height. An unconfirmed
    /// transaction is never spent.
    pub fn is_spent(&self, fork_height: u32) -> Result<bool> {
        let allow_indexed = fork_height != u32::MAX;
        let confirmed = (self.state == TxState::Indexed && allow_indexed)
            || (self.state == TxState::Confirmed && self.height <= fork_height);
        if !confirmed {
            return Ok(false);
        }

        let mut cursor = self.offset + METADATA_SIZE;
        let (output_count, consumed) = read_varint_at(&self.pin, cursor)?;
        cursor += consumed;
        for _ in 0..output_count {
            let spender_height = self.pin.load_u32_atomic(cursor + 1)?;
            if spender_height == NOT_SPENT || spender_height > fork_height {
                return Ok(false);
            }
            let (script_len, consumed) = read_varint_at(&self.pin, cursor + 13)?;
            cursor += 13 + consumed + script_len;
        }
        Ok(true)
    }

    /// Decodes the full transaction.
    pub fn transaction(&self) -> Result<Transaction> {
        let pin = &self.pin;
        let mut cursor = self.offset + METADATA_SIZE;

        let (output_count, consumed) = read_varint_at(pin, cursor)?;
        cursor += consumed;
        let mut outputs = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            cursor += 1 + 4;
            let value = pin.read_u64(cursor)?;
            cursor += 8;
            let (script_len, consumed) = read_varint_at(pin, cursor)?;
            cursor += consumed;
            let script = pin.bytes(cursor, script_len as usize)?.to_vec();
            cursor += script_len;
            outputs.push(Output { value, script });
        }

        let (input_count, consumed) = read_varint_at(pin, cursor)?;
        cursor += consumed;
        let mut inputs = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let hash: Hash = pin.bytes(cursor, 32)?.try_into().expect("32 bytes");
            cursor += 32;
            let index = expand_index(pin.read_u16(cursor)?);
            cursor += 2;
            let (script_len, consumed) = read_varint_at(pin, cursor)?;
            cursor += consumed;
            let script = pin.bytes(cursor, script_len as usize)?.to_vec();
            cursor += script_len;
            let sequence = pin.read_u32(cursor)?;
            cursor += 4;
            inputs.push(Input {
                previous_output: OutPoint::new(hash, index),
                script,
                sequence,
            });
        }

        let (locktime, consumed) = read_varint_at(pin, cursor)?;
        cursor += consumed;
        let (version, _) = read_varint_at(pin, cursor)?;

        Ok(Transaction {
            version: version as u32,
            locktime: locktime as u32,
            inputs,
            outputs,
        })
    }
}
