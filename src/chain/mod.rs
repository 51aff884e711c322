//! # Chain Domain Model
//!
//! Minimal block, header, and transaction types as the storage layer sees
//! them. Consensus evaluation, script execution, and network forms live in
//! external collaborators; this module carries just enough structure to key
//! the indexes and round-trip the stored bytes.
//!
//! ## Identifiers
//!
//! Block and transaction identifiers are double-SHA-256 of the wire form.
//! Headers serialize to a fixed 80 bytes; transactions use little-endian
//! integers with varint counts and script lengths.
//!
//! ## Address extraction
//!
//! The history and stealth indexes need a 20-byte address hash per input or
//! output. Extraction here recognizes the common pay-to-public-key-hash
//! script shape on outputs and a trailing compressed-key push on inputs;
//! richer derivation belongs to the wallet layer and only has to agree on
//! the 20-byte key it feeds the index.

use sha2::{Digest, Sha256};

use crate::encoding::{ByteReader, ByteWriter};
use eyre::Result;

/// 32-byte identifier (block hash, transaction hash, ephemeral key).
pub type Hash = [u8; 32];

/// 20-byte address hash.
pub type ShortHash = [u8; 20];

pub const NULL_HASH: Hash = [0u8; 32];

/// Serialized header width.
pub const HEADER_SIZE: usize = 80;

/// Double-SHA-256, the chain's identifier function.
pub fn sha256d(bytes: &[u8]) -> Hash {
    let first = Sha256::digest(bytes);
    let second = Sha256::digest(first);
    second.into()
}

/// Folds a byte string into a u64 by xor of little-endian 8-byte chunks.
/// Suitable for keys that are already uniformly distributed hashes.
pub fn fold_bytes(bytes: &[u8]) -> u64 {
    let mut folded = 0u64;
    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        folded ^= u64::from_le_bytes(chunk.try_into().expect("chunk is 8 bytes"));
    }
    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut last = [0u8; 8];
        last[..tail.len()].copy_from_slice(tail);
        folded ^= u64::from_le_bytes(last);
    }
    folded
}

/// A reference to a transaction output: `(tx hash, output index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub const NULL_INDEX: u32 = u32::MAX;

    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The coinbase previous-output marker: null hash, max index.
    pub fn null() -> Self {
        Self {
            hash: NULL_HASH,
            index: Self::NULL_INDEX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.index == Self::NULL_INDEX && self.hash == NULL_HASH
    }

    /// A 64-bit digest of the point, stored in history input rows so a
    /// caller can match a spend row to its prevout without a second lookup.
    pub fn checksum(&self) -> u64 {
        fold_bytes(&self.hash) ^ ((self.index as u64) << 32 | self.index as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub previous_output: OutPoint,
    pub script: Vec<u8>,
    pub sequence: u32,
}

impl Input {
    /// Address hash from a signature script whose final push is a 33-byte
    /// compressed public key. Returns the leading 20 bytes of the key's
    /// double-SHA-256.
    pub fn address_hash(&self) -> Option<ShortHash> {
        let script = &self.script;
        if script.len() < 34 {
            return None;
        }
        let push_at = script.len() - 34;
        if script[push_at] != 33 {
            return None;
        }
        let digest = sha256d(&script[push_at + 1..]);
        let mut short = [0u8; 20];
        short.copy_from_slice(&digest[..20]);
        Some(short)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub value: u64,
    pub script: Vec<u8>,
}

impl Output {
    /// Address hash from the canonical pay-to-public-key-hash shape:
    /// `DUP HASH160 <20 bytes> EQUALVERIFY CHECKSIG`.
    pub fn address_hash(&self) -> Option<ShortHash> {
        let script = &self.script;
        if script.len() == 25
            && script[0] == 0x76
            && script[1] == 0xa9
            && script[2] == 0x14
            && script[23] == 0x88
            && script[24] == 0xac
        {
            let mut short = [0u8; 20];
            short.copy_from_slice(&script[3..23]);
            return Some(short);
        }
        None
    }

    /// For a null-data output carrying stealth metadata, extracts the
    /// unsigned ephemeral key and the 32-bit prefix.
    pub fn stealth_metadata(&self) -> Option<(Hash, u32)> {
        let script = &self.script;
        if script.len() < 38 || script[0] != 0x6a {
            return None;
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&script[2..34]);
        let prefix = u32::from_le_bytes(script[34..38].try_into().expect("slice is 4 bytes"));
        Some((key, prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub locktime: u32,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl Transaction {
    /// A coinbase has exactly one input whose previous output is null.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn hash(&self) -> Hash {
        sha256d(&self.to_wire())
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(64 + 64 * self.inputs.len());
        writer.write_u32(self.version);
        writer.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            writer.write_bytes(&input.previous_output.hash);
            writer.write_u32(input.previous_output.index);
            writer.write_var_bytes(&input.script);
            writer.write_u32(input.sequence);
        }
        writer.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            writer.write_u64(output.value);
            writer.write_var_bytes(&output.script);
        }
        writer.write_u32(self.locktime);
        writer.into_bytes()
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let version = reader.read_u32()?;
        let input_count = reader.read_varint()? as usize;
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            let hash = reader.read_hash()?;
            let index = reader.read_u32()?;
            let script = reader.read_var_bytes()?.to_vec();
            let sequence = reader.read_u32()?;
            inputs.push(Input {
                previous_output: OutPoint::new(hash, index),
                script,
                sequence,
            });
        }
        let output_count = reader.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            let value = reader.read_u64()?;
            let script = reader.read_var_bytes()?.to_vec();
            outputs.push(Output { value, script });
        }
        let locktime = reader.read_u32()?;
        Ok(Self {
            version,
            locktime,
            inputs,
            outputs,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub previous_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl Header {
    pub fn hash(&self) -> Hash {
        sha256d(&self.to_wire())
    }

    pub fn to_wire(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..36].copy_from_slice(&self.previous_block_hash);
        bytes[36..68].copy_from_slice(&self.merkle_root);
        bytes[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        bytes[72..76].copy_from_slice(&self.bits.to_le_bytes());
        bytes[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        bytes
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        let mut reader = ByteReader::new(bytes);
        let version = reader.read_u32()?;
        let previous_block_hash = reader.read_hash()?;
        let merkle_root = reader.read_hash()?;
        let timestamp = reader.read_u32()?;
        let bits = reader.read_u32()?;
        let nonce = reader.read_u32()?;
        Ok(Self {
            version,
            previous_block_hash,
            merkle_root,
            timestamp,
            bits,
            nonce,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }
}

/// A `(hash, height)` pair naming a point on the stored chain, used as the
/// divergence point of a reorganization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub hash: Hash,
    pub height: u64,
}

impl Checkpoint {
    pub fn new(hash: Hash, height: u64) -> Self {
        Self { hash, height }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_transaction() -> Transaction {
        Transaction {
            version: 1,
            locktime: 0,
            inputs: vec![Input {
                previous_output: OutPoint::new([7u8; 32], 3),
                script: vec![0xab; 40],
                sequence: u32::MAX,
            }],
            outputs: vec![
                Output {
                    value: 5_000_000_000,
                    script: vec![0x51],
                },
                Output {
                    value: 12,
                    script: vec![],
                },
            ],
        }
    }

    #[test]
    fn transaction_wire_round_trip() {
        let tx = sample_transaction();
        let decoded = Transaction::from_wire(&tx.to_wire()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.hash(), tx.hash());
    }

    #[test]
    fn header_wire_round_trip() {
        let header = Header {
            version: 2,
            previous_block_hash: [9u8; 32],
            merkle_root: [4u8; 32],
            timestamp: 1_500_000_000,
            bits: 0x1d00ffff,
            nonce: 42,
        };
        let decoded = Header::from_wire(&header.to_wire()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_transaction();
        assert!(!tx.is_coinbase());
        tx.inputs = vec![Input {
            previous_output: OutPoint::null(),
            script: vec![],
            sequence: u32::MAX,
        }];
        assert!(tx.is_coinbase());
    }

    #[test]
    fn p2pkh_output_address_extracted() {
        let mut script = vec![0x76, 0xa9, 0x14];
        script.extend_from_slice(&[0x11; 20]);
        script.extend_from_slice(&[0x88, 0xac]);
        let output = Output {
            value: 1,
            script,
        };
        assert_eq!(output.address_hash(), Some([0x11; 20]));

        let bare = Output {
            value: 1,
            script: vec![0x51],
        };
        assert_eq!(bare.address_hash(), None);
    }

    #[test]
    fn null_point_never_matches_real_point() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint::new([1u8; 32], 0).is_null());
        assert!(!OutPoint::new(NULL_HASH, 0).is_null());
    }

    #[test]
    fn fold_covers_partial_tail() {
        assert_eq!(fold_bytes(&[]), 0);
        assert_ne!(fold_bytes(&[1, 2, 3]), 0);
        assert_ne!(fold_bytes(&[0xFF; 8]), fold_bytes(&[0xFE; 8]));
        // An even number of identical chunks cancels; the tail must not.
        assert_ne!(fold_bytes(&[0xFF; 17]), fold_bytes(&[0xFF; 16]));
    }
}
