//! Core value types: hashes, points, transactions, blocks.
//!
//! These are the opaque values the store accepts and serves. Script and
//! signature semantics are not interpreted here.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// A 32-byte hash value.
///
/// Used for transaction IDs (BLAKE3), block header hashes (double SHA-256),
/// merkle roots (BLAKE3) and public-key hashes.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. A block whose `prev_hash` is zero claims to be genesis.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse from a slice that must be exactly 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(array))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    /// Parse 64 hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Reference to a specific output of a transaction.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u64,
}

impl OutPoint {
    /// The null outpoint, used for coinbase transaction inputs.
    pub fn null() -> Self {
        Self {
            txid: Hash256::ZERO,
            index: u64::MAX,
        }
    }

    /// Check if this is the null outpoint (coinbase marker).
    pub fn is_null(&self) -> bool {
        self.txid.is_zero() && self.index == u64::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Reference to a specific input of a transaction, i.e. one spend.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct InputPoint {
    /// Transaction ID containing the spending input.
    pub txid: Hash256,
    /// Index of the input within the transaction.
    pub index: u64,
}

impl fmt::Display for InputPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent. Null outpoint for coinbase.
    pub previous_output: OutPoint,
    /// Unlocking data. Opaque to the store.
    pub signature: Vec<u8>,
    /// Public key revealed by the spender. Opaque to the store.
    pub public_key: Vec<u8>,
}

/// Ephemeral-key metadata attached to a stealth payment output.
///
/// The sender grinds `nonce` until the stealth prefix of the marker matches
/// the recipient's published prefix.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct StealthMarker {
    /// Ephemeral public key without its sign byte.
    pub ephemeral_key: Hash256,
    /// Prefix-grinding nonce.
    pub nonce: u64,
}

/// A transaction output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in base units.
    pub value: u64,
    /// Hash of the recipient's public key. This is the address key of the
    /// history index.
    pub pubkey_hash: Hash256,
    /// Present when the output is a stealth payment.
    pub stealth: Option<StealthMarker>,
}

impl TxOutput {
    /// A plain payment output.
    pub fn new(value: u64, pubkey_hash: Hash256) -> Self {
        Self {
            value,
            pubkey_hash,
            stealth: None,
        }
    }
}

/// A transaction transferring value between addresses.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u64,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height or timestamp before which this tx is invalid.
    pub lock_time: u64,
}

impl Transaction {
    /// Compute the transaction ID: BLAKE3 over a fixed little-endian layout
    /// of every field, with length prefixes for variable-size parts.
    pub fn txid(&self) -> Hash256 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.version.to_le_bytes());
        hasher.update(&(self.inputs.len() as u64).to_le_bytes());
        for input in &self.inputs {
            hasher.update(input.previous_output.txid.as_bytes());
            hasher.update(&input.previous_output.index.to_le_bytes());
            hasher.update(&(input.signature.len() as u64).to_le_bytes());
            hasher.update(&input.signature);
            hasher.update(&(input.public_key.len() as u64).to_le_bytes());
            hasher.update(&input.public_key);
        }
        hasher.update(&(self.outputs.len() as u64).to_le_bytes());
        for output in &self.outputs {
            hasher.update(&output.value.to_le_bytes());
            hasher.update(output.pubkey_hash.as_bytes());
            match &output.stealth {
                Some(marker) => {
                    hasher.update(&[1]);
                    hasher.update(marker.ephemeral_key.as_bytes());
                    hasher.update(&marker.nonce.to_le_bytes());
                }
                None => {
                    hasher.update(&[0]);
                }
            }
        }
        hasher.update(&self.lock_time.to_le_bytes());
        Hash256(hasher.finalize().into())
    }

    /// Check if this is a coinbase transaction (single input with null outpoint).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }
}

/// Block header.
///
/// Hash is computed as double SHA-256 over a fixed byte layout.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u64,
    /// Hash of the previous block header. Zero for genesis.
    pub prev_hash: Hash256,
    /// BLAKE3 merkle root of the block's transaction IDs.
    pub merkle_root: Hash256,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
    /// Difficulty target. Lower targets carry more work.
    pub difficulty_target: u64,
    /// Proof-of-work nonce.
    pub nonce: u64,
}

impl BlockHeader {
    /// Header size in bytes when serialized for hashing (4 u64 fields + 2 * 32-byte hashes).
    const HASH_SIZE: usize = 4 * 8 + 2 * 32;

    /// Compute the block header hash (double SHA-256).
    ///
    /// Layout: version || prev_hash || merkle_root || timestamp ||
    /// difficulty_target || nonce, all little-endian.
    pub fn hash(&self) -> Hash256 {
        let mut data = Vec::with_capacity(Self::HASH_SIZE);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.extend_from_slice(self.prev_hash.as_bytes());
        data.extend_from_slice(self.merkle_root.as_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        data.extend_from_slice(&self.difficulty_target.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        let first = Sha256::digest(&data);
        Hash256(Sha256::digest(first).into())
    }

    /// Work contributed by this header: `(2^64 - 1) / max(target, 1)`.
    ///
    /// A header at the maximum target contributes exactly one unit, so a
    /// chain of uniform maximum-target headers weighs its block count.
    pub fn work(&self) -> u128 {
        u64::MAX as u128 / self.difficulty_target.max(1) as u128
    }
}

/// A complete block: header plus transactions.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Ordered list of transactions.
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Content hash identifying this block.
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    /// Transaction IDs in block order.
    pub fn txids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(Transaction::txid).collect()
    }

    /// Merkle root over this block's transaction IDs.
    pub fn compute_merkle_root(&self) -> Hash256 {
        merkle_root(&self.txids())
    }
}

/// BLAKE3 merkle root with leaf/node domain separation.
///
/// Odd layers duplicate their last element. An empty list yields
/// [`Hash256::ZERO`].
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::ZERO;
    }

    let mut layer: Vec<Hash256> = leaves
        .iter()
        .map(|leaf| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(&[0x00]);
            hasher.update(leaf.as_bytes());
            Hash256(hasher.finalize().into())
        })
        .collect();

    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| {
                let left = &pair[0];
                let right = pair.get(1).unwrap_or(left);
                let mut hasher = blake3::Hasher::new();
                hasher.update(&[0x01]);
                hasher.update(left.as_bytes());
                hasher.update(right.as_bytes());
                Hash256(hasher.finalize().into())
            })
            .collect();
    }

    layer[0]
}

/// Outcome classification of a `store` call.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockStatus {
    /// The block is part of the canonical chain.
    Confirmed,
    /// The block was recorded on a non-canonical branch.
    Orphan,
    /// The block was already stored; nothing changed.
    Duplicate,
}

/// Status and height of a stored block.
///
/// For an orphan the height is the block's height within its own branch.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub status: BlockStatus,
    pub height: u64,
}

impl BlockInfo {
    /// Status code in the `(code, info)` shape of the external interface.
    pub fn code(&self) -> crate::error::ErrorCode {
        match self.status {
            BlockStatus::Duplicate => crate::error::ErrorCode::DuplicateBlock,
            BlockStatus::Confirmed | BlockStatus::Orphan => crate::error::ErrorCode::Success,
        }
    }
}

/// A peer's description of its chain for header and inventory sync.
///
/// `start_hashes` run from the peer's tip backwards; the first one found on
/// the canonical chain marks where the answer begins. A zero `stop_hash`
/// means no stop.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct BlockLocator {
    pub start_hashes: Vec<Hash256>,
    pub stop_hash: Hash256,
}

impl BlockLocator {
    pub fn new(start_hashes: Vec<Hash256>) -> Self {
        Self { start_hashes, stop_hash: Hash256::ZERO }
    }

    pub fn with_stop(mut self, stop_hash: Hash256) -> Self {
        self.stop_hash = stop_hash;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint {
                    txid: Hash256([0x11; 32]),
                    index: 0,
                },
                signature: vec![0u8; 64],
                public_key: vec![0u8; 32],
            }],
            outputs: vec![TxOutput::new(500, Hash256([0xAA; 32]))],
            lock_time: 0,
        }
    }

    fn sample_header() -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_hash: Hash256::ZERO,
            merkle_root: Hash256::ZERO,
            timestamp: 1_700_000_000,
            difficulty_target: u64::MAX,
            nonce: 0,
        }
    }

    #[test]
    fn hash256_display_hex() {
        let s = format!("{}", Hash256([0xAB; 32]));
        assert_eq!(s.len(), 64);
        assert_eq!(&s[0..2], "ab");
    }

    #[test]
    fn hash256_hex_round_trip() {
        let hash = Hash256([0x5A; 32]);
        assert_eq!(hash.to_string().parse::<Hash256>().unwrap(), hash);
        assert!("abc".parse::<Hash256>().is_err());
    }

    #[test]
    fn hash256_from_slice_checks_length() {
        assert_eq!(Hash256::from_slice(&[7u8; 32]), Some(Hash256([7; 32])));
        assert!(Hash256::from_slice(&[7u8; 31]).is_none());
    }

    #[test]
    fn outpoint_null_detection() {
        assert!(OutPoint::null().is_null());
        assert!(!OutPoint { txid: Hash256([1; 32]), index: 0 }.is_null());
    }

    #[test]
    fn coinbase_detection() {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput {
                previous_output: OutPoint::null(),
                signature: vec![],
                public_key: vec![],
            }],
            outputs: vec![],
            lock_time: 0,
        };
        assert!(coinbase.is_coinbase());
        assert!(!sample_tx().is_coinbase());
    }

    #[test]
    fn txid_deterministic_and_sensitive() {
        let tx = sample_tx();
        assert_eq!(tx.txid(), tx.txid());

        let mut other = sample_tx();
        other.lock_time = 1;
        assert_ne!(tx.txid(), other.txid());

        let mut stealthy = sample_tx();
        stealthy.outputs[0].stealth = Some(StealthMarker {
            ephemeral_key: Hash256([3; 32]),
            nonce: 0,
        });
        assert_ne!(tx.txid(), stealthy.txid());
    }

    #[test]
    fn block_header_hash_changes_with_nonce() {
        let h1 = sample_header();
        let mut h2 = h1.clone();
        h2.nonce = 1;
        assert_ne!(h1.hash(), h2.hash());
        assert!(!h1.hash().is_zero());
    }

    #[test]
    fn work_is_one_at_max_target() {
        assert_eq!(sample_header().work(), 1);
        let mut harder = sample_header();
        harder.difficulty_target = u64::MAX / 4;
        assert_eq!(harder.work(), 4);
        harder.difficulty_target = 0;
        assert_eq!(harder.work(), u64::MAX as u128);
    }

    #[test]
    fn merkle_root_properties() {
        assert_eq!(merkle_root(&[]), Hash256::ZERO);
        let a = Hash256([1; 32]);
        let b = Hash256([2; 32]);
        assert_ne!(merkle_root(&[a]), a);
        assert_ne!(merkle_root(&[a, b]), merkle_root(&[b, a]));
        // Odd layer duplicates the last leaf.
        assert_eq!(merkle_root(&[a, b, b]), merkle_root(&[a, b, b, b]));
    }

    #[test]
    fn block_info_codes() {
        let dup = BlockInfo { status: BlockStatus::Duplicate, height: 3 };
        let ok = BlockInfo { status: BlockStatus::Orphan, height: 3 };
        assert_eq!(dup.code(), crate::error::ErrorCode::DuplicateBlock);
        assert_eq!(ok.code(), crate::error::ErrorCode::Success);
    }

    #[test]
    fn bincode_round_trip_block() {
        let block = Block {
            header: sample_header(),
            transactions: vec![sample_tx()],
        };
        let encoded = bincode::encode_to_vec(&block, bincode::config::standard()).unwrap();
        let (decoded, _): (Block, usize) =
            bincode::decode_from_slice(&encoded, bincode::config::standard()).unwrap();
        assert_eq!(block, decoded);
    }
}
