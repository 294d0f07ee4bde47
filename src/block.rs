use log::debug;
use serde::{Deserialize, Serialize};

use crate::{utils, SYSTEM_SENDER};

/// Proof value recorded on the genesis block
pub const GENESIS_PROOF: u64 = 1;

/// Previous-hash sentinel recorded on the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Represents a block in the chain
///
/// A block links to its predecessor through `previous_hash` and carries the
/// proof-of-work nonce found against the predecessor's proof. Blocks are
/// immutable once committed; transactions reference them by index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    /// Position in the chain, starting at 1 for genesis
    pub block_index: u64,
    /// Creation time in seconds since the Unix epoch
    pub timestamp: f64,
    /// Proof-of-work nonce
    pub proof: u64,
    /// Hash of the previous block
    pub previous_hash: String,
    /// Hash of this block
    pub block_hash: String,
    /// Wallet identifier of the miner
    pub miner: String,
}

/// Compact block reference exchanged during chain catch-up
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockHeader {
    pub block_index: u64,
    pub block_hash: String,
}

impl Block {
    /// Create the genesis block (index 1)
    ///
    /// The timestamp is pinned to zero so every node derives the same genesis
    /// hash and header lists stay comparable across the network.
    pub fn genesis() -> Self {
        let hash = Self::canonical_hash(1, 0.0, GENESIS_PREVIOUS_HASH, GENESIS_PROOF, SYSTEM_SENDER);
        Block {
            block_index: 1,
            timestamp: 0.0,
            proof: GENESIS_PROOF,
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            block_hash: hash,
            miner: SYSTEM_SENDER.to_string(),
        }
    }

    /// Build the successor of `previous` from a freshly found proof
    ///
    /// # Arguments
    /// * `previous` - The current chain tip
    /// * `proof` - Nonce found against `previous.proof`
    /// * `miner` - Wallet identifier of the miner
    /// * `timestamp` - Block creation time
    pub fn next(previous: &Block, proof: u64, miner: &str, timestamp: f64) -> Self {
        let index = previous.block_index + 1;
        let hash = Self::canonical_hash(index, timestamp, &previous.block_hash, proof, miner);
        debug!("Built candidate block #{} mined by {}", index, miner);
        Block {
            block_index: index,
            timestamp,
            proof,
            previous_hash: previous.block_hash.clone(),
            block_hash: hash,
            miner: miner.to_string(),
        }
    }

    /// Hash of the canonical JSON encoding of the block fields
    ///
    /// Keys are serialized in sorted order, so the digest is a pure function
    /// of `(index, timestamp, previous_hash, proof, miner)`.
    pub fn canonical_hash(
        index: u64,
        timestamp: f64,
        previous_hash: &str,
        proof: u64,
        miner: &str,
    ) -> String {
        let encoding = serde_json::json!({
            "index": index,
            "timestamp": timestamp,
            "previous_hash": previous_hash,
            "proof": proof,
            "miner": miner,
        });
        utils::calculate_hash(encoding.to_string())
    }

    /// Recompute this block's hash from its own fields
    pub fn recompute_hash(&self) -> String {
        Self::canonical_hash(
            self.block_index,
            self.timestamp,
            &self.previous_hash,
            self.proof,
            &self.miner,
        )
    }

    /// True for the first block in the chain
    pub fn is_genesis(&self) -> bool {
        self.block_index == 1 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Compact header form of this block
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            block_index: self.block_index,
            block_hash: self.block_hash.clone(),
        }
    }

    /// First characters of the hash, for display
    pub fn short_hash(&self) -> &str {
        &self.block_hash[..self.block_hash.len().min(16)]
    }
}

impl std::fmt::Display for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Block #{} ({}): miner {}, hash {}",
            self.block_index,
            utils::format_timestamp(self.timestamp),
            self.miner,
            self.short_hash()
        )
    }
}
