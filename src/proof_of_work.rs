use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{utils, NodeError, Result, BASE_DIFFICULTY, PEERS_PER_DIFFICULTY_STEP};

/// Proof-of-work search over the previous block's nonce
///
/// The proof for a new block is the smallest non-negative integer `p` such
/// that the hex SHA-256 of the previous proof and `p`, concatenated as ASCII
/// decimal with no separator, begins with `difficulty` zero characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofOfWork {
    /// Number of leading zeros required
    pub difficulty: u32,
}

impl ProofOfWork {
    /// Create a proof-of-work instance
    ///
    /// # Arguments
    /// * `difficulty` - Number of leading zeros required
    ///
    /// # Returns
    /// * `Result<ProofOfWork>` - The instance, or an error for an absurd difficulty
    ///
    /// # Example
    /// ```
    /// use ghostmesh::proof_of_work::ProofOfWork;
    ///
    /// let pow = ProofOfWork::new(4).unwrap();
    /// assert_eq!(pow.difficulty, 4);
    /// ```
    pub fn new(difficulty: u32) -> Result<Self> {
        if difficulty > 32 {
            return Err(NodeError::InvalidInput(format!(
                "difficulty {} requires more leading zeros than a hash can hold",
                difficulty
            )));
        }
        Ok(ProofOfWork { difficulty })
    }

    /// Instance at the network's current difficulty for a given peer count
    ///
    /// Difficulty grows by one for every five active peers, starting from the
    /// base of four.
    pub fn for_active_peers(active_peers: u64) -> Self {
        ProofOfWork {
            difficulty: difficulty_for(active_peers),
        }
    }

    /// Search for the proof of the next block
    ///
    /// CPU-bound; run on a blocking task. The search is a pure function of
    /// `(previous_proof, difficulty)`, so every node finds the same proof.
    ///
    /// # Arguments
    /// * `previous_proof` - Nonce of the current chain tip
    ///
    /// # Returns
    /// * `u64` - The smallest valid nonce
    pub fn mine(&self, previous_proof: u64) -> u64 {
        info!("Starting proof search at difficulty {}", self.difficulty);
        let started = std::time::Instant::now();

        let mut proof = 0u64;
        while !self.validate(previous_proof, proof) {
            proof += 1;
            if proof % 100_000 == 0 {
                debug!("Proof search at attempt {}", proof);
            }
        }

        info!(
            "Proof found: {} after {:?} at difficulty {}",
            proof,
            started.elapsed(),
            self.difficulty
        );
        proof
    }

    /// Check a candidate proof against the previous block's nonce
    pub fn validate(&self, previous_proof: u64, proof: u64) -> bool {
        let guess = format!("{}{}", previous_proof, proof);
        utils::hash_meets_difficulty(&utils::calculate_hash(guess), self.difficulty)
    }

    /// The leading-zero pattern a valid hash must start with
    pub fn target(&self) -> String {
        "0".repeat(self.difficulty as usize)
    }
}

/// Network difficulty for a given active peer count
pub fn difficulty_for(active_peers: u64) -> u32 {
    BASE_DIFFICULTY + (active_peers / PEERS_PER_DIFFICULTY_STEP) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pow_creation() {
        let pow = ProofOfWork::new(4).unwrap();
        assert_eq!(pow.difficulty, 4);
        assert_eq!(pow.target(), "0000");
    }

    #[test]
    fn test_invalid_difficulty() {
        assert!(ProofOfWork::new(33).is_err());
    }

    #[test]
    fn test_mining_low_difficulty() {
        let pow = ProofOfWork::new(1).unwrap();
        let proof = pow.mine(1);
        assert!(pow.validate(1, proof));
        // Smallest valid nonce: everything below fails
        for p in 0..proof {
            assert!(!pow.validate(1, p));
        }
    }

    #[test]
    fn test_mining_is_deterministic() {
        let pow = ProofOfWork::new(2).unwrap();
        assert_eq!(pow.mine(7), pow.mine(7));
        assert_eq!(pow.mine(42), pow.mine(42));
    }

    #[test]
    fn test_difficulty_schedule() {
        assert_eq!(difficulty_for(0), 4);
        assert_eq!(difficulty_for(4), 4);
        assert_eq!(difficulty_for(5), 5);
        assert_eq!(difficulty_for(9), 5);
        assert_eq!(difficulty_for(10), 6);
    }

    #[test]
    fn test_zero_difficulty_accepts_everything() {
        let pow = ProofOfWork::new(0).unwrap();
        assert!(pow.validate(1, 0));
        assert_eq!(pow.mine(1), 0);
    }
}
