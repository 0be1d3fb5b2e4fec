use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::proof::{MiningOptions, ProofError, ProofOfWork};
use super::transaction::Transaction;

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Hash of this block, found by proof of work
    pub hash: Vec<u8>,

    /// List of transactions included in this block
    pub transactions: Vec<Transaction>,

    /// Hash of the previous block, empty for genesis
    pub prev_hash: Vec<u8>,

    /// Nonce solving the proof of work
    pub nonce: u64,
}

impl Block {
    /// Creates and mines a new block
    ///
    /// # Arguments
    ///
    /// * `transactions` - The list of transactions to include in the block
    /// * `prev_hash` - The hash of the previous block
    /// * `options` - How the proof-of-work search is spread over threads
    ///
    /// # Returns
    ///
    /// A block whose hash and nonce satisfy the proof of work
    pub fn create(
        transactions: Vec<Transaction>,
        prev_hash: Vec<u8>,
        options: &MiningOptions,
    ) -> Result<Self, ProofError> {
        let mut block = Block {
            hash: Vec::new(),
            transactions,
            prev_hash,
            nonce: 0,
        };

        let (nonce, hash) = ProofOfWork::new(&block).run(options)?;
        block.hash = hash;
        block.nonce = nonce;

        Ok(block)
    }

    /// Creates the first block of a chain holding a single coinbase transaction
    pub fn genesis(coinbase: Transaction, options: &MiningOptions) -> Result<Self, ProofError> {
        Self::create(vec![coinbase], Vec::new(), options)
    }

    /// Hashes the identifiers of all transactions in order
    pub fn hash_transactions(&self) -> Vec<u8> {
        let mut hasher = Sha256::new();
        for tx in &self.transactions {
            hasher.update(&tx.id);
        }
        hasher.finalize().to_vec()
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_empty()
    }

    /// Checks the stored nonce against the proof-of-work target
    pub fn validate_proof(&self) -> bool {
        ProofOfWork::new(self).validate(self.nonce)
    }

    /// Checks the proof and that the stored hash is the one the nonce produces
    pub fn is_valid(&self) -> bool {
        let pow = ProofOfWork::new(self);
        pow.validate(self.nonce) && pow.hash_with_nonce(self.nonce).as_slice() == self.hash.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
