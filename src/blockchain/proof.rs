use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use crossbeam_channel::Sender;
use log::{debug, info};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::block::Block;

/// Number of leading zero bits a block hash must have
pub const DIFFICULTY: u32 = 12;

/// Nonces handed to a worker per claim
pub const DEFAULT_CHUNK_SIZE: u64 = 3000;

/// Digests computed between two checks of the shared best nonce
pub const CANCEL_CHECK_INTERVAL: u64 = 64;

/// Largest nonce searched (the 63-bit signed range)
pub const MAX_NONCE: u64 = i64::MAX as u64;

const NO_SOLUTION: u64 = u64::MAX;

/// Errors that can occur while searching for a proof
#[derive(Debug, Error)]
pub enum ProofError {
    #[error("Nonce space exhausted without meeting the target")]
    MiningExhausted,
}

/// How a proof-of-work search is spread over threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MiningOptions {
    /// Number of worker threads
    pub workers: usize,

    /// Nonces per chunk claimed by a worker
    pub chunk_size: u64,
}

impl Default for MiningOptions {
    fn default() -> Self {
        MiningOptions {
            workers: default_workers(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Worker count used when none is configured
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Computes `2^(256 - difficulty)` as a big-endian 256-bit integer
pub fn target(difficulty: u32) -> [u8; 32] {
    let mut target = [0u8; 32];
    let bit = 256 - difficulty.clamp(1, 255) as usize;
    target[31 - bit / 8] = 1 << (bit % 8);
    target
}

/// The puzzle for one block: its previous hash and transaction hash
#[derive(Debug, Clone)]
pub struct ProofOfWork {
    prev_hash: Vec<u8>,
    tx_hash: Vec<u8>,
    target: [u8; 32],
}

impl ProofOfWork {
    pub fn new(block: &Block) -> Self {
        Self::from_parts(block.prev_hash.clone(), block.hash_transactions())
    }

    pub fn from_parts(prev_hash: Vec<u8>, tx_hash: Vec<u8>) -> Self {
        ProofOfWork {
            prev_hash,
            tx_hash,
            target: target(DIFFICULTY),
        }
    }

    /// Bytes hashed for a given nonce: prev hash, tx hash, nonce, difficulty
    ///
    /// Nonce and difficulty are written as fixed-width big-endian integers.
    pub fn init_data(&self, nonce: u64) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.prev_hash.len() + self.tx_hash.len() + 16);
        data.extend_from_slice(&self.prev_hash);
        data.extend_from_slice(&self.tx_hash);
        data.extend_from_slice(&nonce.to_be_bytes());
        data.extend_from_slice(&u64::from(DIFFICULTY).to_be_bytes());
        data
    }

    pub fn hash_with_nonce(&self, nonce: u64) -> [u8; 32] {
        Sha256::digest(self.init_data(nonce)).into()
    }

    /// A hash meets the target when, read as a big-endian integer, it is below it
    pub fn meets_target(&self, hash: &[u8; 32]) -> bool {
        hash < &self.target
    }

    /// Recomputes the hash for a stored nonce and checks it against the target
    pub fn validate(&self, nonce: u64) -> bool {
        nonce <= MAX_NONCE && self.meets_target(&self.hash_with_nonce(nonce))
    }

    /// Searches for the lowest nonce whose hash meets the target
    ///
    /// Workers claim chunks in increasing order from a shared cursor. The best
    /// nonce found so far doubles as the cancellation signal: a worker drops a
    /// chunk once every nonce left in it is above the best. All workers are
    /// joined before returning, so the result is always the lowest solution.
    pub fn run(&self, options: &MiningOptions) -> Result<(u64, Vec<u8>), ProofError> {
        let workers = options.workers.max(1);
        let chunk_size = options.chunk_size.max(1);

        let cursor = AtomicU64::new(0);
        let best = AtomicU64::new(NO_SOLUTION);
        let (sender, receiver) = crossbeam_channel::unbounded();

        debug!(
            "Mining with {} workers, {} nonces per chunk",
            workers, chunk_size
        );

        thread::scope(|scope| {
            for worker in 0..workers {
                let sender = sender.clone();
                let cursor = &cursor;
                let best = &best;
                scope.spawn(move || self.search(worker, chunk_size, cursor, best, &sender));
            }
        });
        drop(sender);

        let (nonce, hash) = receiver
            .try_iter()
            .min_by_key(|(nonce, _)| *nonce)
            .ok_or(ProofError::MiningExhausted)?;

        info!("Found nonce {} with hash {}", nonce, hex::encode(hash));
        Ok((nonce, hash.to_vec()))
    }

    fn search(
        &self,
        worker: usize,
        chunk_size: u64,
        cursor: &AtomicU64,
        best: &AtomicU64,
        found: &Sender<(u64, [u8; 32])>,
    ) {
        loop {
            let start = cursor.fetch_add(chunk_size, Ordering::SeqCst);
            if start >= MAX_NONCE || start >= best.load(Ordering::SeqCst) {
                return;
            }
            let end = start.saturating_add(chunk_size).min(MAX_NONCE);

            for nonce in start..end {
                if (nonce - start) % CANCEL_CHECK_INTERVAL == 0 && best.load(Ordering::SeqCst) < nonce {
                    debug!("Worker {} cancelled at nonce {}", worker, nonce);
                    return;
                }

                let hash = self.hash_with_nonce(nonce);
                if self.meets_target(&hash) {
                    best.fetch_min(nonce, Ordering::SeqCst);
                    // the receiver outlives every worker
                    let _ = found.send((nonce, hash));
                    return;
                }
            }
        }
    }
}
