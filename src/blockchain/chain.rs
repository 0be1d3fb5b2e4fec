use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use log::{debug, info, warn};
use thiserror::Error;

use super::block::Block;
use super::crypto::{Address, KeyPair};
use super::proof::{MiningOptions, ProofError};
use super::storage::{BlockchainStorage, StorageError};
use super::transaction::{Transaction, TransactionError};
use super::utxo::OutPoint;

/// Data stored in the genesis coinbase input
pub const GENESIS_DATA: &str = "First Transaction from Genesis";

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Proof of work error: {0}")]
    ProofError(#[from] ProofError),

    #[error("Blockchain already exists at {0}")]
    ChainAlreadyExists(String),

    #[error("No existing blockchain found at {0}, create one first")]
    ChainNotFound(String),

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl BlockchainError {
    /// Whether the error is a shortfall of funds rather than a failure
    pub fn is_insufficient_funds(&self) -> bool {
        matches!(
            self,
            BlockchainError::TransactionError(TransactionError::InsufficientFunds { .. })
        )
    }
}

/// A persisted chain of blocks
///
/// The store handle is owned by the chain and closed when it is dropped.
/// Reads go straight to the store; `add_block` callers are serialised by an
/// internal lock held from reading the tip until the new tip is written.
#[derive(Debug)]
pub struct Blockchain {
    /// Storage for blockchain data
    storage: BlockchainStorage,

    /// Proof-of-work search settings
    mining: MiningOptions,

    /// Held for the whole of `add_block`
    writer: Mutex<()>,
}

impl Blockchain {
    /// Creates a new chain at `path` whose genesis pays the reward to `address`
    ///
    /// Fails with `ChainAlreadyExists` if a chain is already persisted there.
    pub fn create<P: AsRef<Path>>(
        path: P,
        address: &Address,
        mining: MiningOptions,
    ) -> Result<Self, BlockchainError> {
        let path = path.as_ref();
        let storage = BlockchainStorage::open(path)?;

        if storage.has_chain()? {
            return Err(BlockchainError::ChainAlreadyExists(path.display().to_string()));
        }

        let coinbase = Transaction::coinbase(address, Some(GENESIS_DATA))?;
        let genesis = Block::genesis(coinbase, &mining)?;
        storage.append_block(&genesis)?;
        storage.flush()?;

        info!(
            "Genesis block {} created, {} rewarded",
            hex::encode(&genesis.hash),
            address
        );

        Ok(Blockchain {
            storage,
            mining,
            writer: Mutex::new(()),
        })
    }

    /// Opens an existing chain at `path`
    ///
    /// Fails with `ChainNotFound` without creating anything if no chain is
    /// persisted there.
    pub fn open<P: AsRef<Path>>(path: P, mining: MiningOptions) -> Result<Self, BlockchainError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(BlockchainError::ChainNotFound(path.display().to_string()));
        }

        let storage = BlockchainStorage::open(path)?;
        if !storage.has_chain()? {
            return Err(BlockchainError::ChainNotFound(path.display().to_string()));
        }

        debug!("Opened chain at {} with tip {}", path.display(), hex::encode(storage.get_last_hash()?));

        Ok(Blockchain {
            storage,
            mining,
            writer: Mutex::new(()),
        })
    }

    /// Hash of the current tip
    pub fn last_hash(&self) -> Result<Vec<u8>, BlockchainError> {
        Ok(self.storage.get_last_hash()?)
    }

    /// Iterates from the tip back to genesis
    ///
    /// The cursor starts at the tip read now; blocks appended later are not
    /// seen. Create a new iterator for every traversal.
    pub fn iter(&self) -> Result<ChainIterator<'_>, BlockchainError> {
        Ok(ChainIterator {
            current_hash: self.storage.get_last_hash()?,
            storage: &self.storage,
        })
    }

    /// All blocks from tip to genesis
    pub fn blocks(&self) -> Result<Vec<Block>, BlockchainError> {
        self.iter()?.collect()
    }

    /// Mines a block holding `transactions` on top of the current tip
    ///
    /// Every transaction must be a transfer whose signatures verify against
    /// the chain and whose outputs pay out no more than the inputs claim. No
    /// output may be claimed twice, either by an input already in the chain or
    /// by two inputs of this block. Coinbases only appear in the genesis block.
    /// Nothing is written when any check fails.
    pub fn add_block(&self, transactions: Vec<Transaction>) -> Result<Block, BlockchainError> {
        let _writer = self
            .writer
            .lock()
            .map_err(|_| BlockchainError::SystemError("chain writer lock poisoned".to_string()))?;

        self.check_transactions(&transactions)?;

        let last_hash = self.storage.get_last_hash()?;
        let block = Block::create(transactions, last_hash, &self.mining)?;

        self.storage.append_block(&block)?;
        self.storage.flush()?;

        info!(
            "Added block {} with {} transactions",
            hex::encode(&block.hash),
            block.transactions.len()
        );
        Ok(block)
    }

    fn check_transactions(&self, transactions: &[Transaction]) -> Result<(), BlockchainError> {
        let spent = self.spent_outputs()?;
        let mut claimed = HashSet::new();

        for tx in transactions {
            let txid = hex::encode(&tx.id);

            if tx.is_coinbase() {
                warn!("Rejected transaction {}: coinbase outside the genesis block", txid);
                return Err(BlockchainError::InvalidTransaction(txid));
            }

            if !self.verify_transaction(tx)? {
                warn!("Rejected transaction {}: verification failed", txid);
                return Err(BlockchainError::InvalidTransaction(txid));
            }

            let prev_txs = self.prior_transactions(tx)?;
            let balanced = match (tx.input_value(&prev_txs), tx.output_value()) {
                (Ok(inputs), Ok(outputs)) => outputs <= inputs,
                _ => false,
            };
            if !balanced {
                warn!("Rejected transaction {}: outputs exceed the inputs they spend", txid);
                return Err(BlockchainError::InvalidTransaction(txid));
            }

            for input in &tx.inputs {
                let outpoint = usize::try_from(input.out)
                    .map(|index| OutPoint::new(input.id.clone(), index))
                    .map_err(|_| BlockchainError::InvalidTransaction(txid.clone()))?;

                if spent.contains(&outpoint) || !claimed.insert(outpoint) {
                    warn!(
                        "Rejected transaction {}: output {}:{} already spent",
                        txid,
                        hex::encode(&input.id),
                        input.out
                    );
                    return Err(BlockchainError::InvalidTransaction(txid));
                }
            }
        }

        Ok(())
    }

    /// Finds a transaction anywhere in the chain by its id
    pub fn find_transaction(&self, id: &[u8]) -> Result<Transaction, BlockchainError> {
        for block in self.iter()? {
            if let Some(tx) = block?.transactions.into_iter().find(|tx| tx.id == id) {
                return Ok(tx);
            }
        }

        Err(TransactionError::MissingPriorTransaction(hex::encode(id)).into())
    }

    /// Collects the transactions referenced by the inputs of `tx`, keyed by hex id
    ///
    /// Walks the chain once; fails with `MissingPriorTransaction` if any
    /// referenced transaction is absent.
    pub fn prior_transactions(&self, tx: &Transaction) -> Result<HashMap<String, Transaction>, BlockchainError> {
        let mut prev_txs = HashMap::new();
        if tx.is_coinbase() {
            return Ok(prev_txs);
        }

        let mut wanted: HashSet<String> = tx.inputs.iter().map(|input| hex::encode(&input.id)).collect();

        for block in self.iter()? {
            if wanted.is_empty() {
                break;
            }
            for prev in block?.transactions {
                let id = hex::encode(&prev.id);
                if wanted.remove(&id) {
                    prev_txs.insert(id, prev);
                }
            }
        }

        match wanted.into_iter().next() {
            Some(missing) => Err(TransactionError::MissingPriorTransaction(missing).into()),
            None => Ok(prev_txs),
        }
    }

    /// Signs every input of `tx` against the outputs it claims
    pub fn sign_transaction(&self, tx: &mut Transaction, keys: &KeyPair) -> Result<(), BlockchainError> {
        let prev_txs = self.prior_transactions(tx)?;
        tx.sign(keys, &prev_txs)?;
        Ok(())
    }

    /// Verifies every input signature of `tx`
    ///
    /// A transaction referencing anything not in the chain does not verify.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, BlockchainError> {
        let prev_txs = match self.prior_transactions(tx) {
            Ok(prev_txs) => prev_txs,
            Err(BlockchainError::TransactionError(TransactionError::MissingPriorTransaction(id))) => {
                warn!("Transaction {} references unknown transaction {}", hex::encode(&tx.id), id);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        match tx.verify(&prev_txs) {
            Ok(valid) => Ok(valid),
            Err(TransactionError::InvalidOutputIndex { txid, index }) => {
                warn!("Transaction {} claims missing output {}:{}", hex::encode(&tx.id), txid, index);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Builds and signs a transfer of `amount` from `from` to `to`
    ///
    /// Fails with `InsufficientFunds` when the sender's unspent outputs do not
    /// cover `amount`.
    pub fn build_transaction(
        &self,
        from: &KeyPair,
        to: &Address,
        amount: u64,
    ) -> Result<Transaction, BlockchainError> {
        let spendable = self.find_spendable_outputs(&from.pub_key_hash(), amount)?;
        let mut tx = Transaction::new_transfer(from, to, amount, &spendable)?;
        self.sign_transaction(&mut tx, from)?;

        debug!(
            "Built transaction {} spending {} outputs",
            hex::encode(&tx.id),
            tx.inputs.len()
        );
        Ok(tx)
    }

    /// Transfers `amount` from `from` to `to` in a newly mined block
    pub fn send(&self, from: &KeyPair, to: &Address, amount: u64) -> Result<Block, BlockchainError> {
        let tx = self.build_transaction(from, to, amount)?;
        self.add_block(vec![tx])
    }

    /// Audits every block: proof of work, stored hash and backward links
    pub fn validate_chain(&self) -> Result<bool, BlockchainError> {
        let mut expected = self.storage.get_last_hash()?;

        for block in self.iter()? {
            let block = block?;
            if block.hash != expected || !block.is_valid() {
                warn!("Block {} failed validation", hex::encode(&block.hash));
                return Ok(false);
            }
            expected = block.prev_hash;
        }

        Ok(expected.is_empty())
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), BlockchainError> {
        self.storage.flush()?;
        Ok(())
    }
}

/// Cursor walking the chain from a tip back to genesis
pub struct ChainIterator<'a> {
    current_hash: Vec<u8>,
    storage: &'a BlockchainStorage,
}

impl Iterator for ChainIterator<'_> {
    type Item = Result<Block, BlockchainError>;

    fn next(&mut self) -> Option<Self::Item> {
        // the genesis block's empty previous hash ends the walk
        if self.current_hash.is_empty() {
            return None;
        }

        match self.storage.get_block(&self.current_hash) {
            Ok(block) => {
                self.current_hash = block.prev_hash.clone();
                Some(Ok(block))
            }
            Err(err) => {
                self.current_hash.clear();
                Some(Err(err.into()))
            }
        }
    }
}
