use std::path::Path;

use log::debug;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use thiserror::Error;

use super::block::Block;

/// Key holding the hash of the current tip
pub const LAST_HASH_KEY: &[u8] = b"lh";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Item not found: {0}")]
    NotFound(String),

    #[error("Database transaction aborted")]
    TransactionAborted,
}

/// Storage for blockchain data
///
/// Every block is stored under its raw hash, next to the `lh` key pointing
/// at the tip.
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Tree for blocks and the tip pointer
    blocks: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage")
            .finish()
    }
}

impl BlockchainStorage {
    /// Opens (or creates) the block store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;

        Ok(Self { db, blocks })
    }

    /// Whether a chain has been persisted in this store
    pub fn has_chain(&self) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(LAST_HASH_KEY)?)
    }

    /// Gets the hash of the current tip
    pub fn get_last_hash(&self) -> Result<Vec<u8>, StorageError> {
        match self.blocks.get(LAST_HASH_KEY)? {
            Some(value) => Ok(value.to_vec()),
            None => Err(StorageError::NotFound("Latest block hash not found".to_string())),
        }
    }

    /// Gets a block by its hash
    pub fn get_block(&self, hash: &[u8]) -> Result<Block, StorageError> {
        if let Some(value) = self.blocks.get(hash)? {
            Block::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string()))
        } else {
            Err(StorageError::NotFound(format!(
                "Block with hash {} not found",
                hex::encode(hash)
            )))
        }
    }

    /// Writes a block and moves the tip pointer to it in one transaction
    pub fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        let value = block
            .serialize()
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let key = block.hash.as_slice();

        self.blocks
            .transaction(|tx| {
                tx.insert(key, value.as_slice())?;
                tx.insert(LAST_HASH_KEY, key)?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(()) => StorageError::TransactionAborted,
                TransactionError::Storage(e) => StorageError::DatabaseError(e),
            })?;

        debug!("Stored block {} ({} bytes)", hex::encode(key), value.len());
        Ok(())
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}
