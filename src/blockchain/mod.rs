// Blockchain module
//
// This module contains the ledger engine:
// - Proof of work search and validation
// - Block structure and serialization
// - Persistent block store and chain iteration
// - UTXO index and output selection
// - Transactions, signing and verification
// - Key material, addresses and the wallet file

pub mod block;
pub mod chain;
pub mod crypto;
pub mod proof;
pub mod storage;
pub mod transaction;
pub mod utxo;
pub mod wallet;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{Blockchain, BlockchainError, ChainIterator};
pub use crypto::{Address, KeyPair};
pub use proof::{MiningOptions, ProofOfWork};
pub use transaction::{Transaction, TransactionError, TxInput, TxOutput};
pub use utxo::{OutPoint, SpendableOutputs};
pub use wallet::{WalletError, Wallets};
