//! A single-node UTXO ledger: proof-of-work blocks in a persistent chain
//! store, spendable-output selection and signed transactions.

pub mod blockchain;
pub mod config;
