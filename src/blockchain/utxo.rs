use std::collections::HashSet;

use log::debug;

use super::chain::{Blockchain, BlockchainError};
use super::transaction::{sum_values, Transaction, TransactionError, TxOutput};

/// A single output of a transaction, by transaction id and index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub txid: Vec<u8>,
    pub index: usize,
}

impl OutPoint {
    pub fn new(txid: Vec<u8>, index: usize) -> Self {
        OutPoint { txid, index }
    }
}

/// Outputs already claimed by an input seen during a scan
#[derive(Debug, Clone, Default)]
pub struct SpentOutputs(HashSet<OutPoint>);

impl SpentOutputs {
    /// Records every output claimed by the inputs of `tx`, optionally only
    /// those inputs whose key hashes to `owner`
    fn record(&mut self, tx: &Transaction, owner: Option<&[u8]>) {
        if tx.is_coinbase() {
            return;
        }

        for input in &tx.inputs {
            if owner.map_or(true, |owner| input.uses_key(owner)) {
                if let Ok(index) = usize::try_from(input.out) {
                    self.0.insert(OutPoint::new(input.id.clone(), index));
                }
            }
        }
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.0.contains(outpoint)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Outputs selected to fund a transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpendableOutputs {
    /// Sum of the selected outputs' values
    pub accumulated: u64,

    /// Selected outputs in scan order
    pub outputs: Vec<OutPoint>,
}

/// A transaction holding outputs still unspent by one owner
#[derive(Debug, Clone)]
struct UnspentEntry {
    tx: Transaction,
    indices: Vec<usize>,
}

impl Blockchain {
    /// Walks the chain from tip to genesis collecting the transactions that
    /// still hold outputs locked to `pub_key_hash`
    ///
    /// Inputs always reference older transactions, so a backward walk sees
    /// every spend before the output it consumes. Transactions inside a block
    /// are visited last to first for the same reason.
    fn scan_unspent(&self, pub_key_hash: &[u8]) -> Result<Vec<UnspentEntry>, BlockchainError> {
        let mut spent = SpentOutputs::default();
        let mut unspent = Vec::new();

        for block in self.iter()? {
            let block = block?;

            for tx in block.transactions.iter().rev() {
                let indices: Vec<usize> = tx
                    .outputs
                    .iter()
                    .enumerate()
                    .filter(|(index, out)| {
                        out.is_locked_with_key(pub_key_hash)
                            && !spent.contains(&OutPoint::new(tx.id.clone(), *index))
                    })
                    .map(|(index, _)| index)
                    .collect();

                if !indices.is_empty() {
                    unspent.push(UnspentEntry {
                        tx: tx.clone(),
                        indices,
                    });
                }

                spent.record(tx, Some(pub_key_hash));
            }
        }

        debug!(
            "Scanned chain for {}: {} transactions with unspent outputs, {} spent",
            hex::encode(pub_key_hash),
            unspent.len(),
            spent.len()
        );
        Ok(unspent)
    }

    /// Transactions holding at least one unspent output locked to `pub_key_hash`
    pub fn find_unspent_transactions(&self, pub_key_hash: &[u8]) -> Result<Vec<Transaction>, BlockchainError> {
        Ok(self
            .scan_unspent(pub_key_hash)?
            .into_iter()
            .map(|entry| entry.tx)
            .collect())
    }

    /// All unspent outputs locked to `pub_key_hash`
    pub fn find_utxo(&self, pub_key_hash: &[u8]) -> Result<Vec<TxOutput>, BlockchainError> {
        Ok(self
            .scan_unspent(pub_key_hash)?
            .into_iter()
            .flat_map(|entry| {
                let UnspentEntry { tx, indices } = entry;
                indices.into_iter().map(move |index| tx.outputs[index].clone())
            })
            .collect())
    }

    /// Greedily selects unspent outputs of `pub_key_hash` until `amount` is covered
    ///
    /// If the owner does not hold enough, every unspent output is selected and
    /// `accumulated` falls short of `amount`. Fails with `ValueOverflow` if the
    /// selected values cannot be summed.
    pub fn find_spendable_outputs(
        &self,
        pub_key_hash: &[u8],
        amount: u64,
    ) -> Result<SpendableOutputs, BlockchainError> {
        let mut selection = SpendableOutputs::default();

        'scan: for entry in self.scan_unspent(pub_key_hash)? {
            for index in entry.indices {
                selection.accumulated = selection
                    .accumulated
                    .checked_add(entry.tx.outputs[index].value)
                    .ok_or(TransactionError::ValueOverflow)?;
                selection.outputs.push(OutPoint::new(entry.tx.id.clone(), index));

                if selection.accumulated >= amount {
                    break 'scan;
                }
            }
        }

        Ok(selection)
    }

    /// Sum of all unspent outputs locked to `pub_key_hash`
    pub fn balance(&self, pub_key_hash: &[u8]) -> Result<u64, BlockchainError> {
        Ok(sum_values(self.find_utxo(pub_key_hash)?.iter())?)
    }

    /// Every output claimed by any input recorded in the chain
    pub fn spent_outputs(&self) -> Result<SpentOutputs, BlockchainError> {
        let mut spent = SpentOutputs::default();
        for block in self.iter()? {
            let block = block?;
            for tx in &block.transactions {
                spent.record(tx, None);
            }
        }
        Ok(spent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::block::Block;
    use crate::blockchain::crypto::KeyPair;
    use crate::blockchain::proof::MiningOptions;
    use crate::blockchain::storage::BlockchainStorage;
    use crate::blockchain::transaction::GENESIS_REWARD;
    use tempfile::TempDir;

    fn options() -> MiningOptions {
        MiningOptions { workers: 2, chunk_size: 1000 }
    }

    fn new_chain(dir: &TempDir, owner: &KeyPair) -> Blockchain {
        Blockchain::create(dir.path().join("blocks"), &owner.address(), options()).unwrap()
    }

    #[test]
    fn test_genesis_utxo() {
        let dir = TempDir::new().unwrap();
        let alice = KeyPair::generate();
        let chain = new_chain(&dir, &alice);

        let utxos = chain.find_utxo(&alice.pub_key_hash()).unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].value, GENESIS_REWARD);

        let spendable = chain.find_spendable_outputs(&alice.pub_key_hash(), 100).unwrap();
        assert!(spendable.accumulated >= 100);
        assert_eq!(spendable.outputs.len(), 1);
        assert_eq!(spendable.outputs[0].index, 0);

        let txs = chain.find_unspent_transactions(&alice.pub_key_hash()).unwrap();
        assert_eq!(txs.len(), 1);
        assert!(txs[0].is_coinbase());
    }

    #[test]
    fn test_stranger_has_nothing() {
        let dir = TempDir::new().unwrap();
        let alice = KeyPair::generate();
        let chain = new_chain(&dir, &alice);
        let bob = KeyPair::generate();

        assert!(chain.find_utxo(&bob.pub_key_hash()).unwrap().is_empty());
        assert_eq!(chain.balance(&bob.pub_key_hash()).unwrap(), 0);

        let spendable = chain.find_spendable_outputs(&bob.pub_key_hash(), 1).unwrap();
        assert_eq!(spendable, SpendableOutputs::default());
    }

    #[test]
    fn test_spend_moves_outputs() {
        let dir = TempDir::new().unwrap();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let chain = new_chain(&dir, &alice);
        let genesis_tx = chain.find_unspent_transactions(&alice.pub_key_hash()).unwrap()[0].clone();

        chain.send(&alice, &bob.address(), 30).unwrap();

        let alice_utxos = chain.find_utxo(&alice.pub_key_hash()).unwrap();
        assert_eq!(alice_utxos.len(), 1);
        assert_eq!(alice_utxos[0].value, 70);

        let bob_utxos = chain.find_utxo(&bob.pub_key_hash()).unwrap();
        assert_eq!(bob_utxos.len(), 1);
        assert_eq!(bob_utxos[0].value, 30);

        let alice_txs = chain.find_unspent_transactions(&alice.pub_key_hash()).unwrap();
        assert!(alice_txs.iter().all(|tx| tx.id != genesis_tx.id));

        let spent = chain.spent_outputs().unwrap();
        assert!(spent.contains(&OutPoint::new(genesis_tx.id.clone(), 0)));
        assert_eq!(spent.len(), 1);
    }

    #[test]
    fn test_selection_stops_once_covered() {
        let dir = TempDir::new().unwrap();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let chain = new_chain(&dir, &alice);

        // bob ends up with three separate outputs
        chain.send(&alice, &bob.address(), 10).unwrap();
        chain.send(&alice, &bob.address(), 20).unwrap();
        chain.send(&alice, &bob.address(), 30).unwrap();

        let spendable = chain.find_spendable_outputs(&bob.pub_key_hash(), 25).unwrap();
        // newest first: the 30 output alone covers 25
        assert_eq!(spendable.accumulated, 30);
        assert_eq!(spendable.outputs.len(), 1);

        let spendable = chain.find_spendable_outputs(&bob.pub_key_hash(), 45).unwrap();
        assert_eq!(spendable.accumulated, 50);
        assert_eq!(spendable.outputs.len(), 2);

        let spendable = chain.find_spendable_outputs(&bob.pub_key_hash(), 1000).unwrap();
        assert_eq!(spendable.accumulated, 60);
        assert_eq!(spendable.outputs.len(), 3);
    }

    #[test]
    fn test_scan_is_repeatable() {
        let dir = TempDir::new().unwrap();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let chain = new_chain(&dir, &alice);
        chain.send(&alice, &bob.address(), 40).unwrap();

        let first = chain.find_spendable_outputs(&alice.pub_key_hash(), 50).unwrap();
        let second = chain.find_spendable_outputs(&alice.pub_key_hash(), 50).unwrap();
        assert_eq!(first, second);
        assert_eq!(chain.balance(&alice.pub_key_hash()).unwrap(), 60);
    }

    #[test]
    fn test_oversized_outputs_are_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocks");
        let alice = KeyPair::generate();

        // written straight to the store; add_block refuses new coinbases
        {
            let storage = BlockchainStorage::open(&path).unwrap();

            let mut huge = Transaction::coinbase(&alice.address(), Some("huge")).unwrap();
            huge.outputs[0].value = u64::MAX;
            huge.id = huge.hash().unwrap();
            let genesis = Block::genesis(huge, &options()).unwrap();
            storage.append_block(&genesis).unwrap();

            let mut small = Transaction::coinbase(&alice.address(), Some("small")).unwrap();
            small.outputs[0].value = 1;
            small.id = small.hash().unwrap();
            let block = Block::create(vec![small], genesis.hash.clone(), &options()).unwrap();
            storage.append_block(&block).unwrap();
            storage.flush().unwrap();
        }

        let chain = Blockchain::open(&path, options()).unwrap();

        assert!(matches!(
            chain.balance(&alice.pub_key_hash()),
            Err(BlockchainError::TransactionError(TransactionError::ValueOverflow))
        ));
        assert!(matches!(
            chain.find_spendable_outputs(&alice.pub_key_hash(), u64::MAX),
            Err(BlockchainError::TransactionError(TransactionError::ValueOverflow))
        ));

        // the newest output alone covers a small amount
        let spendable = chain.find_spendable_outputs(&alice.pub_key_hash(), 1).unwrap();
        assert_eq!(spendable.accumulated, 1);
        assert_eq!(spendable.outputs.len(), 1);
    }
}
