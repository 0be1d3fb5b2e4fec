use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::crypto::{pub_key_hash, verify_signature, Address, CryptoError, KeyPair};
use super::utxo::SpendableOutputs;

/// Value minted by a coinbase transaction
pub const GENESIS_REWARD: u64 = 100;

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_OUT_INDEX: i64 = -1;

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Previous transaction {0} does not exist")]
    MissingPriorTransaction(String),

    #[error("Transaction {txid} has no output {index}")]
    InvalidOutputIndex { txid: String, index: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Sum of output values overflows")]
    ValueOverflow,
}

/// A reference to an output of a prior transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Identifier of the transaction holding the output
    pub id: Vec<u8>,

    /// Index of the claimed output, -1 for coinbase
    pub out: i64,

    /// Signature over the per-input digest, empty for coinbase
    pub signature: Vec<u8>,

    /// Public key of the spender (arbitrary data for coinbase)
    pub pub_key: Vec<u8>,
}

impl TxInput {
    /// Checks whether the key on this input hashes to `owner`
    pub fn uses_key(&self, owner: &[u8]) -> bool {
        pub_key_hash(&self.pub_key) == owner
    }
}

/// An amount locked to the hash of a public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u64,
    pub pub_key_hash: Vec<u8>,
}

impl TxOutput {
    /// Creates an output locked to an address
    pub fn new(value: u64, address: &Address) -> Result<Self, TransactionError> {
        Ok(TxOutput {
            value,
            pub_key_hash: address.pub_key_hash()?,
        })
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash == pub_key_hash
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Content hash of the transaction
    pub id: Vec<u8>,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Creates a coinbase transaction paying the genesis reward to `to`
    ///
    /// # Arguments
    ///
    /// * `to` - The address receiving the reward
    /// * `data` - Arbitrary data stored in the input, defaults to "Coins to <to>"
    pub fn coinbase(to: &Address, data: Option<&str>) -> Result<Self, TransactionError> {
        let data = match data {
            Some(data) if !data.is_empty() => data.to_string(),
            _ => format!("Coins to {}", to),
        };

        let input = TxInput {
            id: Vec::new(),
            out: COINBASE_OUT_INDEX,
            signature: Vec::new(),
            pub_key: data.into_bytes(),
        };
        let output = TxOutput::new(GENESIS_REWARD, to)?;

        let mut tx = Transaction {
            id: Vec::new(),
            inputs: vec![input],
            outputs: vec![output],
        };
        tx.id = tx.hash()?;

        Ok(tx)
    }

    /// Creates an unsigned transfer from the selected spendable outputs
    ///
    /// # Arguments
    ///
    /// * `from` - The sender's keys
    /// * `to` - The recipient's address
    /// * `amount` - The amount to transfer
    /// * `spendable` - Outputs of the sender selected to cover `amount`
    ///
    /// # Returns
    ///
    /// A transaction with one input per selected output, a payment output and,
    /// when the selection exceeds `amount`, a change output back to the sender
    pub fn new_transfer(
        from: &KeyPair,
        to: &Address,
        amount: u64,
        spendable: &SpendableOutputs,
    ) -> Result<Self, TransactionError> {
        if amount == 0 {
            return Err(TransactionError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        if spendable.accumulated < amount {
            return Err(TransactionError::InsufficientFunds {
                required: amount,
                available: spendable.accumulated,
            });
        }

        let inputs = spendable
            .outputs
            .iter()
            .map(|outpoint| TxInput {
                id: outpoint.txid.clone(),
                out: outpoint.index as i64,
                signature: Vec::new(),
                pub_key: from.public_key(),
            })
            .collect();

        let mut outputs = vec![TxOutput::new(amount, to)?];
        if spendable.accumulated > amount {
            outputs.push(TxOutput {
                value: spendable.accumulated - amount,
                pub_key_hash: from.pub_key_hash(),
            });
        }

        let mut tx = Transaction {
            id: Vec::new(),
            inputs,
            outputs,
        };
        tx.id = tx.hash()?;

        Ok(tx)
    }

    /// Encodes the transaction with bincode
    pub fn serialize(&self) -> Result<Vec<u8>, TransactionError> {
        bincode::serialize(self).map_err(|e| TransactionError::SerializationError(e.to_string()))
    }

    /// Hashes the transaction with its id and all signatures cleared
    pub fn hash(&self) -> Result<Vec<u8>, TransactionError> {
        let mut copy = self.clone();
        copy.id = Vec::new();
        for input in &mut copy.inputs {
            input.signature = Vec::new();
        }

        Ok(Sha256::digest(copy.serialize()?).to_vec())
    }

    /// Checks if the transaction is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].id.is_empty() && self.inputs[0].out == COINBASE_OUT_INDEX
    }

    /// Sum of the values this transaction pays out
    pub fn output_value(&self) -> Result<u64, TransactionError> {
        sum_values(self.outputs.iter())
    }

    /// Sum of the values of the prior outputs claimed by the inputs
    pub fn input_value(&self, prev_txs: &HashMap<String, Transaction>) -> Result<u64, TransactionError> {
        let claimed = self
            .inputs
            .iter()
            .map(|input| prior_output(prev_txs, input))
            .collect::<Result<Vec<_>, _>>()?;

        sum_values(claimed.into_iter())
    }

    /// Copy with every signature and public key removed
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                id: input.id.clone(),
                out: input.out,
                signature: Vec::new(),
                pub_key: Vec::new(),
            })
            .collect();

        Transaction {
            id: self.id.clone(),
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Signs every input with `keys`
    ///
    /// `prev_txs` maps the hex id of each referenced transaction to the
    /// transaction itself. Coinbase transactions are left unsigned.
    pub fn sign(
        &mut self,
        keys: &KeyPair,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<(), TransactionError> {
        if self.is_coinbase() {
            return Ok(());
        }

        let digests = self.signing_digests(prev_txs)?;
        for (input, (_, digest)) in self.inputs.iter_mut().zip(digests) {
            input.signature = keys.sign(&digest);
        }

        Ok(())
    }

    /// Verifies the signature of every input against the output it claims
    ///
    /// Returns `Ok(false)` on the first input whose public key does not hash to
    /// the claimed output's locking hash or whose signature does not verify,
    /// and an error if a referenced transaction is not in `prev_txs`.
    pub fn verify(&self, prev_txs: &HashMap<String, Transaction>) -> Result<bool, TransactionError> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let digests = self.signing_digests(prev_txs)?;
        for (input, (locking_hash, digest)) in self.inputs.iter().zip(digests) {
            if !input.uses_key(&locking_hash) {
                return Ok(false);
            }
            match verify_signature(&digest, &input.signature, &input.pub_key) {
                Ok(true) => {}
                Ok(false) | Err(_) => return Ok(false),
            }
        }

        Ok(true)
    }

    /// Per-input locking hash and digest. The digest is the hash of the trimmed
    /// copy with only that input's key field set to the locking hash of the
    /// output it references.
    fn signing_digests(
        &self,
        prev_txs: &HashMap<String, Transaction>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, TransactionError> {
        let mut trimmed = self.trimmed_copy();
        let mut digests = Vec::with_capacity(self.inputs.len());

        for (index, input) in self.inputs.iter().enumerate() {
            let locking_hash = prior_output(prev_txs, input)?.pub_key_hash.clone();

            trimmed.inputs[index].pub_key = locking_hash.clone();
            digests.push((locking_hash, trimmed.hash()?));
            trimmed.inputs[index].pub_key = Vec::new();
        }

        Ok(digests)
    }
}

/// Looks up the output an input claims
fn prior_output<'a>(
    prev_txs: &'a HashMap<String, Transaction>,
    input: &TxInput,
) -> Result<&'a TxOutput, TransactionError> {
    let txid = hex::encode(&input.id);
    let prev = prev_txs
        .get(&txid)
        .ok_or_else(|| TransactionError::MissingPriorTransaction(txid.clone()))?;

    usize::try_from(input.out)
        .ok()
        .and_then(|index| prev.outputs.get(index))
        .ok_or(TransactionError::InvalidOutputIndex {
            txid,
            index: input.out,
        })
}

/// Adds up output values, failing instead of wrapping
pub(crate) fn sum_values<'a>(mut outputs: impl Iterator<Item = &'a TxOutput>) -> Result<u64, TransactionError> {
    outputs.try_fold(0u64, |sum, out| {
        sum.checked_add(out.value).ok_or(TransactionError::ValueOverflow)
    })
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- Transaction {}:", hex::encode(&self.id))?;

        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(f, "     Input {}:", i)?;
            writeln!(f, "       TXID:      {}", hex::encode(&input.id))?;
            writeln!(f, "       Out:       {}", input.out)?;
            writeln!(f, "       Signature: {}", hex::encode(&input.signature))?;
            writeln!(f, "       PubKey:    {}", hex::encode(&input.pub_key))?;
        }

        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(f, "     Output {}:", i)?;
            writeln!(f, "       Value:  {}", output.value)?;
            write!(f, "       Script: {}", hex::encode(&output.pub_key_hash))?;
            if i + 1 < self.outputs.len() {
                writeln!(f)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::utxo::OutPoint;

    fn funded(keys: &KeyPair, value: u64) -> Transaction {
        let mut tx = Transaction::coinbase(&keys.address(), None).unwrap();
        tx.outputs[0].value = value;
        tx.id = tx.hash().unwrap();
        tx
    }

    fn priors(txs: &[&Transaction]) -> HashMap<String, Transaction> {
        txs.iter()
            .map(|tx| (hex::encode(&tx.id), (*tx).clone()))
            .collect()
    }

    fn selection(outputs: Vec<(&Transaction, usize)>) -> SpendableOutputs {
        let accumulated = outputs
            .iter()
            .map(|(tx, index)| tx.outputs[*index].value)
            .sum();
        SpendableOutputs {
            accumulated,
            outputs: outputs
                .into_iter()
                .map(|(tx, index)| OutPoint::new(tx.id.clone(), index))
                .collect(),
        }
    }

    #[test]
    fn test_coinbase_transaction() {
        let keys = KeyPair::generate();
        let tx = Transaction::coinbase(&keys.address(), None).unwrap();

        assert!(tx.is_coinbase());
        assert_eq!(tx.inputs[0].out, COINBASE_OUT_INDEX);
        assert_eq!(tx.inputs[0].pub_key, format!("Coins to {}", keys.address()).into_bytes());
        assert_eq!(tx.outputs[0].value, GENESIS_REWARD);
        assert!(tx.outputs[0].is_locked_with_key(&keys.pub_key_hash()));
        assert_eq!(tx.id, tx.hash().unwrap());
    }

    #[test]
    fn test_input_and_output_values() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let first = funded(&alice, 40);
        let second = funded(&alice, 25);

        let tx = Transaction::new_transfer(
            &alice,
            &bob.address(),
            50,
            &selection(vec![(&first, 0), (&second, 0)]),
        )
        .unwrap();

        assert_eq!(tx.input_value(&priors(&[&first, &second])).unwrap(), 65);
        assert_eq!(tx.output_value().unwrap(), 65);
        assert!(matches!(
            tx.input_value(&priors(&[&first])),
            Err(TransactionError::MissingPriorTransaction(_))
        ));
    }

    #[test]
    fn test_value_sums_do_not_wrap() {
        let alice = KeyPair::generate();
        let mut tx = funded(&alice, u64::MAX);
        tx.outputs.push(TxOutput {
            value: 1,
            pub_key_hash: alice.pub_key_hash(),
        });

        assert!(matches!(tx.output_value(), Err(TransactionError::ValueOverflow)));
    }

    #[test]
    fn test_coinbase_verifies_without_priors() {
        let tx = Transaction::coinbase(&KeyPair::generate().address(), Some("genesis")).unwrap();
        assert!(tx.verify(&HashMap::new()).unwrap());
    }

    #[test]
    fn test_id_ignores_signatures() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let prev = funded(&alice, 50);

        let mut tx = Transaction::new_transfer(&alice, &bob.address(), 20, &selection(vec![(&prev, 0)])).unwrap();
        let id = tx.id.clone();
        tx.sign(&alice, &priors(&[&prev])).unwrap();

        assert_eq!(tx.hash().unwrap(), id);
    }

    #[test]
    fn test_transfer_with_change() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let prev = funded(&alice, 100);

        let tx = Transaction::new_transfer(&alice, &bob.address(), 30, &selection(vec![(&prev, 0)])).unwrap();

        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].id, prev.id);
        assert_eq!(tx.inputs[0].out, 0);
        assert!(tx.inputs[0].signature.is_empty());
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, 30);
        assert!(tx.outputs[0].is_locked_with_key(&bob.pub_key_hash()));
        assert_eq!(tx.outputs[1].value, 70);
        assert!(tx.outputs[1].is_locked_with_key(&alice.pub_key_hash()));
    }

    #[test]
    fn test_transfer_exact_amount_has_no_change() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let prev = funded(&alice, 100);

        let tx = Transaction::new_transfer(&alice, &bob.address(), 100, &selection(vec![(&prev, 0)])).unwrap();
        assert_eq!(tx.outputs.len(), 1);
    }

    #[test]
    fn test_insufficient_funds() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let prev = funded(&alice, 10);

        let result = Transaction::new_transfer(&alice, &bob.address(), 11, &selection(vec![(&prev, 0)]));
        assert!(matches!(
            result,
            Err(TransactionError::InsufficientFunds { required: 11, available: 10 })
        ));
    }

    #[test]
    fn test_zero_amount_rejected() {
        let alice = KeyPair::generate();
        let result = Transaction::new_transfer(&alice, &alice.address(), 0, &SpendableOutputs::default());
        assert!(matches!(result, Err(TransactionError::InvalidAmount(_))));
    }

    #[test]
    fn test_sign_and_verify() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let prev = funded(&alice, 100);
        let prev_txs = priors(&[&prev]);

        let mut tx = Transaction::new_transfer(&alice, &bob.address(), 40, &selection(vec![(&prev, 0)])).unwrap();
        tx.sign(&alice, &prev_txs).unwrap();

        assert_eq!(tx.inputs[0].signature.len(), 64);
        assert!(tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_tampering_breaks_verification() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let prev = funded(&alice, 100);
        let prev_txs = priors(&[&prev]);

        let mut tx = Transaction::new_transfer(&alice, &bob.address(), 40, &selection(vec![(&prev, 0)])).unwrap();
        tx.sign(&alice, &prev_txs).unwrap();

        let mut bad_signature = tx.clone();
        bad_signature.inputs[0].signature[10] ^= 0x01;
        assert!(!bad_signature.verify(&prev_txs).unwrap());

        let mut bad_value = tx.clone();
        bad_value.outputs[0].value += 1;
        assert!(!bad_value.verify(&prev_txs).unwrap());

        let mut truncated = tx.clone();
        truncated.inputs[0].signature.pop();
        assert!(!truncated.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_wrong_signer_fails() {
        let alice = KeyPair::generate();
        let mallory = KeyPair::generate();
        let prev = funded(&alice, 100);
        let prev_txs = priors(&[&prev]);

        // mallory claims alice's output with her own key
        let mut tx = Transaction::new_transfer(&mallory, &mallory.address(), 100, &selection(vec![(&prev, 0)])).unwrap();
        tx.sign(&mallory, &prev_txs).unwrap();
        assert!(!tx.inputs[0].uses_key(&alice.pub_key_hash()));
        assert!(!tx.verify(&prev_txs).unwrap());

        // alice's key on the input but mallory's signature
        let mut forged = Transaction::new_transfer(&alice, &mallory.address(), 100, &selection(vec![(&prev, 0)])).unwrap();
        forged.sign(&mallory, &prev_txs).unwrap();
        assert!(!forged.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_every_input_is_verified() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let first = funded(&alice, 30);
        let second = funded(&alice, 40);
        let prev_txs = priors(&[&first, &second]);

        let mut tx = Transaction::new_transfer(
            &alice,
            &bob.address(),
            60,
            &selection(vec![(&first, 0), (&second, 0)]),
        )
        .unwrap();
        tx.sign(&alice, &prev_txs).unwrap();
        assert!(tx.verify(&prev_txs).unwrap());

        // a check that stopped after the first input would accept this
        tx.inputs[1].signature[0] ^= 0xff;
        assert!(!tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_digests_differ_per_input() {
        let alice = KeyPair::generate();
        let first = funded(&alice, 30);
        let second = funded(&alice, 40);
        let prev_txs = priors(&[&first, &second]);

        let mut tx = Transaction::new_transfer(
            &alice,
            &alice.address(),
            70,
            &selection(vec![(&first, 0), (&second, 0)]),
        )
        .unwrap();
        tx.sign(&alice, &prev_txs).unwrap();

        assert_ne!(tx.inputs[0].signature, tx.inputs[1].signature);

        // swapping signatures between inputs must not verify
        let first_signature = tx.inputs[0].signature.clone();
        tx.inputs[0].signature = tx.inputs[1].signature.clone();
        tx.inputs[1].signature = first_signature;
        assert!(!tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_missing_prior_transaction() {
        let alice = KeyPair::generate();
        let prev = funded(&alice, 100);

        let mut tx = Transaction::new_transfer(&alice, &alice.address(), 10, &selection(vec![(&prev, 0)])).unwrap();

        assert!(matches!(
            tx.sign(&alice, &HashMap::new()),
            Err(TransactionError::MissingPriorTransaction(_))
        ));
        assert!(matches!(
            tx.verify(&HashMap::new()),
            Err(TransactionError::MissingPriorTransaction(_))
        ));
    }

    #[test]
    fn test_invalid_output_index() {
        let alice = KeyPair::generate();
        let prev = funded(&alice, 100);
        let prev_txs = priors(&[&prev]);

        let mut tx = Transaction::new_transfer(&alice, &alice.address(), 10, &selection(vec![(&prev, 0)])).unwrap();
        tx.inputs[0].out = 5;

        assert!(matches!(
            tx.sign(&alice, &prev_txs),
            Err(TransactionError::InvalidOutputIndex { index: 5, .. })
        ));
    }

    #[test]
    fn test_display_lists_inputs_and_outputs() {
        let tx = Transaction::coinbase(&KeyPair::generate().address(), Some("hello")).unwrap();
        let text = tx.to_string();

        assert!(text.starts_with(&format!("--- Transaction {}:", hex::encode(&tx.id))));
        assert!(text.contains("Input 0:"));
        assert!(text.contains("Out:       -1"));
        assert!(text.contains("Value:  100"));
    }
}
