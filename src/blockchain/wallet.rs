use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::crypto::{Address, CryptoError, KeyPair};

/// Errors that can occur while loading or saving wallets
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid wallet file: {0}")]
    FormatError(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("No wallet for address {0}")]
    NotFound(String),

    #[error("Stored public key does not match private key for {0}")]
    KeyMismatch(String),
}

/// On-disk form of one keypair
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredKeyPair {
    private_key: String,
    public_key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WalletFile {
    wallets: BTreeMap<String, StoredKeyPair>,
}

/// The set of keypairs owned by this node, keyed by address
#[derive(Debug)]
pub struct Wallets {
    path: PathBuf,
    wallets: BTreeMap<String, KeyPair>,
}

impl Wallets {
    /// Loads wallets from `path`; a missing file means no wallets yet
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, WalletError> {
        let path = path.as_ref().to_path_buf();
        let mut wallets = BTreeMap::new();

        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let file: WalletFile = if content.trim().is_empty() {
                WalletFile::default()
            } else {
                serde_json::from_str(&content)?
            };

            for (address, stored) in file.wallets {
                let secret = hex::decode(&stored.private_key)
                    .map_err(|e| CryptoError::DecodingError(e.to_string()))?;
                let keys = KeyPair::from_secret_key(&secret)?;

                if hex::encode(keys.public_key()) != stored.public_key || keys.address().0 != address {
                    return Err(WalletError::KeyMismatch(address));
                }
                wallets.insert(address, keys);
            }

            debug!("Loaded {} wallets from {}", wallets.len(), path.display());
        }

        Ok(Wallets { path, wallets })
    }

    /// Generates a new keypair and returns its address
    pub fn add_wallet(&mut self) -> Address {
        let keys = KeyPair::generate();
        let address = keys.address();

        self.wallets.insert(address.0.clone(), keys);
        info!("Created wallet {}", address);

        address
    }

    /// Gets the keys for an address
    pub fn get_wallet(&self, address: &str) -> Result<&KeyPair, WalletError> {
        self.wallets
            .get(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))
    }

    /// All known addresses, sorted
    pub fn addresses(&self) -> Vec<String> {
        self.wallets.keys().cloned().collect()
    }

    /// Writes every wallet back to the file it was loaded from
    pub fn save(&self) -> Result<(), WalletError> {
        let file = WalletFile {
            wallets: self
                .wallets
                .iter()
                .map(|(address, keys)| {
                    let stored = StoredKeyPair {
                        private_key: hex::encode(keys.export_secret_key()),
                        public_key: hex::encode(keys.public_key()),
                    };
                    (address.clone(), stored)
                })
                .collect(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;

        Ok(())
    }
}
