use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Version byte prepended to the public key hash before check-encoding
pub const ADDRESS_VERSION: u8 = 0x00;

/// Length of a RIPEMD-160 public key hash
pub const PUB_KEY_HASH_LEN: usize = 20;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Hashes a raw public key into the ownership hash used to lock outputs
///
/// The hash is RIPEMD-160 over the SHA-256 of the key bytes.
pub fn pub_key_hash(pub_key: &[u8]) -> Vec<u8> {
    let sha = Sha256::digest(pub_key);
    Ripemd160::digest(sha).to_vec()
}

/// Represents a wallet address (check-encoded public key hash)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Creates an address from an ownership hash
    pub fn from_pub_key_hash(pub_key_hash: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(pub_key_hash.len() + 1);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(pub_key_hash);

        Address(bs58::encode(payload).with_check().into_string())
    }

    /// Creates an address from a raw public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self::from_pub_key_hash(&pub_key_hash(public_key))
    }

    /// Decodes the address back into the ownership hash it locks to
    pub fn pub_key_hash(&self) -> Result<Vec<u8>, CryptoError> {
        let decoded = bs58::decode(&self.0)
            .with_check(Some(ADDRESS_VERSION))
            .into_vec()
            .map_err(|e| CryptoError::InvalidAddress(format!("{}: {}", self.0, e)))?;

        // first byte is the version, checked above
        let hash = decoded.get(1..).map(<[u8]>::to_vec).unwrap_or_default();
        if hash.len() != PUB_KEY_HASH_LEN {
            return Err(CryptoError::InvalidAddress(format!(
                "{}: expected {} hash bytes, got {}",
                self.0,
                PUB_KEY_HASH_LEN,
                hash.len()
            )));
        }

        Ok(hash)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        address.pub_key_hash()?;
        Ok(address)
    }
}

/// Checks the version byte, checksum and hash length of an address
pub fn validate_address(address: &str) -> bool {
    Address::from_str(address).is_ok()
}

/// An ed25519 keypair owned by a wallet
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Creates a new random keypair
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        let verifying_key = VerifyingKey::from(&signing_key);

        KeyPair {
            signing_key,
            verifying_key,
        }
    }

    /// Restores a keypair from its secret key bytes
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        let signing_key = SigningKey::from_bytes(&bytes_array);
        let verifying_key = VerifyingKey::from(&signing_key);

        Ok(KeyPair {
            signing_key,
            verifying_key,
        })
    }

    /// Raw public key bytes, as carried in transaction inputs
    pub fn public_key(&self) -> Vec<u8> {
        self.verifying_key.as_bytes().to_vec()
    }

    pub fn pub_key_hash(&self) -> Vec<u8> {
        pub_key_hash(self.verifying_key.as_bytes())
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self.verifying_key.as_bytes())
    }

    /// Signs a digest with the private key
    pub fn sign(&self, digest: &[u8]) -> Vec<u8> {
        self.signing_key.sign(digest).to_bytes().to_vec()
    }

    /// Exports the secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

/// Verifies a signature against a digest and a raw public key
pub fn verify_signature(
    digest: &[u8],
    signature: &[u8],
    public_key: &[u8],
) -> Result<bool, CryptoError> {
    let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
        CryptoError::InvalidPublicKey(format!("expected 32 bytes, got {}", public_key.len()))
    })?;
    let public_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    let signature_bytes: [u8; 64] = signature.try_into().map_err(|_| {
        CryptoError::InvalidSignature("Invalid signature length".to_string())
    })?;
    let signature = Signature::from_bytes(&signature_bytes);

    match public_key.verify(digest, &signature) {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}
