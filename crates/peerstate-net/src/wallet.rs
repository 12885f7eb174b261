//! Passphrase-protected node wallet
//!
//! The wallet is the node's signing gateway. The keystore on disk holds the
//! Ed25519 seed sealed with ChaCha20-Poly1305 under a key derived from the
//! passphrase (Argon2id, random salt). Signing requires an unlocked wallet.

use crate::crypto::{verify_signature, KeyPair};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use parking_lot::RwLock;
use peerstate_core::NodeAddress;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Version 1 keystores used a fast KDF and are no longer opened
const KEYSTORE_VERSION: u8 = 2;

// Argon2id cost: 19 MiB, 2 passes, 1 lane
const KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_ITERATIONS: u32 = 2;
const KDF_LANES: u32 = 1;

/// Wallet errors
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Wallet is locked")]
    Locked,
    #[error("No account in keystore {0}")]
    NoAccount(PathBuf),
    #[error("Account already exists in keystore {0}")]
    AccountExists(PathBuf),
    #[error("Wrong passphrase")]
    WrongPassphrase,
    #[error("Unsupported keystore version {0}")]
    UnsupportedVersion(u8),
    #[error("Key derivation failed")]
    KeyDerivation,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Keystore encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

/// Sign/verify capability consumed by the protocol core.
pub trait SigningGateway: Send + Sync {
    /// Whether signing is currently possible
    fn is_unlocked(&self) -> bool;

    /// Address of the signing key
    fn address(&self) -> Result<NodeAddress, WalletError>;

    /// Sign an arbitrary payload
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, WalletError>;

    /// Verify a payload against an address; needs no unlocked key
    fn verify(&self, payload: &[u8], signature: &[u8], address: &NodeAddress) -> bool {
        verify_signature(payload, signature, address)
    }
}

/// On-disk keystore
#[derive(Debug, Serialize, Deserialize)]
struct Keystore {
    version: u8,
    address: NodeAddress,
    salt: [u8; 16],
    nonce: [u8; 12],
    sealed_seed: Vec<u8>,
}

/// Node wallet backed by a keystore file
pub struct Wallet {
    keystore_path: PathBuf,
    unlocked: RwLock<Option<KeyPair>>,
}

impl Wallet {
    /// Create a locked wallet over a keystore path (the file may not exist yet)
    pub fn new(keystore_path: impl Into<PathBuf>) -> Self {
        Self {
            keystore_path: keystore_path.into(),
            unlocked: RwLock::new(None),
        }
    }

    /// Create an in-memory wallet that is already unlocked (tests, tooling)
    pub fn unlocked_with(keypair: KeyPair) -> Self {
        Self {
            keystore_path: PathBuf::new(),
            unlocked: RwLock::new(Some(keypair)),
        }
    }

    /// Keystore location
    pub fn keystore_path(&self) -> &Path {
        &self.keystore_path
    }

    /// Whether a keystore exists
    pub fn has_account(&self) -> bool {
        self.keystore_path.is_file()
    }

    /// Generate a key and seal it under `passphrase`
    pub fn create_account(&self, passphrase: &str) -> Result<NodeAddress, WalletError> {
        if self.has_account() {
            return Err(WalletError::AccountExists(self.keystore_path.clone()));
        }

        let keypair = KeyPair::generate();
        let address = keypair.address();

        let mut salt = [0u8; 16];
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let cipher = Self::cipher(passphrase, &salt)?;
        let sealed_seed = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &keypair.seed(),
                    aad: address.as_bytes(),
                },
            )
            .map_err(|_| WalletError::KeyDerivation)?;

        let keystore = Keystore {
            version: KEYSTORE_VERSION,
            address,
            salt,
            nonce,
            sealed_seed,
        };

        if let Some(parent) = self.keystore_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.keystore_path, postcard::to_allocvec(&keystore)?)?;

        info!("Created wallet account {}", address);
        Ok(address)
    }

    /// Open the keystore with `passphrase`
    pub fn unlock(&self, passphrase: &str) -> Result<NodeAddress, WalletError> {
        if !self.has_account() {
            return Err(WalletError::NoAccount(self.keystore_path.clone()));
        }

        let bytes = std::fs::read(&self.keystore_path)?;
        let keystore: Keystore = postcard::from_bytes(&bytes)?;
        if keystore.version != KEYSTORE_VERSION {
            return Err(WalletError::UnsupportedVersion(keystore.version));
        }

        let cipher = Self::cipher(passphrase, &keystore.salt)?;
        let seed = cipher
            .decrypt(
                Nonce::from_slice(&keystore.nonce),
                Payload {
                    msg: &keystore.sealed_seed,
                    aad: keystore.address.as_bytes(),
                },
            )
            .map_err(|_| WalletError::WrongPassphrase)?;

        let seed: [u8; 32] = seed
            .as_slice()
            .try_into()
            .map_err(|_| WalletError::WrongPassphrase)?;
        let keypair = KeyPair::from_seed(&seed);
        if keypair.address() != keystore.address {
            return Err(WalletError::WrongPassphrase);
        }

        *self.unlocked.write() = Some(keypair);
        debug!("Wallet {} unlocked", keystore.address);
        Ok(keystore.address)
    }

    /// Drop the unlocked key from memory
    pub fn lock(&self) {
        *self.unlocked.write() = None;
    }

    /// Derive the sealing key from the passphrase with memory-hard Argon2id
    fn cipher(passphrase: &str, salt: &[u8; 16]) -> Result<ChaCha20Poly1305, WalletError> {
        let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, KDF_LANES, Some(32))
            .map_err(|_| WalletError::KeyDerivation)?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; 32];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|_| WalletError::KeyDerivation)?;
        ChaCha20Poly1305::new_from_slice(&key).map_err(|_| WalletError::KeyDerivation)
    }
}

impl SigningGateway for Wallet {
    fn is_unlocked(&self) -> bool {
        self.unlocked.read().is_some()
    }

    fn address(&self) -> Result<NodeAddress, WalletError> {
        self.unlocked
            .read()
            .as_ref()
            .map(KeyPair::address)
            .ok_or(WalletError::Locked)
    }

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, WalletError> {
        self.unlocked
            .read()
            .as_ref()
            .map(|kp| kp.sign(payload).to_vec())
            .ok_or(WalletError::Locked)
    }
}
