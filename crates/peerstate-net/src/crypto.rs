//! Ed25519 identity keys and signature verification
//!
//! A node's [`NodeAddress`] is its verifying key, so any signature can be
//! checked against an address without a key directory.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use peerstate_core::NodeAddress;
use rand::rngs::OsRng;
use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Invalid signature length: {0}")]
    InvalidSignatureLength(usize),
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
}

/// Ed25519 keypair for signing and identity
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from seed bytes (for deterministic testing and keystore recovery)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self { signing_key }
    }

    /// Secret seed bytes
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Address derived from the public key
    pub fn address(&self) -> NodeAddress {
        NodeAddress(self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Verify a signature
    pub fn verify(
        public_key: &[u8; 32],
        message: &[u8],
        signature: &[u8],
    ) -> Result<(), CryptoError> {
        let verifying_key = VerifyingKey::from_bytes(public_key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| CryptoError::InvalidSignatureLength(signature.len()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::SignatureVerificationFailed)
    }
}

/// Check `signature` over `payload` against the key behind `address`.
pub fn verify_signature(payload: &[u8], signature: &[u8], address: &NodeAddress) -> bool {
    KeyPair::verify(address.as_bytes(), payload, signature).is_ok()
}
