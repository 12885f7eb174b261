//! Hash derivations and signing payloads for peerstate
//!
//! All hash derivations use BLAKE3 with domain separation prefixes.
//! This module provides the normative implementations.

use crate::canonical::validate_children_sorted;
use crate::error::{Error, Result};
use crate::types::*;
use blake3::Hasher;

// =============================================================================
// DOMAIN SEPARATION PREFIXES
// =============================================================================

/// Domain prefix for content addresses
pub const DOMAIN_BLOCK: &[u8] = b"block";
/// Domain prefix for state message signatures
pub const DOMAIN_STATE_MSG: &[u8] = b"state-msg";
/// Domain prefix for membership join requests
pub const DOMAIN_JOIN: &[u8] = b"join";
/// Domain prefix for membership leave requests
pub const DOMAIN_LEAVE: &[u8] = b"leave";

// =============================================================================
// CONTENT ADDRESSING
// =============================================================================

/// Derive the content address of a block.
///
/// `ContentHash = BLAKE3("block" || bytes)`
pub fn content_hash(bytes: &[u8]) -> ContentHash {
    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_BLOCK);
    hasher.update(bytes);
    ContentHash(*hasher.finalize().as_bytes())
}

/// Verify that bytes hash to the address they were requested under.
pub fn verify_content_hash(expected: &ContentHash, bytes: &[u8]) -> Result<()> {
    let computed = content_hash(bytes);
    if computed != *expected {
        return Err(Error::HashMismatch {
            computed: computed.to_string(),
            transmitted: expected.to_string(),
        });
    }
    Ok(())
}

/// Verify a block received from a peer: address and link ordering.
pub fn verify_block(block: &ContentBlock) -> Result<()> {
    verify_content_hash(&block.hash, &block.bytes)?;
    validate_children_sorted(&block.children)
}

// =============================================================================
// STATE MESSAGE SIGNING
// =============================================================================

/// Compute the bytes a sender signs for a state message.
///
/// `sign_bytes = "state-msg" || sender || sequence_le || root_hash`
pub fn state_sign_bytes(sender: &NodeAddress, sequence: u64, root_hash: &ContentHash) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_STATE_MSG.len() + 32 + 8 + 32);
    bytes.extend_from_slice(DOMAIN_STATE_MSG);
    bytes.extend_from_slice(&sender.0);
    bytes.extend_from_slice(&sequence.to_le_bytes());
    bytes.extend_from_slice(&root_hash.0);
    bytes
}

impl StateMessage {
    /// The payload covered by `signature`.
    pub fn sign_bytes(&self) -> Vec<u8> {
        state_sign_bytes(&self.sender, self.sequence, &self.root_hash)
    }
}

// =============================================================================
// MEMBERSHIP SIGNING
// =============================================================================

/// Bytes a peer signs to ask for admission.
///
/// `join_bytes = "join" || address || issued_at_le || endpoint`
pub fn join_sign_bytes(address: &NodeAddress, issued_at: u64, endpoint: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_JOIN.len() + 32 + 8 + endpoint.len());
    bytes.extend_from_slice(DOMAIN_JOIN);
    bytes.extend_from_slice(&address.0);
    bytes.extend_from_slice(&issued_at.to_le_bytes());
    bytes.extend_from_slice(endpoint.as_bytes());
    bytes
}

/// Bytes a peer signs to announce its own departure.
///
/// `leave_bytes = "leave" || address || issued_at_le`
pub fn leave_sign_bytes(address: &NodeAddress, issued_at: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(DOMAIN_LEAVE.len() + 32 + 8);
    bytes.extend_from_slice(DOMAIN_LEAVE);
    bytes.extend_from_slice(&address.0);
    bytes.extend_from_slice(&issued_at.to_le_bytes());
    bytes
}
