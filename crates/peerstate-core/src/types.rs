//! Core protocol types for peerstate
//!
//! All types here are designed for deterministic serialization via postcard.
//! Field order matters for canonical encoding.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// 32-byte fixed-size array used for hashes and identifiers.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES (newtypes for type safety)
// =============================================================================

/// Node address: the node's Ed25519 verifying key.
///
/// Keys membership, state and ledger lookups. Renders as `0x`-prefixed hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress(pub Bytes32);

impl NodeAddress {
    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }

    /// Short form for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress(0x{})", self.short())
    }
}

impl FromStr for NodeAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        let bytes = hex::decode(digits).map_err(|e| Error::InvalidAddress(e.to_string()))?;
        let arr: Bytes32 = bytes
            .try_into()
            .map_err(|_| Error::InvalidAddress(format!("expected 32 bytes: {s}")))?;
        Ok(Self(arr))
    }
}

/// Content address: BLAKE3("block" || bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(pub Bytes32);

impl ContentHash {
    /// Get as bytes
    pub fn as_bytes(&self) -> &Bytes32 {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", hex::encode(&self.0[..6]))
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidHash(e.to_string()))?;
        let arr: Bytes32 = bytes
            .try_into()
            .map_err(|_| Error::InvalidHash(format!("expected 32 bytes: {s}")))?;
        Ok(Self(arr))
    }
}

// =============================================================================
// STATE MESSAGES
// =============================================================================

/// A signed state announcement. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMessage {
    pub sender: NodeAddress,
    /// Strictly increasing per sender
    pub sequence: u64,
    /// Root of the sender's state DAG
    pub root_hash: ContentHash,
    /// Ed25519 signature over `state_sign_bytes(sender, sequence, root_hash)`
    pub signature: Vec<u8>,
}

/// Latest accepted message for a node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStateRecord {
    pub message: StateMessage,
    /// Unix millis at acceptance
    pub accepted_at: u64,
}

impl NodeStateRecord {
    pub fn new(message: StateMessage, accepted_at: u64) -> Self {
        Self {
            message,
            accepted_at,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.message.sequence
    }

    pub fn root_hash(&self) -> ContentHash {
        self.message.root_hash
    }
}

/// Append-only audit entry, one per accepted message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureLedgerEntry {
    pub node: NodeAddress,
    pub sequence: u64,
    pub signature: Vec<u8>,
    /// Unix millis at acceptance
    pub accepted_at: u64,
}

impl SignatureLedgerEntry {
    pub fn from_message(message: &StateMessage, accepted_at: u64) -> Self {
        Self {
            node: message.sender,
            sequence: message.sequence,
            signature: message.signature.clone(),
            accepted_at,
        }
    }
}

/// Snapshot of every known node's record.
pub type FullStateView = BTreeMap<NodeAddress, NodeStateRecord>;

// =============================================================================
// CONTENT
// =============================================================================

/// A content-addressed block with its declared child links.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub hash: ContentHash,
    pub bytes: Vec<u8>,
    /// MUST be sorted and deduped
    pub children: Vec<ContentHash>,
}

// =============================================================================
// MEMBERSHIP
// =============================================================================

/// Peer lifecycle. Transitions are the only mutation path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Joining,
    Active,
    Leaving,
    Removed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Leaving => "leaving",
            Self::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A known peer and how to reach it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: NodeAddress,
    /// `host:port` the peer accepts protocol connections on
    pub endpoint: String,
    pub lifecycle: LifecycleState,
}

/// Current unix time in milliseconds.
pub fn unix_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
