//! Per-node state records and the signature ledger

use crate::storage::{CommitOutcome, Storage, StorageError};
use peerstate_core::*;
use peerstate_net::SigningGateway;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// State store errors
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Outcome of [`StateStore::merge`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Accepted,
    /// Sequence not above the stored one; ignored
    Stale { current: u64 },
    InvalidSignature,
}

/// A message whose signature has been checked against its sender.
///
/// Only [`StateStore::verify`] constructs one.
#[derive(Debug, Clone)]
pub struct VerifiedMessage(StateMessage);

impl VerifiedMessage {
    pub fn message(&self) -> &StateMessage {
        &self.0
    }

    pub fn into_inner(self) -> StateMessage {
        self.0
    }
}

/// Record store keyed by node address, plus the append-only ledger.
///
/// Updates for one address are serialized by a storage-level
/// compare-and-swap on the sequence; different addresses never contend.
pub struct StateStore {
    storage: Arc<Storage>,
    gateway: Arc<dyn SigningGateway>,
}

impl StateStore {
    pub fn new(storage: Arc<Storage>, gateway: Arc<dyn SigningGateway>) -> Self {
        Self { storage, gateway }
    }

    /// Check the sender's signature
    pub fn verify(&self, message: StateMessage) -> Option<VerifiedMessage> {
        let payload = message.sign_bytes();
        if self
            .gateway
            .verify(&payload, &message.signature, &message.sender)
        {
            Some(VerifiedMessage(message))
        } else {
            None
        }
    }

    /// Verify and merge a message that references no new content
    pub fn merge(&self, message: StateMessage) -> Result<MergeOutcome, StateError> {
        let sender = message.sender;
        match self.verify(message) {
            Some(verified) => self.commit(&verified, &[]),
            None => {
                warn!("Rejected state for {}: invalid signature", sender);
                Ok(MergeOutcome::InvalidSignature)
            }
        }
    }

    /// Commit a verified message together with the blocks it needs
    pub fn commit(
        &self,
        verified: &VerifiedMessage,
        blocks: &[ContentBlock],
    ) -> Result<MergeOutcome, StateError> {
        let message = verified.message();
        match self
            .storage
            .commit_state(message, blocks, unix_millis())?
        {
            CommitOutcome::Committed { previous } => {
                info!(
                    "Accepted state {} seq {} (was {:?}, {} new blocks)",
                    message.sender,
                    message.sequence,
                    previous,
                    blocks.len()
                );
                Ok(MergeOutcome::Accepted)
            }
            CommitOutcome::Stale { current } => {
                debug!(
                    "Stale state {} seq {} (have {})",
                    message.sender, message.sequence, current
                );
                Ok(MergeOutcome::Stale { current })
            }
        }
    }

    /// Current sequence if `message` would be stale against it
    pub fn stale_against(&self, message: &StateMessage) -> Result<Option<u64>, StateError> {
        Ok(self
            .storage
            .get_state(&message.sender)?
            .map(|r| r.sequence())
            .filter(|current| *current >= message.sequence))
    }

    pub fn get(&self, address: &NodeAddress) -> Result<Option<NodeStateRecord>, StateError> {
        Ok(self.storage.get_state(address)?)
    }

    /// Snapshot of every record
    pub fn full_view(&self) -> Result<FullStateView, StateError> {
        Ok(self.storage.all_states()?)
    }

    /// Signed messages of every record, as pushed to peers
    pub fn messages(&self) -> Result<Vec<StateMessage>, StateError> {
        Ok(self
            .full_view()?
            .into_values()
            .map(|r| r.message)
            .collect())
    }

    /// Ledger entries for one node in acceptance order
    pub fn signatures(&self, address: &NodeAddress) -> Result<Vec<SignatureLedgerEntry>, StateError> {
        Ok(self.storage.signatures(address)?)
    }

    pub fn all_signatures(&self) -> Result<Vec<SignatureLedgerEntry>, StateError> {
        Ok(self.storage.all_signatures()?)
    }

    /// Next sequence number for a locally published message
    pub fn next_sequence(&self, address: &NodeAddress) -> Result<u64, StateError> {
        Ok(self
            .storage
            .get_state(address)?
            .map(|r| r.sequence() + 1)
            .unwrap_or(1))
    }

    /// Replace a record without verification. Debug override only.
    pub(crate) fn override_record(&self, record: &NodeStateRecord) -> Result<(), StateError> {
        self.storage.override_state(record)?;
        Ok(())
    }
}
