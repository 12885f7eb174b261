//! Boundary operations
//!
//! [`Gateway`] is what the daemon's wire server (and any outer HTTP or CLI
//! layer) talks to. Not-found reads return `None` or an empty collection,
//! never an error.

use crate::content::{ContentError, ContentStore};
use crate::diff::DiffResolver;
use crate::gossip::{GossipConfig, GossipError, GossipPropagator, PushOutcome, PushSource};
use crate::membership::MembershipTable;
use crate::state_store::{StateError, StateStore};
use crate::storage::Storage;
use peerstate_core::*;
use peerstate_net::{PeerClient, SigningGateway, WalletError};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Boundary errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gossip(#[from] GossipError),
    #[error("State error: {0}")]
    State(#[from] StateError),
    #[error("Content error: {0}")]
    Content(#[from] ContentError),
    #[error("Wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("Debug state override is disabled")]
    DebugDisabled,
    #[error("Record for {sender} cannot be stored under {address}")]
    AddressMismatch {
        address: NodeAddress,
        sender: NodeAddress,
    },
}

/// Capability to overwrite state records without verification.
///
/// Only constructed when the node runs with the debug override enabled.
#[derive(Debug)]
pub struct DebugStateOverride(());

impl DebugStateOverride {
    fn enable() -> Self {
        warn!("DEBUG STATE OVERRIDE ENABLED: unsigned state writes are accepted");
        DebugStateOverride(())
    }
}

/// Settings for [`Gateway::open`]
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gossip: GossipConfig,
    pub max_diff_visits: usize,
    pub debug_state_override: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gossip: GossipConfig::default(),
            max_diff_visits: 100_000,
            debug_state_override: false,
        }
    }
}

/// Facade over the protocol core
pub struct Gateway {
    signer: Arc<dyn SigningGateway>,
    state: Arc<StateStore>,
    content: Arc<ContentStore>,
    resolver: DiffResolver,
    membership: Arc<MembershipTable>,
    gossip: Arc<GossipPropagator>,
    debug_override: Option<DebugStateOverride>,
}

impl Gateway {
    /// Wire all components over one storage handle
    pub fn open(
        storage: Arc<Storage>,
        signer: Arc<dyn SigningGateway>,
        client: Arc<dyn PeerClient>,
        advertise: impl Into<String>,
        config: GatewayConfig,
    ) -> Self {
        let state = Arc::new(StateStore::new(storage.clone(), signer.clone()));
        let content = Arc::new(ContentStore::new(storage));
        let resolver = DiffResolver::new(config.max_diff_visits);
        let membership = Arc::new(MembershipTable::new());
        let gossip = Arc::new(GossipPropagator::new(
            signer.clone(),
            state.clone(),
            content.clone(),
            resolver.clone(),
            membership.clone(),
            client,
            advertise,
            config.gossip,
        ));

        Self {
            signer,
            state,
            content,
            resolver,
            membership,
            gossip,
            debug_override: config
                .debug_state_override
                .then(DebugStateOverride::enable),
        }
    }

    pub fn gossip(&self) -> &Arc<GossipPropagator> {
        &self.gossip
    }

    pub fn membership(&self) -> &MembershipTable {
        &self.membership
    }

    // Signing

    pub fn sign_message(&self, payload: &[u8]) -> Result<Vec<u8>, ApiError> {
        Ok(self.signer.sign(payload)?)
    }

    pub fn verify_signed_message(
        &self,
        payload: &[u8],
        signature: &[u8],
        address: &NodeAddress,
    ) -> bool {
        self.signer.verify(payload, signature, address)
    }

    pub fn wallet_unlocked(&self) -> bool {
        self.signer.is_unlocked()
    }

    // Membership

    pub async fn join(&self, address: NodeAddress, endpoint: &str) -> Result<(), ApiError> {
        self.gossip.join(address, endpoint).await?;
        Ok(())
    }

    pub async fn join_endpoint(&self, endpoint: &str) -> Result<NodeAddress, ApiError> {
        Ok(self.gossip.join_endpoint(endpoint).await?)
    }

    pub async fn leave(&self, address: &NodeAddress) -> Result<(), ApiError> {
        self.gossip.leave(address).await?;
        Ok(())
    }

    pub fn active_peers(&self) -> Vec<PeerRecord> {
        self.membership.active_peers().to_vec()
    }

    // State

    pub async fn push_state(
        &self,
        message: StateMessage,
        claimed_known: &[ContentHash],
        source: PushSource,
    ) -> Result<PushOutcome, ApiError> {
        Ok(self
            .gossip
            .handle_push(message, claimed_known, source)
            .await?)
    }

    pub fn get_full_state(&self) -> Result<FullStateView, ApiError> {
        Ok(self.state.full_view()?)
    }

    pub fn get_node_state(&self, address: &NodeAddress) -> Result<Option<NodeStateRecord>, ApiError> {
        Ok(self.state.get(address)?)
    }

    pub fn get_signature_list(
        &self,
        address: &NodeAddress,
    ) -> Result<Vec<SignatureLedgerEntry>, ApiError> {
        Ok(self.state.signatures(address)?)
    }

    pub fn get_all_signatures(&self) -> Result<Vec<SignatureLedgerEntry>, ApiError> {
        Ok(self.state.all_signatures()?)
    }

    /// Signed messages of the full view, for peers
    pub fn state_messages(&self) -> Result<Vec<StateMessage>, ApiError> {
        Ok(self.state.messages()?)
    }

    /// Sign and announce a new root for this node
    pub async fn publish_state(&self, root: ContentHash) -> Result<StateMessage, ApiError> {
        Ok(self.gossip.publish(root).await?)
    }

    /// Direct record overwrite, bypassing verification and the ledger
    pub fn set_state(&self, address: NodeAddress, record: NodeStateRecord) -> Result<(), ApiError> {
        let Some(_override) = self.debug_override.as_ref() else {
            return Err(ApiError::DebugDisabled);
        };
        if record.message.sender != address {
            return Err(ApiError::AddressMismatch {
                address,
                sender: record.message.sender,
            });
        }
        warn!(
            "Overriding state of {} to seq {} without verification",
            address,
            record.sequence()
        );
        self.state.override_record(&record)?;
        Ok(())
    }

    // Content

    pub fn get_content_needed(
        &self,
        target: ContentHash,
        known: &HashSet<ContentHash>,
    ) -> Result<HashSet<ContentHash>, ApiError> {
        Ok(self.resolver.missing(self.content.as_ref(), target, known)?)
    }

    pub fn get_content_links(&self, hash: &ContentHash) -> Result<Option<Vec<ContentHash>>, ApiError> {
        Ok(self.content.children(hash)?)
    }

    pub fn get_content(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, ApiError> {
        Ok(self.content.get(hash)?)
    }

    pub fn get_block(&self, hash: &ContentHash) -> Result<Option<ContentBlock>, ApiError> {
        Ok(self.content.block(hash)?)
    }

    /// Store a local block; with children it becomes an interior DAG node
    pub fn put_content(&self, bytes: &[u8], children: Vec<ContentHash>) -> Result<ContentHash, ApiError> {
        let hash = if children.is_empty() {
            self.content.put(bytes)?
        } else {
            self.content.put_linked(bytes, children)?
        };
        Ok(hash)
    }
}
