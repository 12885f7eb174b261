//! Gossip propagation
//!
//! Every inbound push runs `verify -> stale check -> resolve content ->
//! commit -> reannounce`. Fetched blocks are staged in memory and only reach
//! storage in the same transaction that replaces the state record, so an
//! abandoned or failed push leaves nothing behind.

use crate::content::{ContentError, ContentStore};
use crate::diff::{DiffResolver, LinkSource};
use crate::membership::{MembershipError, MembershipTable};
use crate::state_store::{MergeOutcome, StateError, StateStore};
use peerstate_core::crypto::{join_sign_bytes, leave_sign_bytes, state_sign_bytes, verify_block};
use peerstate_core::*;
use peerstate_net::messages::{Hello, JoinAck, JoinRequest, LeaveRequest, PushRequest, PushResult};
use peerstate_net::{PeerClient, SigningGateway, TransportError, WalletError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Attempts at publishing before giving up on a racing local writer
const PUBLISH_ATTEMPTS: usize = 3;

/// Signed Join/Leave requests older or newer than this are refused
const MEMBERSHIP_REQUEST_WINDOW_MS: u64 = 5 * 60 * 1000;

/// Gossip errors
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("Invalid signature from {sender}")]
    InvalidSignature { sender: NodeAddress },
    #[error("Request from {sender} issued at {issued_at} is outside the accepted window")]
    RequestExpired { sender: NodeAddress, issued_at: u64 },
    #[error("Content {hash} unreachable: {reason}")]
    ContentUnreachable { hash: ContentHash, reason: String },
    #[error("Content {0} is not stored locally")]
    UnknownContent(ContentHash),
    #[error("DAG under {0} exceeds the traversal limit")]
    TraversalLimit(ContentHash),
    #[error("Wallet is locked")]
    WalletLocked,
    #[error("Peer at {endpoint} answered as {got}, expected {expected}")]
    AddressMismatch {
        endpoint: String,
        expected: NodeAddress,
        got: NodeAddress,
    },
    #[error("Publish for {0} kept losing to concurrent writers")]
    PublishContended(NodeAddress),
    #[error("State error: {0}")]
    State(#[from] StateError),
    #[error("Content error: {0}")]
    Content(#[from] ContentError),
    #[error("Membership error: {0}")]
    Membership(#[from] MembershipError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Wallet error: {0}")]
    Wallet(WalletError),
}

impl From<WalletError> for GossipError {
    fn from(err: WalletError) -> Self {
        match err {
            WalletError::Locked => GossipError::WalletLocked,
            other => GossipError::Wallet(other),
        }
    }
}

impl GossipError {
    /// Whether resending the same message later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GossipError::ContentUnreachable { .. }
                | GossipError::Transport(_)
                | GossipError::PublishContended(_)
        )
    }
}

/// Result of a push that was not rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Record replaced; `fetched` blocks were pulled from the source
    Accepted { fetched: usize },
    /// Already at or past this sequence; nothing changed
    Stale { current: u64 },
}

/// Wire form of a push outcome
pub fn push_result(result: &Result<PushOutcome, GossipError>) -> PushResult {
    match result {
        Ok(PushOutcome::Accepted { fetched }) => PushResult::Accepted {
            fetched: *fetched as u32,
        },
        Ok(PushOutcome::Stale { .. }) => PushResult::Stale,
        Err(e) => PushResult::Rejected {
            reason: e.to_string(),
            retryable: e.is_retryable(),
        },
    }
}

/// Where a pushed message came from
#[derive(Debug, Clone, Default)]
pub struct PushSource {
    /// Peer that handed us the message, excluded from reannounce
    pub address: Option<NodeAddress>,
    /// Endpoint serving the referenced content
    pub endpoint: Option<String>,
}

impl PushSource {
    pub fn peer(address: NodeAddress, endpoint: impl Into<String>) -> Self {
        Self {
            address: Some(address),
            endpoint: Some(endpoint.into()),
        }
    }
}

/// Gossip settings
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Bound on each block fetch
    pub fetch_timeout: Duration,
    /// DAG levels fetched before a push is abandoned
    pub max_fetch_rounds: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(5),
            max_fetch_rounds: 64,
        }
    }
}

/// Fetched blocks layered over the local store
struct StagedContent<'a> {
    store: &'a ContentStore,
    staged: HashMap<ContentHash, ContentBlock>,
}

impl LinkSource for StagedContent<'_> {
    fn links_of(&self, hash: &ContentHash) -> Result<Option<Vec<ContentHash>>, ContentError> {
        match self.staged.get(hash) {
            Some(block) => Ok(Some(block.children.clone())),
            None => self.store.children(hash),
        }
    }
}

/// Gossip propagator
pub struct GossipPropagator {
    signer: Arc<dyn SigningGateway>,
    state: Arc<StateStore>,
    content: Arc<ContentStore>,
    resolver: DiffResolver,
    membership: Arc<MembershipTable>,
    client: Arc<dyn PeerClient>,
    /// Endpoint peers use to reach us
    advertise: String,
    config: GossipConfig,
}

impl GossipPropagator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        signer: Arc<dyn SigningGateway>,
        state: Arc<StateStore>,
        content: Arc<ContentStore>,
        resolver: DiffResolver,
        membership: Arc<MembershipTable>,
        client: Arc<dyn PeerClient>,
        advertise: impl Into<String>,
        config: GossipConfig,
    ) -> Self {
        Self {
            signer,
            state,
            content,
            resolver,
            membership,
            client,
            advertise: advertise.into(),
            config,
        }
    }

    pub fn advertise(&self) -> &str {
        &self.advertise
    }

    /// Our identity as sent in handshakes
    pub fn local_hello(&self) -> Result<Hello, GossipError> {
        Ok(Hello {
            address: self.signer.address()?,
            endpoint: self.advertise.clone(),
        })
    }

    // =========================================================================
    // INBOUND PUSH
    // =========================================================================

    /// Verify, resolve and merge a pushed state message.
    ///
    /// `claimed_known` lists hashes the pusher asserts we already hold. The
    /// claim is never trusted: every block under the root must be stored or
    /// fetched before the record is committed.
    pub async fn handle_push(
        &self,
        message: StateMessage,
        claimed_known: &[ContentHash],
        source: PushSource,
    ) -> Result<PushOutcome, GossipError> {
        let sender = message.sender;
        let Some(verified) = self.state.verify(message) else {
            warn!("Rejected push from {}: invalid signature", sender);
            return Err(GossipError::InvalidSignature { sender });
        };

        if let Some(current) = self.state.stale_against(verified.message())? {
            debug!(
                "Ignoring stale push {} seq {} (have {})",
                sender,
                verified.message().sequence,
                current
            );
            return Ok(PushOutcome::Stale { current });
        }

        let endpoint = source.endpoint.clone().or_else(|| {
            self.membership
                .get(&sender)
                .map(|record| record.endpoint)
        });
        let blocks = self
            .resolve_content(verified.message().root_hash, claimed_known, endpoint.as_deref())
            .await?;
        let fetched = blocks.len();

        match self.state.commit(&verified, &blocks)? {
            MergeOutcome::Accepted => {
                let mut exclude = vec![sender];
                exclude.extend(source.address);
                self.reannounce(verified.message(), &exclude);
                Ok(PushOutcome::Accepted { fetched })
            }
            MergeOutcome::Stale { current } => Ok(PushOutcome::Stale { current }),
            MergeOutcome::InvalidSignature => Err(GossipError::InvalidSignature { sender }),
        }
    }

    /// Fetch every block reachable from `root` that is not stored locally,
    /// one DAG level per round.
    ///
    /// A stored block does not imply a stored subtree (links may dangle), so
    /// the walk never prunes and expands stored blocks through their links.
    async fn resolve_content(
        &self,
        root: ContentHash,
        claimed_known: &[ContentHash],
        endpoint: Option<&str>,
    ) -> Result<Vec<ContentBlock>, GossipError> {
        let claimed: HashSet<ContentHash> = claimed_known.iter().copied().collect();
        let mut overlay = StagedContent {
            store: &self.content,
            staged: HashMap::new(),
        };

        for round in 0..self.config.max_fetch_rounds {
            let diff = self.resolver.diff_where(&overlay, root, |_| Ok(false))?;
            if diff.truncated {
                return Err(GossipError::ContentUnreachable {
                    hash: root,
                    reason: "DAG exceeds traversal limit".into(),
                });
            }

            let mut wanted = Vec::new();
            for hash in diff.missing {
                if overlay.staged.contains_key(&hash) || self.content.has(&hash)? {
                    continue;
                }
                wanted.push(hash);
            }
            if wanted.is_empty() {
                return Ok(overlay.staged.into_values().collect());
            }

            let unbacked = wanted.iter().filter(|h| claimed.contains(*h)).count();
            if unbacked > 0 {
                debug!("{} blocks claimed known for {} are not stored here", unbacked, root);
            }

            let Some(endpoint) = endpoint else {
                return Err(GossipError::ContentUnreachable {
                    hash: wanted[0],
                    reason: "no peer to fetch from".into(),
                });
            };
            debug!(
                "Round {}: fetching {} blocks for {} from {}",
                round,
                wanted.len(),
                root,
                endpoint
            );
            for block in self.fetch_level(root, endpoint, wanted).await? {
                overlay.staged.insert(block.hash, block);
            }
        }

        Err(GossipError::ContentUnreachable {
            hash: root,
            reason: format!("not resolved after {} rounds", self.config.max_fetch_rounds),
        })
    }

    /// Fetch one level concurrently. Dropping the future aborts the fetches.
    async fn fetch_level(
        &self,
        root: ContentHash,
        endpoint: &str,
        hashes: Vec<ContentHash>,
    ) -> Result<Vec<ContentBlock>, GossipError> {
        let mut tasks = JoinSet::new();
        for hash in hashes {
            let client = self.client.clone();
            let endpoint = endpoint.to_string();
            let limit = self.config.fetch_timeout;
            tasks.spawn(async move {
                let result = timeout(limit, client.fetch_block(&endpoint, hash)).await;
                (hash, result)
            });
        }

        let mut blocks = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (hash, result) = joined.map_err(|e| GossipError::ContentUnreachable {
                hash: root,
                reason: format!("fetch task failed: {}", e),
            })?;
            let unreachable = |reason: String| GossipError::ContentUnreachable { hash, reason };

            let block = match result {
                Err(_) => return Err(unreachable("fetch timed out".into())),
                Ok(Err(e)) => return Err(unreachable(e.to_string())),
                Ok(Ok(None)) => return Err(unreachable("peer does not hold it".into())),
                Ok(Ok(Some(block))) => block,
            };
            if block.hash != hash {
                return Err(unreachable(format!("peer answered with {}", block.hash)));
            }
            verify_block(&block).map_err(|e| unreachable(e.to_string()))?;
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Fire-and-forget fan-out to Active peers, skipping `exclude` and self.
    ///
    /// Returns the number of pushes started.
    pub fn reannounce(&self, message: &StateMessage, exclude: &[NodeAddress]) -> usize {
        let relayer = self.local_hello().ok();
        let local = relayer.as_ref().map(|hello| hello.address);
        let mut started = 0;

        for peer in self.membership.active_peers().iter() {
            if exclude.contains(&peer.address) || Some(peer.address) == local {
                continue;
            }
            let client = self.client.clone();
            let endpoint = peer.endpoint.clone();
            let request = PushRequest {
                message: message.clone(),
                known: Vec::new(),
                relayer: relayer.clone(),
            };
            tokio::spawn(async move {
                match client.push_state(&endpoint, request).await {
                    Ok(PushResult::Rejected { reason, .. }) => {
                        warn!("Reannounce to {} rejected: {}", endpoint, reason);
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Reannounce to {} failed: {}", endpoint, e),
                }
            });
            started += 1;
        }

        if started > 0 {
            debug!(
                "Reannounced {} seq {} to {} peers",
                message.sender, message.sequence, started
            );
        }
        started
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Add a peer: Joining, initial full-state exchange, then Active.
    ///
    /// Fails without touching membership when the wallet is locked. A failed
    /// exchange returns the peer to its previous state.
    pub async fn join(&self, address: NodeAddress, endpoint: &str) -> Result<usize, GossipError> {
        if !self.signer.is_unlocked() {
            return Err(GossipError::WalletLocked);
        }
        let local = self.signer.address()?;

        let ticket = self.membership.begin_join(address, endpoint)?;
        match self.initial_exchange(local, address, endpoint).await {
            Ok(merged) => {
                self.membership.activate(&address)?;
                info!("Joined {} at {} ({} states merged)", address, endpoint, merged);
                Ok(merged)
            }
            Err(e) => {
                warn!("Join with {} failed: {}", address, e);
                self.membership.abort_join(ticket);
                Err(e)
            }
        }
    }

    async fn initial_exchange(
        &self,
        local: NodeAddress,
        address: NodeAddress,
        endpoint: &str,
    ) -> Result<usize, GossipError> {
        let issued_at = unix_millis();
        let signature = self
            .signer
            .sign(&join_sign_bytes(&local, issued_at, &self.advertise))?;
        let request = JoinRequest {
            address: local,
            endpoint: self.advertise.clone(),
            issued_at,
            signature,
            states: self.state.messages()?,
        };
        let ack = self.client.join(endpoint, request).await?;
        if ack.address != address {
            return Err(GossipError::AddressMismatch {
                endpoint: endpoint.to_string(),
                expected: address,
                got: ack.address,
            });
        }
        Ok(self
            .merge_remote_view(ack.states, PushSource::peer(address, endpoint))
            .await)
    }

    /// Join a peer known only by endpoint
    pub async fn join_endpoint(&self, endpoint: &str) -> Result<NodeAddress, GossipError> {
        if !self.signer.is_unlocked() {
            return Err(GossipError::WalletLocked);
        }
        let ack = self.client.hello(endpoint, self.local_hello()?).await?;
        self.join(ack.address, endpoint).await?;
        Ok(ack.address)
    }

    /// Answer a remote-initiated join.
    ///
    /// The joiner is activated and answered right away. Its view is merged
    /// in the background, since that may fetch content from the joiner for
    /// longer than the joiner waits on its request.
    pub fn accept_join(self: &Arc<Self>, request: JoinRequest) -> Result<JoinAck, GossipError> {
        self.check_membership_request(
            &request.address,
            request.issued_at,
            &request.sign_bytes(),
            &request.signature,
        )?;
        let local = self.signer.address()?;
        let states = self.state.messages()?;

        if !self.membership.is_active(&request.address) {
            self.membership
                .begin_join(request.address, request.endpoint.clone())?;
            self.membership.activate(&request.address)?;
        }
        info!("Accepted join from {} at {}", request.address, request.endpoint);

        let gossip = Arc::clone(self);
        let source = PushSource::peer(request.address, request.endpoint);
        tokio::spawn(async move {
            let address = source.address;
            let merged = gossip.merge_remote_view(request.states, source).await;
            debug!("Merged {} states from joining peer {:?}", merged, address);
        });

        Ok(JoinAck {
            address: local,
            states,
        })
    }

    /// Check the sender's signature and freshness on a Join or Leave
    fn check_membership_request(
        &self,
        sender: &NodeAddress,
        issued_at: u64,
        payload: &[u8],
        signature: &[u8],
    ) -> Result<(), GossipError> {
        if !self.signer.verify(payload, signature, sender) {
            warn!("Rejected membership request for {}: invalid signature", sender);
            return Err(GossipError::InvalidSignature { sender: *sender });
        }
        if unix_millis().abs_diff(issued_at) > MEMBERSHIP_REQUEST_WINDOW_MS {
            warn!("Rejected membership request for {}: issued at {}", sender, issued_at);
            return Err(GossipError::RequestExpired {
                sender: *sender,
                issued_at,
            });
        }
        Ok(())
    }

    /// Merge a batch of messages from one peer; individual failures are logged
    async fn merge_remote_view(&self, states: Vec<StateMessage>, source: PushSource) -> usize {
        let mut merged = 0;
        for message in states {
            let sender = message.sender;
            match self.handle_push(message, &[], source.clone()).await {
                Ok(PushOutcome::Accepted { .. }) => merged += 1,
                Ok(PushOutcome::Stale { .. }) => {}
                Err(e) => warn!("Skipped state for {}: {}", sender, e),
            }
        }
        merged
    }

    /// Remove a peer: Active, Leaving, Removed. The peer is told best-effort.
    pub async fn leave(&self, address: &NodeAddress) -> Result<(), GossipError> {
        let record = self.membership.begin_leave(address)?;
        match self.signed_leave() {
            Ok(request) => {
                if let Err(e) = self.client.leave(&record.endpoint, request).await {
                    warn!("Could not notify {} of leave: {}", address, e);
                }
            }
            Err(e) => debug!("Leaving {} without notice: {}", address, e),
        }
        self.membership.complete_leave(address)?;
        Ok(())
    }

    fn signed_leave(&self) -> Result<LeaveRequest, GossipError> {
        let address = self.signer.address()?;
        let issued_at = unix_millis();
        let signature = self.signer.sign(&leave_sign_bytes(&address, issued_at))?;
        Ok(LeaveRequest {
            address,
            issued_at,
            signature,
        })
    }

    /// A remote peer announced it is leaving. Only the peer itself can.
    pub fn accept_leave(&self, request: &LeaveRequest) -> Result<(), GossipError> {
        self.check_membership_request(
            &request.address,
            request.issued_at,
            &request.sign_bytes(),
            &request.signature,
        )?;
        self.membership.begin_leave(&request.address)?;
        self.membership.complete_leave(&request.address)?;
        Ok(())
    }

    /// Leave every Active peer
    pub async fn leave_network(&self) {
        for peer in self.membership.active_peers().iter() {
            if let Err(e) = self.leave(&peer.address).await {
                warn!("Leave {} failed: {}", peer.address, e);
            }
        }
    }

    /// Anti-entropy pull of a peer's full view
    pub async fn sync_from(&self, address: NodeAddress, endpoint: &str) -> Result<usize, GossipError> {
        let states = self.client.fetch_full_state(endpoint).await?;
        Ok(self
            .merge_remote_view(states, PushSource::peer(address, endpoint))
            .await)
    }

    // =========================================================================
    // LOCAL PUBLISH
    // =========================================================================

    /// Sign and announce a new state for the local node.
    ///
    /// `root` and its whole DAG must already be stored locally.
    pub async fn publish(&self, root: ContentHash) -> Result<StateMessage, GossipError> {
        let sender = self.signer.address()?;

        let reachable = self
            .resolver
            .diff_where(self.content.as_ref(), root, |_| Ok(false))?;
        if reachable.truncated {
            return Err(GossipError::TraversalLimit(root));
        }
        for hash in &reachable.missing {
            if !self.content.has(hash)? {
                return Err(GossipError::UnknownContent(*hash));
            }
        }

        for _ in 0..PUBLISH_ATTEMPTS {
            let sequence = self.state.next_sequence(&sender)?;
            let signature = self
                .signer
                .sign(&state_sign_bytes(&sender, sequence, &root))?;
            let message = StateMessage {
                sender,
                sequence,
                root_hash: root,
                signature,
            };
            let Some(verified) = self.state.verify(message) else {
                return Err(GossipError::InvalidSignature { sender });
            };
            match self.state.commit(&verified, &[])? {
                MergeOutcome::Accepted => {
                    let message = verified.into_inner();
                    self.reannounce(&message, &[]);
                    return Ok(message);
                }
                MergeOutcome::Stale { current } => {
                    debug!("Publish seq {} raced to {}, retrying", sequence, current);
                }
                MergeOutcome::InvalidSignature => {
                    return Err(GossipError::InvalidSignature { sender });
                }
            }
        }
        Err(GossipError::PublishContended(sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use peerstate_core::crypto::content_hash;
    use peerstate_core::LifecycleState;
    use peerstate_net::messages::HelloAck;
    use peerstate_net::{KeyPair, Wallet};

    /// In-memory peer network: endpoint -> content store, with call records
    #[derive(Default)]
    struct MockClient {
        peers: Mutex<HashMap<String, Arc<ContentStore>>>,
        addresses: Mutex<HashMap<String, NodeAddress>>,
        views: Mutex<HashMap<String, Vec<StateMessage>>>,
        pushes: Mutex<Vec<(String, PushRequest)>>,
        joins: Mutex<Vec<(String, JoinRequest)>>,
        leaves: Mutex<Vec<(String, LeaveRequest)>>,
        /// Endpoints whose block fetches never answer
        silent: Mutex<HashSet<String>>,
        /// Endpoints that refuse every call
        down: Mutex<HashSet<String>>,
    }

    impl MockClient {
        fn add_peer(&self, endpoint: &str, address: NodeAddress, content: Arc<ContentStore>) {
            self.peers.lock().insert(endpoint.into(), content);
            self.addresses.lock().insert(endpoint.into(), address);
        }

        fn check(&self, endpoint: &str) -> Result<(), TransportError> {
            if self.down.lock().contains(endpoint) {
                return Err(TransportError::ConnectionClosed);
            }
            Ok(())
        }

        fn address_of(&self, endpoint: &str) -> Result<NodeAddress, TransportError> {
            self.addresses
                .lock()
                .get(endpoint)
                .copied()
                .ok_or(TransportError::ConnectionClosed)
        }
    }

    #[async_trait]
    impl PeerClient for MockClient {
        async fn hello(&self, endpoint: &str, _local: Hello) -> Result<HelloAck, TransportError> {
            self.check(endpoint)?;
            Ok(HelloAck {
                address: self.address_of(endpoint)?,
                endpoint: endpoint.into(),
            })
        }

        async fn join(&self, endpoint: &str, request: JoinRequest) -> Result<JoinAck, TransportError> {
            self.check(endpoint)?;
            self.joins.lock().push((endpoint.into(), request));
            Ok(JoinAck {
                address: self.address_of(endpoint)?,
                states: self.views.lock().get(endpoint).cloned().unwrap_or_default(),
            })
        }

        async fn leave(&self, endpoint: &str, request: LeaveRequest) -> Result<(), TransportError> {
            self.check(endpoint)?;
            self.leaves.lock().push((endpoint.into(), request));
            Ok(())
        }

        async fn push_state(
            &self,
            endpoint: &str,
            request: PushRequest,
        ) -> Result<PushResult, TransportError> {
            self.check(endpoint)?;
            self.pushes.lock().push((endpoint.into(), request));
            Ok(PushResult::Stale)
        }

        async fn fetch_full_state(&self, endpoint: &str) -> Result<Vec<StateMessage>, TransportError> {
            self.check(endpoint)?;
            Ok(self.views.lock().get(endpoint).cloned().unwrap_or_default())
        }

        async fn fetch_block(
            &self,
            endpoint: &str,
            hash: ContentHash,
        ) -> Result<Option<ContentBlock>, TransportError> {
            self.check(endpoint)?;
            let silent = self.silent.lock().contains(endpoint);
            if silent {
                std::future::pending::<()>().await;
            }
            let store = self.peers.lock().get(endpoint).cloned();
            match store {
                Some(store) => Ok(store.block(&hash).expect("mock store")),
                None => Ok(None),
            }
        }

        async fn fetch_links(
            &self,
            endpoint: &str,
            hash: ContentHash,
        ) -> Result<Option<Vec<ContentHash>>, TransportError> {
            self.check(endpoint)?;
            let store = self.peers.lock().get(endpoint).cloned();
            match store {
                Some(store) => Ok(store.children(&hash).expect("mock store")),
                None => Ok(None),
            }
        }
    }

    struct Node {
        gossip: Arc<GossipPropagator>,
        state: Arc<StateStore>,
        content: Arc<ContentStore>,
        membership: Arc<MembershipTable>,
        client: Arc<MockClient>,
    }

    fn node_with(wallet: Wallet) -> Node {
        let storage = Arc::new(Storage::temporary().unwrap());
        let signer: Arc<dyn SigningGateway> = Arc::new(wallet);
        let state = Arc::new(StateStore::new(storage.clone(), signer.clone()));
        let content = Arc::new(ContentStore::new(storage));
        let membership = Arc::new(MembershipTable::new());
        let client = Arc::new(MockClient::default());
        let gossip = Arc::new(GossipPropagator::new(
            signer,
            state.clone(),
            content.clone(),
            DiffResolver::new(10_000),
            membership.clone(),
            client.clone(),
            "local:1",
            GossipConfig {
                fetch_timeout: Duration::from_millis(100),
                max_fetch_rounds: 8,
            },
        ));
        Node {
            gossip,
            state,
            content,
            membership,
            client,
        }
    }

    fn node() -> Node {
        node_with(Wallet::unlocked_with(KeyPair::from_seed(&[0x11; 32])))
    }

    fn signed(kp: &KeyPair, sequence: u64, root: ContentHash) -> StateMessage {
        let sender = kp.address();
        StateMessage {
            sender,
            sequence,
            root_hash: root,
            signature: kp.sign(&state_sign_bytes(&sender, sequence, &root)).to_vec(),
        }
    }

    /// Remote store holding H1 -> {H2, H3}, H3 -> {H4}; returns (store, H1, H3)
    fn remote_dag() -> (Arc<ContentStore>, ContentHash, ContentHash) {
        let store = Arc::new(ContentStore::new(Arc::new(Storage::temporary().unwrap())));
        let h2 = store.put(b"h2").unwrap();
        let h4 = store.put(b"h4").unwrap();
        let h3 = store.put_linked(b"h3", vec![h4]).unwrap();
        let h1 = store.put_linked(b"h1", vec![h2, h3]).unwrap();
        (store, h1, h3)
    }

    fn join_request(kp: &KeyPair, endpoint: &str, states: Vec<StateMessage>) -> JoinRequest {
        let address = kp.address();
        let issued_at = unix_millis();
        JoinRequest {
            address,
            endpoint: endpoint.into(),
            issued_at,
            signature: kp.sign(&join_sign_bytes(&address, issued_at, endpoint)).to_vec(),
            states,
        }
    }

    fn leave_request(kp: &KeyPair, address: NodeAddress, issued_at: u64) -> LeaveRequest {
        LeaveRequest {
            address,
            issued_at,
            signature: kp.sign(&leave_sign_bytes(&address, issued_at)).to_vec(),
        }
    }

    fn activate(node: &Node, address: NodeAddress, endpoint: &str) {
        node.membership.begin_join(address, endpoint).unwrap();
        node.membership.activate(&address).unwrap();
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_push_fetches_missing_content() {
        let node = node();
        let (remote, root, _) = remote_dag();
        let sender = KeyPair::from_seed(&[0xA; 32]);
        node.client.add_peer("a:1", sender.address(), remote);

        let outcome = node
            .gossip
            .handle_push(
                signed(&sender, 1, root),
                &[],
                PushSource::peer(sender.address(), "a:1"),
            )
            .await
            .unwrap();

        assert_eq!(outcome, PushOutcome::Accepted { fetched: 4 });
        assert_eq!(node.content.block_count(), 4);
        assert_eq!(node.state.get(&sender.address()).unwrap().unwrap().sequence(), 1);
        assert_eq!(node.state.signatures(&sender.address()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_claimed_known_does_not_skip_absent_content() {
        let node = node();
        let (remote, root, h3) = remote_dag();
        let h4 = content_hash(b"h4");
        let sender = KeyPair::from_seed(&[0xA; 32]);
        node.client.add_peer("a:1", sender.address(), remote);

        let outcome = node
            .gossip
            .handle_push(
                signed(&sender, 1, root),
                &[h3],
                PushSource::peer(sender.address(), "a:1"),
            )
            .await
            .unwrap();

        assert_eq!(outcome, PushOutcome::Accepted { fetched: 4 });
        assert!(node.content.has(&h3).unwrap());
        assert!(node.content.has(&h4).unwrap());
        // Now servable to peers we reannounce to
        assert!(node.content.block(&h3).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stored_block_with_dangling_links_is_completed() {
        let node = node();
        let (remote, root, h3) = remote_dag();
        let h4 = content_hash(b"h4");
        // H3 is stored here but its child H4 never was
        assert_eq!(node.content.put_linked(b"h3", vec![h4]).unwrap(), h3);
        let sender = KeyPair::from_seed(&[0xA; 32]);
        node.client.add_peer("a:1", sender.address(), remote);

        let outcome = node
            .gossip
            .handle_push(
                signed(&sender, 1, root),
                &[],
                PushSource::peer(sender.address(), "a:1"),
            )
            .await
            .unwrap();

        // H1, H2 and H4
        assert_eq!(outcome, PushOutcome::Accepted { fetched: 3 });
        assert!(node.content.has(&h4).unwrap());
        assert_eq!(node.content.block_count(), 4);
    }

    #[tokio::test]
    async fn test_dangling_local_block_without_source_is_not_committed() {
        let node = node();
        let sender = KeyPair::from_seed(&[0xA; 32]);
        let root = node
            .content
            .put_linked(b"root", vec![ContentHash([0xEE; 32])])
            .unwrap();

        let err = node
            .gossip
            .handle_push(signed(&sender, 1, root), &[], PushSource::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GossipError::ContentUnreachable { hash, .. } if hash == ContentHash([0xEE; 32])
        ));
        assert!(node.state.get(&sender.address()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_push_is_stale_noop() {
        let node = node();
        let sender = KeyPair::from_seed(&[0xA; 32]);
        let leaf = node.content.put(b"already here").unwrap();
        let message = signed(&sender, 1, leaf);

        let first = node
            .gossip
            .handle_push(message.clone(), &[], PushSource::default())
            .await
            .unwrap();
        assert_eq!(first, PushOutcome::Accepted { fetched: 0 });

        let second = node
            .gossip
            .handle_push(message, &[], PushSource::default())
            .await
            .unwrap();
        assert_eq!(second, PushOutcome::Stale { current: 1 });
        assert_eq!(node.state.signatures(&sender.address()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_is_rejected() {
        let node = node();
        let sender = KeyPair::from_seed(&[0xA; 32]);
        let mut message = signed(&sender, 1, ContentHash([1; 32]));
        message.signature[0] ^= 0xff;

        let err = node
            .gossip
            .handle_push(message, &[], PushSource::default())
            .await
            .unwrap_err();
        assert!(matches!(err, GossipError::InvalidSignature { .. }));
        assert!(!err.is_retryable());
        assert!(node.state.get(&sender.address()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_timeout_leaves_store_untouched() {
        let node = node();
        let (remote, root, _) = remote_dag();
        let sender = KeyPair::from_seed(&[0xA; 32]);
        node.client.add_peer("a:1", sender.address(), remote);
        node.client.silent.lock().insert("a:1".into());

        let err = node
            .gossip
            .handle_push(
                signed(&sender, 1, root),
                &[],
                PushSource::peer(sender.address(), "a:1"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, GossipError::ContentUnreachable { .. }));
        assert!(err.is_retryable());
        assert!(node.state.get(&sender.address()).unwrap().is_none());
        assert!(node.state.signatures(&sender.address()).unwrap().is_empty());
        assert_eq!(node.content.block_count(), 0);
    }

    #[tokio::test]
    async fn test_partial_content_is_not_committed() {
        let node = node();
        let (remote, _, _) = remote_dag();
        // Root links to a child the peer does not hold
        let orphan_root = remote
            .put_linked(b"dangling", vec![ContentHash([0xEE; 32])])
            .unwrap();
        let sender = KeyPair::from_seed(&[0xA; 32]);
        node.client.add_peer("a:1", sender.address(), remote);

        let err = node
            .gossip
            .handle_push(
                signed(&sender, 1, orphan_root),
                &[],
                PushSource::peer(sender.address(), "a:1"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GossipError::ContentUnreachable { hash, .. } if hash == ContentHash([0xEE; 32])
        ));
        assert_eq!(node.content.block_count(), 0);
        assert!(node.state.get(&sender.address()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_content_without_source() {
        let node = node();
        let sender = KeyPair::from_seed(&[0xA; 32]);

        let err = node
            .gossip
            .handle_push(signed(&sender, 1, ContentHash([3; 32])), &[], PushSource::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_reannounce_excludes_sender_and_relayer() {
        let node = node();
        let origin = KeyPair::from_seed(&[0xA; 32]);
        let relayer = NodeAddress([0xB; 32]);
        let other = NodeAddress([0xC; 32]);
        activate(&node, origin.address(), "a:1");
        activate(&node, relayer, "b:1");
        activate(&node, other, "c:1");

        let leaf = node.content.put(b"state").unwrap();
        node.gossip
            .handle_push(signed(&origin, 1, leaf), &[], PushSource::peer(relayer, "b:1"))
            .await
            .unwrap();
        settle().await;

        let pushes = node.client.pushes.lock();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "c:1");
        let relayed = pushes[0].1.relayer.as_ref().unwrap();
        assert_eq!(relayed.endpoint, "local:1");
    }

    #[tokio::test]
    async fn test_reannounce_failure_does_not_fail_push() {
        let node = node();
        let sender = KeyPair::from_seed(&[0xA; 32]);
        activate(&node, NodeAddress([0xC; 32]), "c:1");
        node.client.down.lock().insert("c:1".into());

        let leaf = node.content.put(b"state").unwrap();
        let outcome = node
            .gossip
            .handle_push(signed(&sender, 1, leaf), &[], PushSource::default())
            .await
            .unwrap();
        assert_eq!(outcome, PushOutcome::Accepted { fetched: 0 });
    }

    #[tokio::test]
    async fn test_join_exchanges_state() {
        let node = node();
        let peer = KeyPair::from_seed(&[0xB; 32]);
        let (remote, root, _) = remote_dag();
        node.client.add_peer("b:1", peer.address(), remote);
        node.client
            .views
            .lock()
            .insert("b:1".into(), vec![signed(&peer, 4, root)]);

        let merged = node.gossip.join(peer.address(), "b:1").await.unwrap();
        assert_eq!(merged, 1);
        assert!(node.membership.is_active(&peer.address()));
        assert_eq!(node.state.get(&peer.address()).unwrap().unwrap().sequence(), 4);

        let joins = node.client.joins.lock();
        let request = &joins[0].1;
        assert_eq!(request.endpoint, "local:1");
        assert!(peerstate_net::verify_signature(
            &request.sign_bytes(),
            &request.signature,
            &request.address
        ));
    }

    #[tokio::test]
    async fn test_forged_leave_is_rejected() {
        let node = node();
        let victim = KeyPair::from_seed(&[0x77; 32]);
        let attacker = KeyPair::from_seed(&[0x66; 32]);
        activate(&node, victim.address(), "v:1");

        // Signed by someone else
        let forged = leave_request(&attacker, victim.address(), unix_millis());
        let err = node.gossip.accept_leave(&forged).unwrap_err();
        assert!(matches!(err, GossipError::InvalidSignature { sender } if sender == victim.address()));

        // Genuine but replayed long after it was issued
        let replayed = leave_request(&victim, victim.address(), 1);
        assert!(matches!(
            node.gossip.accept_leave(&replayed),
            Err(GossipError::RequestExpired { .. })
        ));

        assert!(node.membership.is_active(&victim.address()));
        assert_eq!(node.membership.active_peers().len(), 1);

        let genuine = leave_request(&victim, victim.address(), unix_millis());
        node.gossip.accept_leave(&genuine).unwrap();
        assert_eq!(
            node.membership.get(&victim.address()).unwrap().lifecycle,
            LifecycleState::Removed
        );
    }

    #[tokio::test]
    async fn test_forged_join_is_rejected() {
        let node = node();
        let peer = KeyPair::from_seed(&[0xB; 32]);
        let mut request = join_request(&peer, "b:1", Vec::new());
        request.endpoint = "evil:1".into();

        let err = node.gossip.accept_join(request).unwrap_err();
        assert!(matches!(err, GossipError::InvalidSignature { .. }));
        assert!(node.membership.get(&peer.address()).is_none());
    }

    #[tokio::test]
    async fn test_accept_join_answers_before_merging() {
        let node = node();
        let own = node.content.put(b"ours").unwrap();
        node.gossip.publish(own).await.unwrap();

        let joiner = KeyPair::from_seed(&[0xB; 32]);
        let (remote, root, _) = remote_dag();
        node.client.add_peer("b:1", joiner.address(), remote);
        node.client.silent.lock().insert("b:1".into());

        let request = join_request(&joiner, "b:1", vec![signed(&joiner, 1, root)]);
        let ack = node.gossip.accept_join(request).unwrap();

        // Answered and activated while the joiner's content is still pending
        assert!(node.membership.is_active(&joiner.address()));
        assert_eq!(ack.states.len(), 1);
        assert!(node.state.get(&joiner.address()).unwrap().is_none());

        // Once the joiner serves content, the background merge lands
        node.client.silent.lock().clear();
        node.gossip
            .accept_join(join_request(&joiner, "b:1", vec![signed(&joiner, 1, root)]))
            .unwrap();
        let mut merged = false;
        for _ in 0..50 {
            if node.state.get(&joiner.address()).unwrap().is_some() {
                merged = true;
                break;
            }
            settle().await;
        }
        assert!(merged);
    }

    #[tokio::test]
    async fn test_join_with_locked_wallet() {
        let node = node_with(Wallet::new("unused.key"));
        let peer = NodeAddress([0xB; 32]);

        let err = node.gossip.join(peer, "b:1").await.unwrap_err();
        assert!(matches!(err, GossipError::WalletLocked));
        assert!(node.membership.get(&peer).is_none());
        assert!(node.client.joins.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_join_reverts_membership() {
        let node = node();
        let peer = NodeAddress([0xB; 32]);
        node.client.down.lock().insert("b:1".into());

        assert!(node.gossip.join(peer, "b:1").await.is_err());
        assert!(node.membership.get(&peer).is_none());
    }

    #[tokio::test]
    async fn test_join_rejects_wrong_address() {
        let node = node();
        node.client.add_peer(
            "b:1",
            NodeAddress([0xC; 32]),
            Arc::new(ContentStore::new(Arc::new(Storage::temporary().unwrap()))),
        );

        let err = node
            .gossip
            .join(NodeAddress([0xB; 32]), "b:1")
            .await
            .unwrap_err();
        assert!(matches!(err, GossipError::AddressMismatch { .. }));
        assert!(node.membership.get(&NodeAddress([0xB; 32])).is_none());
    }

    #[tokio::test]
    async fn test_join_endpoint_learns_address() {
        let node = node();
        let peer = NodeAddress([0xB; 32]);
        node.client.add_peer(
            "b:1",
            peer,
            Arc::new(ContentStore::new(Arc::new(Storage::temporary().unwrap()))),
        );

        assert_eq!(node.gossip.join_endpoint("b:1").await.unwrap(), peer);
        assert!(node.membership.is_active(&peer));
    }

    #[tokio::test]
    async fn test_leave_keeps_state() {
        let node = node();
        let peer = KeyPair::from_seed(&[0xA; 32]);
        activate(&node, peer.address(), "a:1");
        let leaf = node.content.put(b"s").unwrap();
        node.state.merge(signed(&peer, 2, leaf)).unwrap();

        node.gossip.leave(&peer.address()).await.unwrap();

        assert_eq!(
            node.membership.get(&peer.address()).unwrap().lifecycle,
            LifecycleState::Removed
        );
        assert!(node.membership.active_peers().is_empty());
        assert_eq!(node.state.get(&peer.address()).unwrap().unwrap().sequence(), 2);
        {
            let leaves = node.client.leaves.lock();
            assert_eq!(leaves.len(), 1);
            let (endpoint, request) = &leaves[0];
            assert_eq!(endpoint, "a:1");
            let local = KeyPair::from_seed(&[0x11; 32]).address();
            assert_eq!(request.address, local);
            assert!(peerstate_net::verify_signature(
                &request.sign_bytes(),
                &request.signature,
                &local
            ));
        }

        // Removed peers get no fan-out
        node.gossip.reannounce(&signed(&peer, 3, leaf), &[]);
        settle().await;
        assert!(node.client.pushes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_publish_signs_next_sequence() {
        let node = node();
        activate(&node, NodeAddress([0xC; 32]), "c:1");
        let child = node.content.put(b"child").unwrap();
        let root = node.content.put_linked(b"root", vec![child]).unwrap();

        let first = node.gossip.publish(root).await.unwrap();
        let second = node.gossip.publish(root).await.unwrap();
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
        settle().await;
        assert_eq!(node.client.pushes.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_publish_requires_local_dag() {
        let node = node();
        let root = node
            .content
            .put_linked(b"root", vec![ContentHash([7; 32])])
            .unwrap();

        let err = node.gossip.publish(root).await.unwrap_err();
        assert!(matches!(err, GossipError::UnknownContent(h) if h == ContentHash([7; 32])));
    }

    #[tokio::test]
    async fn test_publish_rejects_missing_grandchild() {
        let node = node();
        let grandchild = ContentHash([8; 32]);
        let child = node.content.put_linked(b"child", vec![grandchild]).unwrap();
        let root = node.content.put_linked(b"root", vec![child]).unwrap();

        let err = node.gossip.publish(root).await.unwrap_err();
        assert!(matches!(err, GossipError::UnknownContent(h) if h == grandchild));
        let local = KeyPair::from_seed(&[0x11; 32]).address();
        assert!(node.state.get(&local).unwrap().is_none());
        settle().await;
        assert!(node.client.pushes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_sync_from_pulls_view() {
        let node = node();
        let peer = KeyPair::from_seed(&[0xB; 32]);
        let (remote, root, _) = remote_dag();
        node.client.add_peer("b:1", peer.address(), remote);
        node.client
            .views
            .lock()
            .insert("b:1".into(), vec![signed(&peer, 1, root), signed(&peer, 2, root)]);

        let merged = node.gossip.sync_from(peer.address(), "b:1").await.unwrap();
        assert_eq!(merged, 2);
        assert_eq!(node.state.get(&peer.address()).unwrap().unwrap().sequence(), 2);
    }
}
