//! peerstated server - main service loop

use crate::api::{ApiError, Gateway};
use crate::config::Config;
use crate::gossip::{push_result, GossipError, PushSource};
use crate::storage::{Storage, StorageError};
use peerstate_core::NodeAddress;
use peerstate_net::framing::{read_frame, write_frame};
use peerstate_net::messages::*;
use peerstate_net::{Frame, FrameError, FrameType, SigningGateway, TcpPeerClient, Wallet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

/// Metadata key holding the address of the node that owns the database
const OWNER_KEY: &str = "owner";

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Gossip(#[from] GossipError),
    #[error("Unexpected request frame {0:?}")]
    UnexpectedFrame(FrameType),
    #[error("Peer {0} stopped reading responses")]
    WriteTimeout(SocketAddr),
}

/// Server state
pub struct Server {
    config: Config,
    storage: Arc<Storage>,
    wallet: Arc<Wallet>,
    gateway: Arc<Gateway>,
    /// Shutdown signal
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        std::fs::create_dir_all(&config.data_dir)?;

        // Open storage
        let storage = Arc::new(Storage::open(config.data_dir.join("db"))?);

        let wallet = Arc::new(Wallet::new(config.data_dir.join("wallet.key")));
        initialize_config_wallet(&wallet, config.wallet_passphrase.as_deref());
        if let Ok(address) = wallet.address() {
            check_data_owner(&storage, &address)?;
        }

        let client = Arc::new(TcpPeerClient::new(config.fetch_timeout()));
        let gateway = Arc::new(Gateway::open(
            storage.clone(),
            wallet.clone(),
            client,
            config.advertise_endpoint(),
            config.gateway_config(),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            storage,
            wallet,
            gateway,
            shutdown_tx,
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Local node address, if the wallet is unlocked
    pub fn address(&self) -> Option<NodeAddress> {
        self.wallet.address().ok()
    }

    /// Bind the configured listen address and serve until shutdown
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            "Starting peerstated on {} (advertise {}, node {})",
            listener.local_addr()?,
            self.config.advertise_endpoint(),
            self.address()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "locked".into())
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Spawn background tasks
        let sync_handle = self.spawn_sync_task();
        if self.config.autojoin {
            self.spawn_autojoin_task();
        }

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {}", addr);
                            let server = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, addr).await {
                                    warn!("Connection error from {}: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutting down...");
                    break;
                }
            }
        }

        sync_handle.abort();
        self.gateway.gossip().leave_network().await;

        // Flush storage
        self.storage.flush()?;

        Ok(())
    }

    /// Serve request frames until the peer closes the connection or idles
    async fn handle_connection(
        self: Arc<Self>,
        mut stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        stream.set_nodelay(true)?;
        let idle = self.config.idle_timeout();
        loop {
            let frame = match timeout(idle, read_frame(&mut stream)).await {
                Ok(frame) => frame?,
                Err(_) => {
                    debug!("Closing idle connection from {}", addr);
                    break;
                }
            };
            let Some(frame) = frame else {
                break;
            };
            debug!("<- {} {:?}", addr, frame.frame_type);
            let response = self.dispatch(frame).await;
            timeout(idle, write_frame(&mut stream, response))
                .await
                .map_err(|_| ServerError::WriteTimeout(addr))??;
        }
        Ok(())
    }

    /// Answer one request; failures become an Error frame
    pub async fn dispatch(&self, frame: Frame) -> Frame {
        match self.respond(frame).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request failed: {}", e);
                ErrorResponse {
                    message: e.to_string(),
                }
                .to_frame()
                .unwrap_or_else(|_| Frame::new(FrameType::Error, Vec::new()))
            }
        }
    }

    async fn respond(&self, frame: Frame) -> Result<Frame, ServerError> {
        let gossip = self.gateway.gossip();
        let response = match frame.frame_type {
            FrameType::Ping => Frame::pong(),
            FrameType::Hello => {
                let hello = Hello::from_frame(&frame)?;
                debug!("Hello from {} at {}", hello.address, hello.endpoint);
                let local = gossip.local_hello()?;
                HelloAck {
                    address: local.address,
                    endpoint: local.endpoint,
                }
                .to_frame()?
            }
            FrameType::Join => {
                let request = JoinRequest::from_frame(&frame)?;
                gossip.accept_join(request)?.to_frame()?
            }
            FrameType::Leave => {
                let request = LeaveRequest::from_frame(&frame)?;
                gossip.accept_leave(&request)?;
                LeaveAck.to_frame()?
            }
            FrameType::PushState => {
                let request = PushRequest::from_frame(&frame)?;
                let source = match request.relayer {
                    Some(relayer) => PushSource::peer(relayer.address, relayer.endpoint),
                    // Pushed by the origin itself
                    None => PushSource {
                        address: Some(request.message.sender),
                        endpoint: None,
                    },
                };
                let result = gossip
                    .handle_push(request.message, &request.known, source)
                    .await;
                push_result(&result).to_frame()?
            }
            FrameType::FullStateRequest => FullStateResponse {
                states: self.gateway.state_messages()?,
            }
            .to_frame()?,
            FrameType::BlockRequest => {
                let request = BlockRequest::from_frame(&frame)?;
                BlockResponse {
                    block: self.gateway.get_block(&request.hash)?,
                }
                .to_frame()?
            }
            FrameType::LinksRequest => {
                let request = LinksRequest::from_frame(&frame)?;
                LinksResponse {
                    children: self.gateway.get_content_links(&request.hash)?,
                }
                .to_frame()?
            }
            other => return Err(ServerError::UnexpectedFrame(other)),
        };
        Ok(response)
    }

    /// Spawn background anti-entropy task
    fn spawn_sync_task(&self) -> tokio::task::JoinHandle<()> {
        let gateway = self.gateway.clone();
        let interval_secs = self.config.sync_interval_secs;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for peer in gateway.membership().active_peers().iter() {
                            match gateway.gossip().sync_from(peer.address, &peer.endpoint).await {
                                Ok(0) => {}
                                Ok(merged) => info!("Synced {} states from {}", merged, peer.address),
                                Err(e) => debug!("Sync with {} failed: {}", peer.address, e),
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        break;
                    }
                }
            }
        })
    }

    /// Join every bootstrap endpoint once the wallet allows it
    fn spawn_autojoin_task(&self) {
        let gateway = self.gateway.clone();
        let bootstrap = self.config.bootstrap.clone();

        tokio::spawn(async move {
            if !gateway.wallet_unlocked() {
                error!("Autojoin skipped: wallet is locked");
                return;
            }
            if bootstrap.is_empty() {
                error!("Autojoin skipped: no bootstrap endpoints configured");
                return;
            }
            for endpoint in bootstrap {
                match gateway.join_endpoint(&endpoint).await {
                    Ok(address) => info!("Autojoined {} at {}", address, endpoint),
                    Err(e) => error!("Autojoin with {} failed: {}", endpoint, e),
                }
            }
        });
    }

    /// Shutdown the server
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            block_count: self.storage.block_count(),
            state_count: self.storage.state_count(),
            membership: self.gateway.membership().stats(),
        }
    }
}

/// Create the wallet account if needed, then unlock it. Never fatal.
fn initialize_config_wallet(wallet: &Wallet, passphrase: Option<&str>) {
    let Some(passphrase) = passphrase else {
        warn!("No wallet passphrase configured; node cannot sign or join");
        return;
    };

    if !wallet.has_account() {
        match wallet.create_account(passphrase) {
            Ok(address) => info!("Created node account {}", address),
            Err(e) => {
                error!("Failed to create wallet account: {}", e);
                return;
            }
        }
    }

    match wallet.unlock(passphrase) {
        Ok(address) => info!("Wallet unlocked for {}", address),
        Err(e) => error!("Failed to unlock wallet: {}", e),
    }
}

/// Record which node owns the database; warn when a different key opens it
fn check_data_owner(storage: &Storage, address: &NodeAddress) -> Result<(), ServerError> {
    match storage.get_metadata(OWNER_KEY)? {
        Some(owner) if owner.as_slice() == address.as_bytes() => {}
        Some(owner) => {
            warn!(
                "Data directory was written by 0x{}, now opened by {}",
                hex_prefix(&owner),
                address
            );
            storage.put_metadata(OWNER_KEY, address.as_bytes())?;
        }
        None => storage.put_metadata(OWNER_KEY, address.as_bytes())?,
    }
    Ok(())
}

fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(4).map(|b| format!("{:02x}", b)).collect()
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub block_count: usize,
    pub state_count: usize,
    pub membership: crate::membership::MembershipStats,
}
