//! Configuration for peerstated

use crate::api::GatewayConfig;
use crate::gossip::GossipConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// peerstated - peer state synchronization daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "peerstated")]
#[command(about = "Signed peer state gossip over a content-addressed block store")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9300")]
    pub listen: SocketAddr,

    /// Endpoint other peers use to reach this node (defaults to --listen)
    #[arg(long)]
    pub advertise: Option<String>,

    /// Data directory for persistent storage and the wallet keystore
    #[arg(short, long, default_value = "./data/peerstated")]
    pub data_dir: PathBuf,

    /// Bootstrap peer endpoints (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<String>,

    /// Join the bootstrap peers on startup
    #[arg(long)]
    pub autojoin: bool,

    /// Passphrase that creates or unlocks the node wallet
    #[arg(long, env = "PEERSTATE_WALLET_PASSPHRASE", hide_env_values = true)]
    pub wallet_passphrase: Option<String>,

    /// Timeout for each content fetch and peer round trip, in milliseconds
    #[arg(long, default_value = "5000")]
    pub fetch_timeout_ms: u64,

    /// Upper bound on nodes visited by one content diff
    #[arg(long, default_value = "100000")]
    pub max_diff_visits: usize,

    /// DAG levels fetched for one push before it is abandoned
    #[arg(long, default_value = "64")]
    pub max_fetch_rounds: usize,

    /// Anti-entropy interval in seconds
    #[arg(long, default_value = "30")]
    pub sync_interval_secs: u64,

    /// Close inbound connections that send no request for this many seconds
    #[arg(long, default_value = "120")]
    pub idle_timeout_secs: u64,

    /// Accept unsigned state overrides (never enable in production)
    #[arg(long, env = "PEERSTATE_DEBUG")]
    pub debug_state_override: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.fetch_timeout_ms == 0 {
            anyhow::bail!("--fetch-timeout-ms must be positive");
        }
        if self.max_diff_visits == 0 {
            anyhow::bail!("--max-diff-visits must be positive");
        }
        if self.max_fetch_rounds == 0 {
            anyhow::bail!("--max-fetch-rounds must be positive");
        }
        if self.sync_interval_secs == 0 {
            anyhow::bail!("--sync-interval-secs must be positive");
        }
        if self.idle_timeout_secs == 0 {
            anyhow::bail!("--idle-timeout-secs must be positive");
        }
        if self.autojoin && self.bootstrap.is_empty() {
            anyhow::bail!("--autojoin needs at least one --bootstrap endpoint");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format {:?}", self.log_format);
        }
        Ok(())
    }

    /// Endpoint announced to peers
    pub fn advertise_endpoint(&self) -> String {
        self.advertise
            .clone()
            .unwrap_or_else(|| self.listen.to_string())
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            gossip: GossipConfig {
                fetch_timeout: self.fetch_timeout(),
                max_fetch_rounds: self.max_fetch_rounds,
            },
            max_diff_visits: self.max_diff_visits,
            debug_state_override: self.debug_state_override,
        }
    }
}
