//! peerstated - peer state synchronization daemon
//!
//! This daemon provides:
//! - Membership lifecycle for an open set of peers
//! - A content-addressed block store with explicit DAG links
//! - Missing-content diffs over that DAG
//! - Signed per-node state records with an append-only signature ledger
//! - Gossip propagation gated on full content resolution

pub mod api;
pub mod config;
pub mod content;
pub mod diff;
pub mod gossip;
pub mod membership;
pub mod server;
pub mod state_store;
pub mod storage;

pub use api::{ApiError, Gateway, GatewayConfig};
pub use config::Config;
pub use content::ContentStore;
pub use diff::{Diff, DiffResolver, LinkSource};
pub use gossip::{GossipConfig, GossipError, GossipPropagator, PushOutcome, PushSource};
pub use membership::MembershipTable;
pub use server::Server;
pub use state_store::{MergeOutcome, StateStore};
pub use storage::Storage;
