//! Networking primitives for the peerstate protocol
//!
//! This crate provides:
//! - Ed25519 identity keys and the passphrase-protected wallet
//! - Length-prefixed message framing
//! - Request/response payloads
//! - The outbound peer client

pub mod crypto;
pub mod framing;
pub mod messages;
pub mod transport;
pub mod wallet;

pub use crypto::{verify_signature, KeyPair};
pub use framing::{Frame, FrameCodec, FrameError, FrameType};
pub use transport::{PeerClient, TcpPeerClient, TransportError};
pub use wallet::{SigningGateway, Wallet, WalletError};
