//! peerstate Core Library
//!
//! This crate provides the core types, canonical encoding, and content
//! addressing for the peerstate synchronization protocol.
//!
//! # Modules
//!
//! - [`types`]: Protocol types (NodeAddress, StateMessage, ContentBlock, etc.)
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: Content addresses and signing payloads
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod types;

#[cfg(test)]
mod test_vectors;

pub use error::{Error, Result};
pub use types::*;
