//! Canonical encoding for peerstate
//!
//! All hashed/signed/persisted objects use postcard serialization with
//! strict constraints:
//! - No maps/hashmaps in encoded values
//! - Repeated fields (child links) must be sorted and deduped
//! - Field order is Rust struct field order

use crate::error::{Error, Result};
use crate::types::*;
use serde::Serialize;

/// Serialize a value to canonical bytes using postcard.
///
/// This is the normative encoding for persistence and the wire.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    postcard::to_allocvec(value).map_err(Error::from)
}

/// Sort and dedup a child link set.
pub fn normalize_children(children: &mut Vec<ContentHash>) {
    children.sort();
    children.dedup();
}

/// Check that child links are properly sorted and deduped.
pub fn validate_children_sorted(children: &[ContentHash]) -> Result<()> {
    for i in 1..children.len() {
        if children[i] <= children[i - 1] {
            return Err(Error::UnsortedRepeatedField {
                field: "children".into(),
            });
        }
    }
    Ok(())
}
