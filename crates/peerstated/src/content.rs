//! Content-addressed block store with an explicit child-link index

use crate::diff::LinkSource;
use crate::storage::{LinkWrite, Storage, StorageError};
use peerstate_core::canonical::normalize_children;
use peerstate_core::crypto::content_hash;
use peerstate_core::*;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Content store errors
#[derive(Debug, Error)]
pub enum ContentError {
    #[error("Storage error: {0}")]
    Storage(StorageError),
    #[error("Block {0} already linked to a different child set")]
    LinkConflict(ContentHash),
}

impl From<StorageError> for ContentError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LinkConflict(hash) => ContentError::LinkConflict(hash),
            other => ContentError::Storage(other),
        }
    }
}

/// Block store keyed by content address.
///
/// Writes are insert-if-absent, so concurrent puts of the same bytes need no
/// coordination. A stored block without a link entry is a leaf.
pub struct ContentStore {
    storage: Arc<Storage>,
}

impl ContentStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Store bytes as a leaf block, returning its address
    pub fn put(&self, bytes: &[u8]) -> Result<ContentHash, ContentError> {
        let hash = content_hash(bytes);
        if self.storage.put_block(&hash, bytes)? {
            debug!("Stored block {} ({} bytes)", hash, bytes.len());
        }
        Ok(hash)
    }

    /// Store bytes together with their child links in one write
    pub fn put_linked(
        &self,
        bytes: &[u8],
        mut children: Vec<ContentHash>,
    ) -> Result<ContentHash, ContentError> {
        normalize_children(&mut children);
        let block = ContentBlock {
            hash: content_hash(bytes),
            bytes: bytes.to_vec(),
            children,
        };
        if self.storage.put_linked_block(&block)? {
            debug!(
                "Stored block {} with {} children",
                block.hash,
                block.children.len()
            );
        }
        Ok(block.hash)
    }

    /// Record the DAG edges of a block, before or after its bytes arrive
    pub fn link(&self, hash: ContentHash, mut children: Vec<ContentHash>) -> Result<(), ContentError> {
        normalize_children(&mut children);
        if self.storage.put_links(&hash, &children)? == LinkWrite::Inserted {
            debug!("Linked {} -> {} children", hash, children.len());
        }
        Ok(())
    }

    /// Block bytes
    pub fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, ContentError> {
        Ok(self.storage.get_block(hash)?)
    }

    /// Child set of a block; `None` when neither bytes nor links are known
    pub fn children(&self, hash: &ContentHash) -> Result<Option<Vec<ContentHash>>, ContentError> {
        if let Some(children) = self.storage.get_links(hash)? {
            return Ok(Some(children));
        }
        if self.storage.has_block(hash)? {
            return Ok(Some(Vec::new()));
        }
        Ok(None)
    }

    pub fn has(&self, hash: &ContentHash) -> Result<bool, ContentError> {
        Ok(self.storage.has_block(hash)?)
    }

    /// Full block with links, as served to peers
    pub fn block(&self, hash: &ContentHash) -> Result<Option<ContentBlock>, ContentError> {
        let Some(bytes) = self.storage.get_block(hash)? else {
            return Ok(None);
        };
        let children = self.storage.get_links(hash)?.unwrap_or_default();
        Ok(Some(ContentBlock {
            hash: *hash,
            bytes,
            children,
        }))
    }

    pub fn block_count(&self) -> usize {
        self.storage.block_count()
    }
}

impl LinkSource for ContentStore {
    fn links_of(&self, hash: &ContentHash) -> Result<Option<Vec<ContentHash>>, ContentError> {
        self.children(hash)
    }
}
