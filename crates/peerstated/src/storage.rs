//! Persistent storage using sled

use peerstate_core::*;
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::Db;
use std::path::Path;
use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),
    #[error("Conflicting links for block {0}")]
    LinkConflict(ContentHash),
    #[error("Override to seq {requested} would go below stored seq {current}")]
    SequenceRegression { current: u64, requested: u64 },
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::Sled(e),
        }
    }
}

type TxResult<T> = Result<T, ConflictableTransactionError<StorageError>>;

fn abort<E: Into<StorageError>>(err: E) -> ConflictableTransactionError<StorageError> {
    ConflictableTransactionError::Abort(err.into())
}

/// Result of writing a link set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkWrite {
    Inserted,
    Unchanged,
}

/// Result of a state commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Record replaced and ledger appended
    Committed { previous: Option<u64> },
    /// Stored sequence is already at or past the message
    Stale { current: u64 },
}

/// Storage backend for peerstated
pub struct Storage {
    db: Db,
    /// Block tree: content_hash -> bytes
    blocks: sled::Tree,
    /// Link tree: content_hash -> Vec<ContentHash>
    links: sled::Tree,
    /// State tree: node_address -> NodeStateRecord
    states: sled::Tree,
    /// Ledger tree: node_address || sequence (BE) -> SignatureLedgerEntry
    ledger: sled::Tree,
    /// Acceptance order: generated id (BE) -> ledger key
    accepted: sled::Tree,
    /// Metadata tree: key -> value
    metadata: sled::Tree,
}

impl Storage {
    /// Open storage at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Open a throwaway in-memory database
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree("blocks")?;
        let links = db.open_tree("links")?;
        let states = db.open_tree("states")?;
        let ledger = db.open_tree("ledger")?;
        let accepted = db.open_tree("accepted")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            links,
            states,
            ledger,
            accepted,
            metadata,
        })
    }

    // =========================================================================
    // BLOCKS AND LINKS
    // =========================================================================

    /// Insert block bytes if absent. Returns whether a write happened.
    pub fn put_block(&self, hash: &ContentHash, bytes: &[u8]) -> Result<bool, StorageError> {
        let swapped = self
            .blocks
            .compare_and_swap(hash.0, None as Option<&[u8]>, Some(bytes))?;
        Ok(swapped.is_ok())
    }

    /// Get block bytes by hash
    pub fn get_block(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blocks.get(hash.0)?.map(|v| v.to_vec()))
    }

    /// Check if block bytes exist
    pub fn has_block(&self, hash: &ContentHash) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(hash.0)?)
    }

    /// Count stored blocks
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Record the child set of a block. Link sets are write-once.
    pub fn put_links(
        &self,
        hash: &ContentHash,
        children: &[ContentHash],
    ) -> Result<LinkWrite, StorageError> {
        let value = postcard::to_allocvec(children)?;
        match self
            .links
            .compare_and_swap(hash.0, None as Option<&[u8]>, Some(value.as_slice()))?
        {
            Ok(()) => Ok(LinkWrite::Inserted),
            Err(cas) if cas.current.as_deref() == Some(value.as_slice()) => {
                Ok(LinkWrite::Unchanged)
            }
            Err(_) => Err(StorageError::LinkConflict(*hash)),
        }
    }

    /// Get the child set of a block
    pub fn get_links(&self, hash: &ContentHash) -> Result<Option<Vec<ContentHash>>, StorageError> {
        match self.links.get(hash.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write bytes and links of one block atomically
    pub fn put_linked_block(&self, block: &ContentBlock) -> Result<bool, StorageError> {
        let links_value = postcard::to_allocvec(&block.children)?;
        let inserted = (&self.blocks, &self.links).transaction(|(blocks, links)| {
            Self::tx_write_block(blocks, links, block, &links_value)
        })?;
        Ok(inserted)
    }

    fn tx_write_block(
        blocks: &sled::transaction::TransactionalTree,
        links: &sled::transaction::TransactionalTree,
        block: &ContentBlock,
        links_value: &[u8],
    ) -> TxResult<bool> {
        match links.get(block.hash.0)? {
            Some(existing) if existing.as_ref() != links_value => {
                return Err(abort(StorageError::LinkConflict(block.hash)));
            }
            Some(_) => {}
            None => {
                links.insert(&block.hash.0[..], links_value)?;
            }
        }
        if blocks.get(block.hash.0)?.is_some() {
            return Ok(false);
        }
        blocks.insert(&block.hash.0[..], block.bytes.as_slice())?;
        Ok(true)
    }

    // =========================================================================
    // STATE RECORDS AND LEDGER
    // =========================================================================

    /// Get the record for a node
    pub fn get_state(&self, address: &NodeAddress) -> Result<Option<NodeStateRecord>, StorageError> {
        match self.states.get(address.0)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Snapshot every record
    pub fn all_states(&self) -> Result<FullStateView, StorageError> {
        let mut view = FullStateView::new();
        for result in self.states.iter() {
            let (_, bytes) = result?;
            let record: NodeStateRecord = postcard::from_bytes(&bytes)?;
            view.insert(record.message.sender, record);
        }
        Ok(view)
    }

    /// Count records
    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Commit a verified message with the content it references.
    ///
    /// Blocks, links, the record and the ledger entry land in one
    /// transaction, and only if `message.sequence` is strictly greater than
    /// the stored sequence at commit time.
    pub fn commit_state(
        &self,
        message: &StateMessage,
        blocks: &[ContentBlock],
        accepted_at: u64,
    ) -> Result<CommitOutcome, StorageError> {
        let record = NodeStateRecord::new(message.clone(), accepted_at);
        let record_value = postcard::to_allocvec(&record)?;
        let entry = SignatureLedgerEntry::from_message(message, accepted_at);
        let entry_value = postcard::to_allocvec(&entry)?;
        let block_links = blocks
            .iter()
            .map(|b| postcard::to_allocvec(&b.children))
            .collect::<Result<Vec<_>, _>>()?;
        let address = message.sender.0;

        let trees = (
            &self.blocks,
            &self.links,
            &self.states,
            &self.ledger,
            &self.accepted,
        );
        let outcome = trees.transaction(
            |(tx_blocks, tx_links, tx_states, tx_ledger, tx_accepted)| {
                let previous = match tx_states.get(address)? {
                    Some(bytes) => {
                        let current: NodeStateRecord =
                            postcard::from_bytes(&bytes).map_err(abort)?;
                        if current.sequence() >= message.sequence {
                            return Ok(CommitOutcome::Stale {
                                current: current.sequence(),
                            });
                        }
                        Some(current.sequence())
                    }
                    None => None,
                };

                for (block, links_value) in blocks.iter().zip(&block_links) {
                    Self::tx_write_block(tx_blocks, tx_links, block, links_value)?;
                }

                tx_states.insert(&address[..], record_value.as_slice())?;

                let key = ledger_key(&message.sender, message.sequence);
                tx_ledger.insert(&key[..], entry_value.as_slice())?;

                // A conflict retry draws a fresh id, so ids of one sender grow
                // with its sequence
                let order = tx_accepted.generate_id()?;
                tx_accepted.insert(&order.to_be_bytes()[..], &key[..])?;

                Ok(CommitOutcome::Committed { previous })
            },
        )?;
        Ok(outcome)
    }

    /// Overwrite a record without signature checks or ledger entry.
    ///
    /// The sequence may stay or grow but never drop below the stored one,
    /// so later ledger keys still sort after earlier ones.
    pub fn override_state(&self, record: &NodeStateRecord) -> Result<(), StorageError> {
        let value = postcard::to_allocvec(record)?;
        let address = record.message.sender.0;
        let requested = record.sequence();

        self.states.transaction(|tx_states| {
            if let Some(bytes) = tx_states.get(address)? {
                let current: NodeStateRecord = postcard::from_bytes(&bytes).map_err(abort)?;
                if requested < current.sequence() {
                    return Err(abort(StorageError::SequenceRegression {
                        current: current.sequence(),
                        requested,
                    }));
                }
            }
            tx_states.insert(&address[..], value.as_slice())?;
            Ok(())
        })?;
        Ok(())
    }

    /// Ledger entries of one node, in acceptance order
    pub fn signatures(&self, address: &NodeAddress) -> Result<Vec<SignatureLedgerEntry>, StorageError> {
        let mut entries = Vec::new();
        for result in self.ledger.scan_prefix(address.0) {
            let (_, bytes) = result?;
            entries.push(postcard::from_bytes(&bytes)?);
        }
        Ok(entries)
    }

    /// Every ledger entry, in the order commits were accepted
    pub fn all_signatures(&self) -> Result<Vec<SignatureLedgerEntry>, StorageError> {
        let mut entries = Vec::new();
        for result in self.accepted.iter() {
            let (_, key) = result?;
            if let Some(bytes) = self.ledger.get(key)? {
                entries.push(postcard::from_bytes(&bytes)?);
            }
        }
        Ok(entries)
    }

    // =========================================================================
    // METADATA
    // =========================================================================

    /// Store metadata
    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    /// Get metadata
    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    /// Flush all pending writes
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn ledger_key(address: &NodeAddress, sequence: u64) -> [u8; 40] {
    let mut key = [0u8; 40];
    key[..32].copy_from_slice(&address.0);
    key[32..].copy_from_slice(&sequence.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerstate_core::crypto::content_hash;
    use tempfile::tempdir;

    fn message(sender: u8, sequence: u64) -> StateMessage {
        StateMessage {
            sender: NodeAddress([sender; 32]),
            sequence,
            root_hash: ContentHash([sequence as u8; 32]),
            signature: vec![sequence as u8; 64],
        }
    }

    fn block(bytes: &[u8], children: Vec<ContentHash>) -> ContentBlock {
        ContentBlock {
            hash: content_hash(bytes),
            bytes: bytes.to_vec(),
            children,
        }
    }

    #[test]
    fn test_put_block_once() {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let hash = content_hash(b"abc");

        assert!(storage.put_block(&hash, b"abc").unwrap());
        assert!(!storage.put_block(&hash, b"abc").unwrap());
        assert_eq!(storage.block_count(), 1);
        assert_eq!(storage.get_block(&hash).unwrap().unwrap(), b"abc");
    }

    #[test]
    fn test_links_write_once() {
        let storage = Storage::temporary().unwrap();
        let parent = ContentHash([1; 32]);
        let children = vec![ContentHash([2; 32])];

        assert_eq!(storage.put_links(&parent, &children).unwrap(), LinkWrite::Inserted);
        assert_eq!(storage.put_links(&parent, &children).unwrap(), LinkWrite::Unchanged);
        assert!(matches!(
            storage.put_links(&parent, &[ContentHash([3; 32])]),
            Err(StorageError::LinkConflict(_))
        ));
        assert_eq!(storage.get_links(&parent).unwrap().unwrap(), children);
    }

    #[test]
    fn test_commit_and_stale() {
        let storage = Storage::temporary().unwrap();
        let b = block(b"root", vec![]);

        let first = storage.commit_state(&message(1, 1), &[b.clone()], 10).unwrap();
        assert_eq!(first, CommitOutcome::Committed { previous: None });
        assert!(storage.has_block(&b.hash).unwrap());

        let dup = storage.commit_state(&message(1, 1), &[], 11).unwrap();
        assert_eq!(dup, CommitOutcome::Stale { current: 1 });

        let next = storage.commit_state(&message(1, 5), &[], 12).unwrap();
        assert_eq!(next, CommitOutcome::Committed { previous: Some(1) });

        let record = storage.get_state(&NodeAddress([1; 32])).unwrap().unwrap();
        assert_eq!(record.sequence(), 5);
        assert_eq!(storage.signatures(&NodeAddress([1; 32])).unwrap().len(), 2);
    }

    #[test]
    fn test_stale_commit_writes_no_blocks() {
        let storage = Storage::temporary().unwrap();
        storage.commit_state(&message(1, 3), &[], 10).unwrap();

        let b = block(b"late", vec![]);
        storage.commit_state(&message(1, 2), &[b.clone()], 11).unwrap();
        assert!(!storage.has_block(&b.hash).unwrap());
    }

    #[test]
    fn test_link_conflict_aborts_commit() {
        let storage = Storage::temporary().unwrap();
        let b = block(b"node", vec![ContentHash([7; 32])]);
        storage.put_links(&b.hash, &[ContentHash([8; 32])]).unwrap();

        let result = storage.commit_state(&message(1, 1), &[b], 10);
        assert!(matches!(result, Err(StorageError::LinkConflict(_))));
        assert!(storage.get_state(&NodeAddress([1; 32])).unwrap().is_none());
        assert!(storage.signatures(&NodeAddress([1; 32])).unwrap().is_empty());
    }

    #[test]
    fn test_ledger_order() {
        let storage = Storage::temporary().unwrap();
        storage.commit_state(&message(2, 1), &[], 10).unwrap();
        storage.commit_state(&message(1, 1), &[], 11).unwrap();
        storage.commit_state(&message(2, 2), &[], 12).unwrap();

        let node2: Vec<u64> = storage
            .signatures(&NodeAddress([2; 32]))
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(node2, vec![1, 2]);

        let all: Vec<(u8, u64)> = storage
            .all_signatures()
            .unwrap()
            .iter()
            .map(|e| (e.node.0[0], e.sequence))
            .collect();
        assert_eq!(all, vec![(2, 1), (1, 1), (2, 2)]);
    }

    #[test]
    fn test_same_millisecond_keeps_acceptance_order() {
        let storage = Storage::temporary().unwrap();
        storage.commit_state(&message(9, 1), &[], 10).unwrap();
        storage.commit_state(&message(1, 1), &[], 10).unwrap();
        storage.commit_state(&message(5, 1), &[], 10).unwrap();
        storage.commit_state(&message(1, 2), &[], 10).unwrap();

        let all: Vec<(u8, u64)> = storage
            .all_signatures()
            .unwrap()
            .iter()
            .map(|e| (e.node.0[0], e.sequence))
            .collect();
        assert_eq!(all, vec![(9, 1), (1, 1), (5, 1), (1, 2)]);
    }

    #[test]
    fn test_override_cannot_lower_sequence() {
        let storage = Storage::temporary().unwrap();
        storage.commit_state(&message(1, 4), &[], 10).unwrap();

        let lower = NodeStateRecord::new(message(1, 2), 11);
        assert!(matches!(
            storage.override_state(&lower),
            Err(StorageError::SequenceRegression {
                current: 4,
                requested: 2
            })
        ));
        assert_eq!(storage.get_state(&NodeAddress([1; 32])).unwrap().unwrap().sequence(), 4);

        storage.override_state(&NodeStateRecord::new(message(1, 4), 12)).unwrap();
        storage.override_state(&NodeStateRecord::new(message(1, 7), 13)).unwrap();
        assert_eq!(storage.get_state(&NodeAddress([1; 32])).unwrap().unwrap().sequence(), 7);

        // The next accepted message still sorts after the old entry
        storage.commit_state(&message(1, 8), &[], 14).unwrap();
        let seqs: Vec<u64> = storage
            .signatures(&NodeAddress([1; 32]))
            .unwrap()
            .iter()
            .map(|e| e.sequence)
            .collect();
        assert_eq!(seqs, vec![4, 8]);
    }

    #[test]
    fn test_metadata() {
        let storage = Storage::temporary().unwrap();
        assert!(storage.get_metadata("k").unwrap().is_none());
        storage.put_metadata("k", b"v").unwrap();
        assert_eq!(storage.get_metadata("k").unwrap().unwrap(), b"v");
    }
}
