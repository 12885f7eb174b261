//! Missing-content computation over the block DAG
//!
//! Given a target root and the set of hashes a requester already holds, the
//! resolver walks the link index breadth-first and collects every reachable
//! hash the requester lacks. A known hash prunes its whole subtree: holding a
//! block implies holding everything beneath it.

use crate::content::ContentError;
use peerstate_core::ContentHash;
use std::collections::{HashSet, VecDeque};
use tracing::warn;

/// Anything that can report the child links of a block.
pub trait LinkSource {
    /// `None` when the block's links are not known locally
    fn links_of(&self, hash: &ContentHash) -> Result<Option<Vec<ContentHash>>, ContentError>;
}

/// Result of a traversal
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Diff {
    /// Reachable hashes not covered by the known set
    pub missing: HashSet<ContentHash>,
    /// Subset of `missing` whose children could not be expanded
    pub frontier: HashSet<ContentHash>,
    /// Traversal stopped at the visit limit
    pub truncated: bool,
}

/// Breadth-first diff over a [`LinkSource`]
#[derive(Debug, Clone)]
pub struct DiffResolver {
    max_visits: usize,
}

impl DiffResolver {
    pub fn new(max_visits: usize) -> Self {
        Self { max_visits }
    }

    /// Hashes reachable from `target` that are not in `known`.
    ///
    /// An unknown `target` is reported as missing on its own.
    pub fn missing<S>(
        &self,
        source: &S,
        target: ContentHash,
        known: &HashSet<ContentHash>,
    ) -> Result<HashSet<ContentHash>, ContentError>
    where
        S: LinkSource + ?Sized,
    {
        let diff = self.diff_where(source, target, |h| Ok(known.contains(h)))?;
        Ok(diff.missing)
    }

    /// Full traversal with a caller-supplied membership test for the known set.
    pub fn diff_where<S, F>(
        &self,
        source: &S,
        target: ContentHash,
        mut is_known: F,
    ) -> Result<Diff, ContentError>
    where
        S: LinkSource + ?Sized,
        F: FnMut(&ContentHash) -> Result<bool, ContentError>,
    {
        let mut diff = Diff::default();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([target]);

        while let Some(hash) = queue.pop_front() {
            // Adversarial link graphs may contain cycles or shared subtrees
            if !visited.insert(hash) {
                continue;
            }
            if visited.len() > self.max_visits {
                warn!(
                    "Diff from {} stopped after {} visits",
                    target, self.max_visits
                );
                diff.truncated = true;
                break;
            }
            if is_known(&hash)? {
                continue;
            }

            diff.missing.insert(hash);
            match source.links_of(&hash)? {
                Some(children) => {
                    queue.extend(children.into_iter().filter(|c| !visited.contains(c)));
                }
                None => {
                    diff.frontier.insert(hash);
                }
            }
        }

        Ok(diff)
    }
}
