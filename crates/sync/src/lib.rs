//! Merkle digest tree for replica reconciliation
//!
//! A node's local buckets are summarised by a complete binary tree of
//! digests stored as a flat array in heap order: leaves digest bucket
//! contents, every internal digest combines its two children, and the
//! root summarises the whole data set. Two replicas compare roots in
//! O(1); when roots differ, a top-down walk descends only into subtrees
//! whose digests disagree, so the data actually transferred is
//! proportional to the number of diverged buckets rather than the full
//! data set. That pruning is the tree's reason for existing.
//!
//! ## Core Concepts
//!
//! - **Bucket**: a fixed partition of the local key space, the atomic
//!   unit of digesting and replication
//! - **TreeView**: the read-only interface a peer exposes (digest at an
//!   index, bucket contents); in deployment each call is a network
//!   round trip, so the walk is what bounds query count
//! - **Anti-entropy**: [`ReconciliationTree::replicate_from`] repairs
//!   diverged buckets wholesale from the peer's view
//!
//! The tree's shape (depth, bucket count) is fixed at construction;
//! only bucket contents mutate. Every mutation recomputes the touched
//! leaf and its ancestors, so ancestors are never stale.

use std::collections::BTreeMap;
use std::io;

use borsh::BorshSerialize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use tessera_primitives::Digest;

#[cfg(test)]
mod tests_convergence;

/// Default number of buckets a tree is built over.
pub const DEFAULT_BUCKET_COUNT: usize = 128;

/// Tree sizing knobs, loadable from the configuration file.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct TreeConfig {
    /// Requested bucket count; rounded up to a power of two at
    /// construction so leaves map 1:1 to buckets.
    pub bucket_count: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            bucket_count: DEFAULT_BUCKET_COUNT,
        }
    }
}

/// Errors produced by tree operations.
///
/// All of these are synchronous and recoverable; validation precedes
/// mutation, so an `Err` return never leaves partial state behind.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The bucket id is outside the configured range.
    #[error("bucket {bucket} out of range (bucket count {count})")]
    OutOfRange {
        /// Offending bucket id.
        bucket: usize,
        /// Configured bucket count.
        count: usize,
    },

    /// The key is absent from the addressed bucket.
    #[error("key not found in bucket {bucket}: {key}")]
    KeyNotFound {
        /// Addressed bucket.
        bucket: usize,
        /// Missing key.
        key: String,
    },

    /// Replication between differently shaped trees.
    #[error("tree shapes differ: local depth {local}, peer depth {peer}")]
    ShapeMismatch {
        /// Local tree depth.
        local: u32,
        /// Peer tree depth.
        peer: u32,
    },

    /// Bucket contents failed to serialise for digesting.
    #[error("failed to serialise bucket contents: {0}")]
    Serialization(#[from] io::Error),
}

/// Read-only view of a digest tree, the sole cross-instance interface.
///
/// [`ReconciliationTree::replicate_from`] drives reconciliation purely
/// through this trait, so `other` may be a local tree or a proxy for a
/// remote peer; either way it is treated as a read-only snapshot and
/// every call is potentially a network round trip.
pub trait TreeView<V> {
    /// Tree depth: the leaf row's distance from the root.
    fn depth(&self) -> u32;

    /// Digest at `index` in heap order; `index` must be within the
    /// tree's node count.
    fn digest_at(&self, index: usize) -> Digest;

    /// Contents of `bucket`; `bucket` must be within the bucket count.
    fn bucket_at(&self, bucket: usize) -> &BTreeMap<String, V>;
}

/// A complete binary digest tree over a node's local buckets.
///
/// Digests live in a flat array in heap order (children of `i` at
/// `2i + 1` and `2i + 2`); the leaf row starts at `2^depth - 1` and
/// leaf `i` summarises bucket `i`. Leaf digests hash the canonical
/// borsh encoding of the bucket's `BTreeMap`, which is independent of
/// insertion order; internal digests combine children positionally.
#[derive(Clone, Debug)]
pub struct ReconciliationTree<V> {
    /// Digests in heap order, `2^(depth + 1) - 1` entries.
    digests: Vec<Digest>,

    /// Bucket contents, `2^depth` entries.
    buckets: Vec<BTreeMap<String, V>>,

    /// Leaf row distance from the root.
    depth: u32,

    /// Index of the first leaf, `2^depth - 1`.
    leaf_offset: usize,
}

impl<V: BorshSerialize> ReconciliationTree<V> {
    /// Builds an empty tree per `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the empty bucket encoding fails to
    /// serialise.
    pub fn new(config: TreeConfig) -> Result<Self, SyncError> {
        Self::with_bucket_count(config.bucket_count)
    }

    /// Builds an empty tree over `bucket_count` buckets, rounded up to
    /// a power of two (a count of zero is treated as one).
    ///
    /// Freshly built trees of equal shape have equal roots.
    ///
    /// # Errors
    ///
    /// Returns an error if the empty bucket encoding fails to
    /// serialise.
    pub fn with_bucket_count(bucket_count: usize) -> Result<Self, SyncError> {
        let depth = bucket_count.max(1).next_power_of_two().trailing_zeros();
        let leaf_count = 1_usize << depth;
        let leaf_offset = leaf_count - 1;

        let buckets: Vec<BTreeMap<String, V>> = (0..leaf_count).map(|_| BTreeMap::new()).collect();
        let empty = Digest::of_borsh(&buckets[0])?;

        let mut digests = vec![Digest::default(); 2 * leaf_count - 1];
        for digest in &mut digests[leaf_offset..] {
            *digest = empty;
        }
        for index in (0..leaf_offset).rev() {
            digests[index] = Digest::combine(&digests[2 * index + 1], &digests[2 * index + 2]);
        }

        Ok(Self {
            digests,
            buckets,
            depth,
            leaf_offset,
        })
    }

    /// Inserts (or replaces) a key in a bucket and refreshes the digest
    /// path up to the root, O(depth).
    ///
    /// # Errors
    ///
    /// [`SyncError::OutOfRange`] if `bucket` is outside the tree.
    pub fn insert(&mut self, bucket: usize, key: impl Into<String>, value: V) -> Result<(), SyncError> {
        self.check_bucket(bucket)?;
        let _previous = self.buckets[bucket].insert(key.into(), value);
        self.rehash_path(bucket)
    }

    /// Removes a key from a bucket and refreshes the digest path up to
    /// the root, O(depth).
    ///
    /// # Errors
    ///
    /// [`SyncError::OutOfRange`] if `bucket` is outside the tree;
    /// [`SyncError::KeyNotFound`] if the key is absent.
    pub fn remove(&mut self, bucket: usize, key: &str) -> Result<V, SyncError> {
        self.check_bucket(bucket)?;
        let value = self.buckets[bucket]
            .remove(key)
            .ok_or_else(|| SyncError::KeyNotFound {
                bucket,
                key: key.to_owned(),
            })?;
        self.rehash_path(bucket)?;
        Ok(value)
    }

    /// Recomputes the leaf digest for `bucket` and every ancestor up to
    /// the root, deepest first.
    fn rehash_path(&mut self, bucket: usize) -> Result<(), SyncError> {
        let mut index = self.leaf_offset + bucket;
        self.digests[index] = Digest::of_borsh(&self.buckets[bucket])?;
        while index > 0 {
            index = (index - 1) / 2;
            self.digests[index] =
                Digest::combine(&self.digests[2 * index + 1], &self.digests[2 * index + 2]);
        }
        Ok(())
    }

    /// Repairs this tree's diverged buckets from a peer's view.
    ///
    /// No-op when the roots already match. Otherwise walks top-down
    /// with an explicit stack (depth is configuration-controlled, the
    /// call stack must not grow with it), pruning every subtree whose
    /// digests agree and descending into both children where they do
    /// not. Each diverged leaf's bucket is overwritten wholesale from
    /// the peer — bucket granularity, not a per-key diff. Visited
    /// ancestors are recomputed deepest-first after the walk, so a
    /// parent finalises only after both children have.
    ///
    /// Peer reads are bounded by O(diverged leaves × depth).
    ///
    /// Returns the number of buckets copied.
    ///
    /// # Errors
    ///
    /// [`SyncError::ShapeMismatch`] if the shapes differ; nothing is
    /// applied in that case.
    pub fn replicate_from<T: TreeView<V>>(&mut self, other: &T) -> Result<usize, SyncError>
    where
        V: Clone,
    {
        if other.depth() != self.depth {
            return Err(SyncError::ShapeMismatch {
                local: self.depth,
                peer: other.depth(),
            });
        }
        if self.digests[0] == other.digest_at(0) {
            debug!("roots match; nothing to reconcile");
            return Ok(0);
        }

        // Single-bucket tree: the root is the leaf.
        if self.depth == 0 {
            self.buckets[0] = other.bucket_at(0).clone();
            self.digests[0] = Digest::of_borsh(&self.buckets[0])?;
            info!(buckets = 1, "reconciled from peer");
            return Ok(1);
        }

        let mut stack = vec![0_usize];
        let mut visited = vec![0_usize];
        let mut copied = 0_usize;

        while let Some(index) = stack.pop() {
            for child in [2 * index + 1, 2 * index + 2] {
                if self.digests[child] == other.digest_at(child) {
                    continue;
                }
                if child >= self.leaf_offset {
                    let bucket = child - self.leaf_offset;
                    self.buckets[bucket] = other.bucket_at(bucket).clone();
                    self.digests[child] = Digest::of_borsh(&self.buckets[bucket])?;
                    copied += 1;
                    debug!(bucket, "bucket replaced from peer");
                } else {
                    visited.push(child);
                    stack.push(child);
                }
            }
        }

        // Deeper heap indices are numerically larger, so descending
        // index order finalises children before parents.
        visited.sort_unstable_by(|a, b| b.cmp(a));
        for index in visited {
            self.digests[index] =
                Digest::combine(&self.digests[2 * index + 1], &self.digests[2 * index + 2]);
        }

        info!(buckets = copied, "reconciled from peer");
        Ok(copied)
    }
}

impl<V> ReconciliationTree<V> {
    /// Root digest, summarising the whole data set.
    #[must_use]
    pub fn root(&self) -> Digest {
        self.digests[0]
    }

    /// Number of buckets (always a power of two).
    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Content equality by root digest: guaranteed to detect a
    /// mismatch, equal only up to digest collision.
    #[must_use]
    pub fn equals<T: TreeView<V>>(&self, other: &T) -> bool {
        self.digests[0] == other.digest_at(0)
    }

    /// Looks up a key in a bucket.
    ///
    /// # Errors
    ///
    /// [`SyncError::OutOfRange`] if `bucket` is outside the tree;
    /// [`SyncError::KeyNotFound`] if the key is absent.
    pub fn retrieve(&self, bucket: usize, key: &str) -> Result<&V, SyncError> {
        self.check_bucket(bucket)?;
        self.buckets[bucket]
            .get(key)
            .ok_or_else(|| SyncError::KeyNotFound {
                bucket,
                key: key.to_owned(),
            })
    }

    /// Number of keys in a bucket.
    ///
    /// # Errors
    ///
    /// [`SyncError::OutOfRange`] if `bucket` is outside the tree.
    pub fn bucket_len(&self, bucket: usize) -> Result<usize, SyncError> {
        self.check_bucket(bucket)?;
        Ok(self.buckets[bucket].len())
    }

    /// Validates a bucket id against the configured range.
    fn check_bucket(&self, bucket: usize) -> Result<(), SyncError> {
        if bucket >= self.buckets.len() {
            return Err(SyncError::OutOfRange {
                bucket,
                count: self.buckets.len(),
            });
        }
        Ok(())
    }
}

impl<V> TreeView<V> for ReconciliationTree<V> {
    fn depth(&self) -> u32 {
        self.depth
    }

    fn digest_at(&self, index: usize) -> Digest {
        self.digests[index]
    }

    fn bucket_at(&self, bucket: usize) -> &BTreeMap<String, V> {
        &self.buckets[bucket]
    }
}
