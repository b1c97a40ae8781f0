//! Consistent-hash partition ring
//!
//! This crate answers "which node owns a key" for a distributed
//! key-value store. Nodes are placed on a circular keyspace at the
//! digest of their identifier; a key belongs to the first node whose
//! position is strictly greater than the key's digest, wrapping to the
//! first node past the end. Membership changes move only the keys in
//! the affected arc, which is the whole point of consistent hashing.
//!
//! ## Core Concepts
//!
//! - **Node**: an identifier, its derived ring position, and a
//!   capacity-bounded local key-value store
//! - **PartitionRing**: the strictly position-sorted node sequence,
//!   key routing, and data migration on join/leave
//! - **Clockwise successor**: the next node in sorted order, wrapping
//!   to the first; add and remove share this one definition so handoff
//!   ranges never overlap or gap
//!
//! The ring owns its nodes, so every topology mutation is a single
//! critical section behind `&mut self`; membership decisions themselves
//! (failure detection, gossip) live outside this crate and merely call
//! [`PartitionRing::add_node`] / [`PartitionRing::remove_node`].

use core::fmt::Debug;
use core::mem::take;
use std::collections::BTreeMap;
use std::io;

use borsh::BorshSerialize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use tessera_primitives::Digest;


/// Default bound on the number of keys a single node will hold.
pub const DEFAULT_NODE_CAPACITY: usize = 100_000;

/// Default bound on the number of nodes the ring will hold.
pub const DEFAULT_RING_CAPACITY: usize = 100;

/// Ring sizing knobs, loadable from the configuration file.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct RingConfig {
    /// Maximum number of nodes on the ring.
    pub ring_capacity_bound: usize,

    /// Maximum number of keys per node.
    pub node_capacity_bound: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring_capacity_bound: DEFAULT_RING_CAPACITY,
            node_capacity_bound: DEFAULT_NODE_CAPACITY,
        }
    }
}

/// Errors produced by ring and node operations.
///
/// All of these are synchronous, raised at the point of violation, and
/// recoverable; validation precedes mutation, so an `Err` return never
/// leaves partial state behind.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RingError {
    /// The routed key is absent from its owning node.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// No node with the given identifier is on the ring.
    #[error("node not found on the ring")]
    NodeNotFound,

    /// The ring has no nodes to route to.
    #[error("ring has no nodes")]
    EmptyRing,

    /// The key already exists and no overwrite was requested.
    #[error("key already exists: {0}")]
    DuplicateKey(String),

    /// A node already occupies this ring position.
    #[error("ring position already occupied: {0}")]
    DuplicatePosition(Digest),

    /// A node reached its key bound.
    #[error("node key capacity reached ({0})")]
    NodeCapacityExceeded(usize),

    /// The ring reached its node bound.
    #[error("ring node capacity reached ({0})")]
    RingCapacityExceeded(usize),

    /// A node identifier failed to serialise for position derivation.
    #[error("failed to serialise node identifier: {0}")]
    Serialization(#[from] io::Error),
}

/// A storage node on the partition ring.
///
/// The position is the digest of the identifier, computed once at
/// construction; it is a pure function of the identifier and never
/// recomputed, so it cannot drift from the ring's sort order.
#[derive(Clone, Debug)]
pub struct Node<I, V> {
    /// Stable, unique identifier supplied by the membership layer.
    id: I,

    /// Ring position, `Digest::of_borsh(&id)`.
    position: Digest,

    /// Local key-value store.
    data: BTreeMap<String, V>,

    /// Bound on `data.len()`.
    capacity: usize,
}

impl<I: BorshSerialize, V> Node<I, V> {
    /// Creates a node with the default key capacity.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier fails to serialise.
    pub fn new(id: I) -> Result<Self, RingError> {
        Self::with_capacity(id, DEFAULT_NODE_CAPACITY)
    }

    /// Creates a node bounded at `capacity` keys.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier fails to serialise.
    pub fn with_capacity(id: I, capacity: usize) -> Result<Self, RingError> {
        let position = Digest::of_borsh(&id)?;
        Ok(Self {
            id,
            position,
            data: BTreeMap::new(),
            capacity,
        })
    }
}

impl<I, V> Node<I, V> {
    /// The node's identifier.
    pub fn id(&self) -> &I {
        &self.id
    }

    /// The node's ring position.
    #[must_use]
    pub fn position(&self) -> Digest {
        self.position
    }

    /// Number of keys held locally.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the node holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The node's key bound.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the node holds `key`.
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Looks up a locally held value.
    ///
    /// # Errors
    ///
    /// [`RingError::KeyNotFound`] if the key is absent.
    pub fn retrieve(&self, key: &str) -> Result<&V, RingError> {
        self.data
            .get(key)
            .ok_or_else(|| RingError::KeyNotFound(key.to_owned()))
    }

    /// Stores a value locally.
    ///
    /// # Errors
    ///
    /// [`RingError::NodeCapacityExceeded`] if a new key would push the
    /// node past its bound; [`RingError::DuplicateKey`] if the key
    /// exists and `overwrite` is false.
    pub fn store(&mut self, key: impl Into<String>, value: V, overwrite: bool) -> Result<(), RingError> {
        let key = key.into();
        if self.data.contains_key(&key) {
            if !overwrite {
                return Err(RingError::DuplicateKey(key));
            }
        } else if self.data.len() >= self.capacity {
            return Err(RingError::NodeCapacityExceeded(self.capacity));
        }
        let _previous = self.data.insert(key, value);
        Ok(())
    }

    /// Deletes a locally held value.
    ///
    /// # Errors
    ///
    /// [`RingError::KeyNotFound`] if the key is absent.
    pub fn delete(&mut self, key: &str) -> Result<V, RingError> {
        self.data
            .remove(key)
            .ok_or_else(|| RingError::KeyNotFound(key.to_owned()))
    }

    /// Iterates the locally held entries in key order.
    pub fn entries(&self) -> impl Iterator<Item = (&String, &V)> {
        self.data.iter()
    }

    /// Takes all locally held entries, leaving the node empty. Used for
    /// handoff when the node leaves the ring.
    pub fn drain(&mut self) -> BTreeMap<String, V> {
        take(&mut self.data)
    }
}

/// A consistent-hash ring of nodes, strictly sorted by position.
#[derive(Debug)]
pub struct PartitionRing<I, V> {
    /// Nodes in strictly ascending position order; no two share a
    /// position.
    nodes: Vec<Node<I, V>>,

    /// Sizing bounds.
    config: RingConfig,
}

impl<I, V> Default for PartitionRing<I, V> {
    fn default() -> Self {
        Self::new(RingConfig::default())
    }
}

impl<I, V> PartitionRing<I, V> {
    /// Creates an empty ring with the given bounds.
    #[must_use]
    pub fn new(config: RingConfig) -> Self {
        Self {
            nodes: Vec::new(),
            config,
        }
    }

    /// Number of nodes on the ring.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the ring has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Total key count across all nodes.
    ///
    /// Conserved by [`add_node`](Self::add_node) and
    /// [`remove_node`](Self::remove_node) (except when the last node
    /// leaves, see there).
    #[must_use]
    pub fn total_keys(&self) -> usize {
        self.nodes.iter().map(Node::len).sum()
    }

    /// Iterates the nodes in ascending position order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node<I, V>> {
        self.nodes.iter()
    }

    /// Position of a routed key in the ring keyspace.
    #[must_use]
    pub fn key_position(key: &str) -> Digest {
        Digest::of_bytes(key.as_bytes())
    }

    /// Index of the node owning `position`: the first node strictly
    /// past it, wrapping to the first node (circular topology).
    fn owner_index(&self, position: Digest) -> Result<usize, RingError> {
        if self.nodes.is_empty() {
            return Err(RingError::EmptyRing);
        }
        let index = self.nodes.partition_point(|node| node.position <= position);
        Ok(if index == self.nodes.len() { 0 } else { index })
    }

    /// Mutable access to two distinct nodes at once, for handoffs.
    fn node_pair_mut(&mut self, first: usize, second: usize) -> (&mut Node<I, V>, &mut Node<I, V>) {
        debug_assert_ne!(first, second, "handoff needs two distinct nodes");
        if first < second {
            let (left, right) = self.nodes.split_at_mut(second);
            (&mut left[first], &mut right[0])
        } else {
            let (left, right) = self.nodes.split_at_mut(first);
            (&mut right[0], &mut left[second])
        }
    }
}

impl<I, V> PartitionRing<I, V>
where
    I: BorshSerialize + Eq + Debug,
{
    /// Whether a node with this identifier is on the ring.
    #[must_use]
    pub fn contains(&self, id: &I) -> bool {
        self.nodes.iter().any(|node| node.id == *id)
    }

    /// Adds a node to the ring and migrates its arc from the clockwise
    /// successor.
    ///
    /// Every key on the successor that the new node now owns (hashed
    /// position in the arc between the new node's predecessor and the
    /// new node, wrapping at the ends of the keyspace) moves to the new
    /// node. Total key count across the ring is conserved.
    ///
    /// # Errors
    ///
    /// [`RingError::RingCapacityExceeded`] at the node bound;
    /// [`RingError::DuplicatePosition`] on a position collision;
    /// [`RingError::NodeCapacityExceeded`] if the migrated arc does not
    /// fit in the new node. Nothing is migrated on any error.
    pub fn add_node(&mut self, mut node: Node<I, V>) -> Result<(), RingError> {
        if self.nodes.len() >= self.config.ring_capacity_bound {
            return Err(RingError::RingCapacityExceeded(self.config.ring_capacity_bound));
        }

        let index = match self
            .nodes
            .binary_search_by(|probe| probe.position.cmp(&node.position))
        {
            Ok(_) => return Err(RingError::DuplicatePosition(node.position)),
            Err(index) => index,
        };

        let mut migrated = 0_usize;
        if !self.nodes.is_empty() {
            // The new node's arc: positions in (predecessor, new]. When
            // the new node becomes the smallest, its arc wraps and also
            // covers everything past the largest existing position.
            // Migrating plain `<= new position` would strand the
            // successor's wrapped keys on the wrong node.
            let predecessor = index.checked_sub(1).map(|i| self.nodes[i].position);
            let largest = self.nodes[self.nodes.len() - 1].position;
            let in_arc = |position: Digest| match predecessor {
                Some(predecessor) => position > predecessor && position <= node.position,
                None => position <= node.position || position > largest,
            };

            // The clockwise successor in the post-insert order: the node
            // currently at the insertion index, wrapping to the first.
            let successor = if index == self.nodes.len() { 0 } else { index };
            let source = &mut self.nodes[successor];

            let moving: Vec<String> = source
                .data
                .keys()
                .filter(|key| in_arc(Self::key_position(key)))
                .cloned()
                .collect();

            if node.data.len() + moving.len() > node.capacity {
                return Err(RingError::NodeCapacityExceeded(node.capacity));
            }

            for key in moving {
                if let Some(value) = source.data.remove(&key) {
                    let _previous = node.data.insert(key, value);
                    migrated += 1;
                }
            }
        }

        info!(node = ?node.id, position = %node.position, migrated, "node joined the ring");
        self.nodes.insert(index, node);
        Ok(())
    }

    /// Removes a node, handing all its keys to the clockwise successor.
    ///
    /// Handoff collisions (the successor already holds a key being
    /// moved) are resolved in favour of the departing owner's copy: the
    /// departing node was the routing owner of those keys, so its copy
    /// is authoritative. Removing the last node discards its keys, as
    /// there is no successor left to hold them.
    ///
    /// # Errors
    ///
    /// [`RingError::NodeNotFound`] if the node is absent;
    /// [`RingError::NodeCapacityExceeded`] if the successor cannot
    /// absorb the handoff. Nothing is moved on any error.
    pub fn remove_node(&mut self, id: &I) -> Result<(), RingError> {
        let position = Digest::of_borsh(id)?;
        let index = self
            .nodes
            .binary_search_by(|probe| probe.position.cmp(&position))
            .map_err(|_| RingError::NodeNotFound)?;
        if self.nodes[index].id != *id {
            return Err(RingError::NodeNotFound);
        }

        if self.nodes.len() == 1 {
            let node = self.nodes.remove(index);
            if !node.is_empty() {
                warn!(
                    node = ?node.id,
                    dropped = node.len(),
                    "removed the last node; its keys have no successor"
                );
            }
            return Ok(());
        }

        let successor = (index + 1) % self.nodes.len();
        let (departing, target) = self.node_pair_mut(index, successor);

        let fresh = departing
            .data
            .keys()
            .filter(|key| !target.data.contains_key(*key))
            .count();
        if target.data.len() + fresh > target.capacity {
            return Err(RingError::NodeCapacityExceeded(target.capacity));
        }

        let mut overwritten = 0_usize;
        for (key, value) in departing.drain() {
            if target.data.insert(key, value).is_some() {
                overwritten += 1;
            }
        }
        if overwritten > 0 {
            warn!(overwritten, "handoff overwrote keys already held by the successor");
        }

        let node = self.nodes.remove(index);
        info!(node = ?node.id, position = %node.position, "node left the ring");
        Ok(())
    }

    /// Looks up a value on whichever node owns the key.
    ///
    /// # Errors
    ///
    /// [`RingError::EmptyRing`] with no nodes;
    /// [`RingError::KeyNotFound`] if the owning node lacks the key.
    pub fn get_data(&self, key: &str) -> Result<&V, RingError> {
        let index = self.owner_index(Self::key_position(key))?;
        self.nodes[index].retrieve(key)
    }

    /// Stores a value on whichever node owns the key.
    ///
    /// # Errors
    ///
    /// [`RingError::EmptyRing`] with no nodes;
    /// [`RingError::NodeCapacityExceeded`] if the owning node is full;
    /// [`RingError::DuplicateKey`] if the key exists and `overwrite` is
    /// false.
    pub fn set_data(&mut self, key: impl Into<String>, value: V, overwrite: bool) -> Result<(), RingError> {
        let key = key.into();
        let index = self.owner_index(Self::key_position(&key))?;
        debug!(node = ?self.nodes[index].id, key = %key, "routing set");
        self.nodes[index].store(key, value, overwrite)
    }

    /// Deletes a value from whichever node owns the key.
    ///
    /// # Errors
    ///
    /// [`RingError::EmptyRing`] with no nodes;
    /// [`RingError::KeyNotFound`] if the owning node lacks the key.
    pub fn remove_data(&mut self, key: &str) -> Result<V, RingError> {
        let index = self.owner_index(Self::key_position(key))?;
        self.nodes[index].delete(key)
    }

    /// The node that owns `key`, if any.
    #[must_use]
    pub fn owner_of(&self, key: &str) -> Option<&Node<I, V>> {
        let index = self.owner_index(Self::key_position(key)).ok()?;
        self.nodes.get(index)
    }
}
