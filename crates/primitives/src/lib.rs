//! Shared primitives for the tessera partitioning and reconciliation core.
//!
//! The single type that matters here is [`Digest`]: the fixed-width,
//! totally ordered output space that doubles as the keyspace of the
//! partition ring (node and key positions) and as the summary space of
//! the reconciliation tree (leaf and ancestor digests). Every peer must
//! derive digests through this crate; mixing digest functions across
//! peers breaks cross-instance equality comparison.

pub mod digest;

pub use digest::Digest;
