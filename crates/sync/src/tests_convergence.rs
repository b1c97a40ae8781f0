//! Replication convergence tests
//!
//! These verify the anti-entropy walk end to end: that two trees of
//! equal shape converge after a replication exchange, that pruning
//! keeps peer reads proportional to divergence, and that a rejected
//! replication applies nothing at all.

use core::cell::Cell;
use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;

type TestTree = ReconciliationTree<u64>;

fn tree(bucket_count: usize) -> TestTree {
    TestTree::with_bucket_count(bucket_count).unwrap()
}

/// A peer view that counts digest reads, to pin down the query bound.
struct CountingView<'a> {
    inner: &'a TestTree,
    digest_reads: Cell<usize>,
    bucket_reads: Cell<usize>,
}

impl<'a> CountingView<'a> {
    fn new(inner: &'a TestTree) -> Self {
        Self {
            inner,
            digest_reads: Cell::new(0),
            bucket_reads: Cell::new(0),
        }
    }
}

impl TreeView<u64> for CountingView<'_> {
    fn depth(&self) -> u32 {
        self.inner.depth()
    }

    fn digest_at(&self, index: usize) -> Digest {
        self.digest_reads.set(self.digest_reads.get() + 1);
        self.inner.digest_at(index)
    }

    fn bucket_at(&self, bucket: usize) -> &BTreeMap<String, u64> {
        self.bucket_reads.set(self.bucket_reads.get() + 1);
        self.inner.bucket_at(bucket)
    }
}

// ============================================================
// Basic Convergence
// ============================================================

#[test]
fn bidirectional_exchange_converges() {
    let mut one = tree(4);
    let mut two = tree(4);

    one.insert(0, "0a", 1).unwrap();
    two.insert(2, "0b", 2).unwrap();
    two.insert(3, "0c", 3).unwrap();
    two.insert(3, "0d", 3).unwrap();
    assert!(!one.equals(&two));

    let first = one.replicate_from(&two).unwrap();
    let second = two.replicate_from(&one).unwrap();

    assert!(one.equals(&two), "exchange must converge the replicas");
    assert!(first > 0, "diverged buckets must have been copied");
    assert_eq!(second, 0, "converged trees have nothing left to copy");

    // Bucket-by-bucket key sets must agree, not just the roots.
    for bucket in 0..one.bucket_count() {
        let left: Vec<&String> = one.bucket_at(bucket).keys().collect();
        let right: Vec<&String> = two.bucket_at(bucket).keys().collect();
        assert_eq!(left, right, "bucket {bucket} key sets must match");
    }
}

#[test]
fn replicate_overwrites_diverged_buckets_wholesale() {
    let mut one = tree(4);
    let two = tree(4);

    one.insert(0, "local-only", 1).unwrap();

    // Bucket replication is a full overwrite, not a per-key merge: the
    // peer's (empty) bucket 0 replaces ours.
    let copied = one.replicate_from(&two).unwrap();

    assert_eq!(copied, 1);
    assert!(one.equals(&two));
    assert_eq!(one.bucket_len(0).unwrap(), 0, "local-only key must be gone");
}

#[test]
fn replicate_from_equal_tree_is_a_noop() {
    let mut one = tree(8);
    let mut two = tree(8);
    one.insert(5, "k", 1).unwrap();
    two.insert(5, "k", 1).unwrap();

    assert_eq!(one.replicate_from(&two).unwrap(), 0);
    assert!(one.equals(&two));
}

#[test]
fn single_bucket_tree_replicates() {
    let mut one = tree(1);
    let mut two = tree(1);
    two.insert(0, "k", 7).unwrap();

    assert_eq!(one.replicate_from(&two).unwrap(), 1);
    assert!(one.equals(&two));
    assert_eq!(*one.retrieve(0, "k").unwrap(), 7);

    assert_eq!(two.replicate_from(&one).unwrap(), 0);
}

// ============================================================
// Shape Mismatch
// ============================================================

#[test]
fn shape_mismatch_is_rejected_without_partial_application() {
    let mut narrow = tree(4);
    let mut wide = tree(8);
    narrow.insert(1, "n", 1).unwrap();
    wide.insert(6, "w", 2).unwrap();
    let root_before = narrow.root();

    let err = narrow.replicate_from(&wide).unwrap_err();

    assert!(matches!(err, SyncError::ShapeMismatch { local: 2, peer: 3 }));
    assert_eq!(narrow.root(), root_before, "rejected replication must apply nothing");
    assert_eq!(*narrow.retrieve(1, "n").unwrap(), 1);
}

// ============================================================
// Pruning
// ============================================================

#[test]
fn copies_only_diverged_buckets() {
    let mut one = tree(16);
    let mut two = tree(16);

    for bucket in 0..16 {
        one.insert(bucket, format!("shared-{bucket}"), 1).unwrap();
        two.insert(bucket, format!("shared-{bucket}"), 1).unwrap();
    }
    two.insert(3, "extra", 2).unwrap();
    two.insert(11, "extra", 2).unwrap();

    let copied = one.replicate_from(&two).unwrap();

    assert_eq!(copied, 2, "only the diverged buckets may be copied");
    assert!(one.equals(&two));
}

#[test]
fn peer_reads_are_bounded_by_divergence() {
    let mut one = tree(64);
    let mut two = tree(64);

    for bucket in 0..64 {
        one.insert(bucket, "shared", 1).unwrap();
        two.insert(bucket, "shared", 1).unwrap();
    }
    two.insert(20, "extra", 2).unwrap();

    let view = CountingView::new(&two);
    let copied = one.replicate_from(&view).unwrap();
    let depth = one.depth() as usize;

    assert_eq!(copied, 1);
    assert_eq!(view.bucket_reads.get(), 1, "exactly the diverged bucket is fetched");
    assert!(
        view.digest_reads.get() <= 2 * depth + 1,
        "digest reads ({}) must stay within one root-to-leaf corridor",
        view.digest_reads.get()
    );
}

// ============================================================
// Randomised Convergence
// ============================================================

#[test]
fn random_trees_converge() {
    let mut rng = StdRng::seed_from_u64(3);
    let mut one = tree(64);
    let mut two = tree(64);

    for i in 0..2_000_u64 {
        let bucket = rng.gen_range(0..64);
        let key = format!("key-{}", rng.gen::<u32>());
        if rng.gen_bool(0.5) {
            one.insert(bucket, key, i).unwrap();
        } else {
            two.insert(bucket, key, i).unwrap();
        }
    }
    assert!(!one.equals(&two), "independent fills should diverge");

    let _copied = one.replicate_from(&two).unwrap();
    assert!(one.equals(&two), "one exchange must fully converge the copier");

    assert_eq!(two.replicate_from(&one).unwrap(), 0);

    for bucket in 0..one.bucket_count() {
        assert_eq!(
            one.bucket_at(bucket),
            two.bucket_at(bucket),
            "bucket {bucket} contents must be identical after convergence"
        );
    }
}
