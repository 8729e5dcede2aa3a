//! Consistent routing of series to a fixed set of storage shards.
//!
//! A series is identified by its `(tenant, ordered labels)` fingerprint.
//! The fingerprint bytes are hashed with xxhash-64 and reduced to a shard
//! index with the jump consistent hash algorithm, giving a deterministic,
//! well-balanced placement for any fixed shard count.
//!
//! The router is deliberately not rebalance-safe: reordering labels or
//! changing the shard count moves series between shards. Callers
//! canonicalize label order before routing, and the shard set is fixed
//! for the lifetime of the process.

#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(missing_debug_implementations, clippy::clone_on_ref_ptr)]

use data_types::{marshal_metric_name_raw, Label, MetricNameError, Tenant};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// Maps an opaque `u64` key to one of a fixed set of shards using the
/// jump consistent hash algorithm (Lamping & Veach).
///
/// Jump hash distributes keys uniformly and, when the shard count grows
/// from `n` to `n+1`, moves only `1/(n+1)` of keys (all onto the new
/// shard). This implementation never resizes; the property matters only
/// for operators replacing the whole cluster configuration.
#[derive(Debug)]
pub struct JumpHash<T> {
    shards: Vec<T>,
}

impl<T> JumpHash<T> {
    /// Initialise a `JumpHash` that consistently maps keys to one of
    /// `shards`.
    ///
    /// # Panics
    ///
    /// Panics if `shards` is empty.
    pub fn new(shards: impl IntoIterator<Item = T>) -> Self {
        let shards: Vec<_> = shards.into_iter().collect();
        assert!(!shards.is_empty(), "at least one shard is required");
        Self { shards }
    }

    /// Consistently returns the shard for `key`.
    pub fn hash(&self, key: u64) -> &T {
        &self.shards[jump_hash(key, self.shards.len() as u32) as usize]
    }

    /// Consistently returns the shard index for `key`.
    pub fn index(&self, key: u64) -> usize {
        jump_hash(key, self.shards.len() as u32) as usize
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn shards(&self) -> &[T] {
        &self.shards
    }
}

/// The jump consistent hash reduction of `key` to `[0, buckets)`.
///
/// `buckets` must be non-zero.
fn jump_hash(mut key: u64, buckets: u32) -> u32 {
    debug_assert!(buckets > 0);
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * ((1u64 << 31) as f64 / ((key >> 33).wrapping_add(1) as f64)))
            as i64;
    }
    b as u32
}

/// Hashes the canonical `(tenant, labels)` fingerprint with xxhash-64.
///
/// `fingerprint_buf` is caller-provided scratch so per-row routing does
/// not allocate; its contents are replaced.
pub fn fingerprint(
    tenant: Tenant,
    labels: &[Label],
    fingerprint_buf: &mut Vec<u8>,
) -> Result<u64, MetricNameError> {
    fingerprint_buf.clear();
    marshal_metric_name_raw(fingerprint_buf, tenant, labels)?;
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(fingerprint_buf);
    Ok(hasher.finish())
}

/// Returns the shard index for a series.
///
/// Fast path: a single-shard cluster always routes to index 0 without
/// hashing.
pub fn shard_index(
    tenant: Tenant,
    labels: &[Label],
    fingerprint_buf: &mut Vec<u8>,
    shard_count: usize,
) -> Result<usize, MetricNameError> {
    assert!(shard_count > 0, "at least one shard is required");
    if shard_count == 1 {
        return Ok(0);
    }
    let key = fingerprint(tenant, labels, fingerprint_buf)?;
    Ok(jump_hash(key, shard_count as u32) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn labels(pairs: &[(&str, &str)]) -> Vec<Label> {
        pairs.iter().map(|(n, v)| Label::new(*n, *v)).collect()
    }

    #[test]
    fn single_bucket_is_always_zero() {
        for key in [0, 1, u64::MAX, 0xdead_beef] {
            assert_eq!(jump_hash(key, 1), 0);
        }
    }

    #[test]
    fn jump_is_within_bounds_and_deterministic() {
        for key in 0..1_000u64 {
            let a = jump_hash(key, 7);
            let b = jump_hash(key, 7);
            assert_eq!(a, b);
            assert!(a < 7);
        }
    }

    #[test]
    fn jump_moves_keys_only_to_the_new_bucket() {
        // The defining property of jump hash: growing from n to n+1
        // buckets either keeps a key in place or moves it to bucket n.
        for n in 1..10u32 {
            for key in 0..500u64 {
                let before = jump_hash(key, n);
                let after = jump_hash(key, n + 1);
                assert!(after == before || after == n, "key {key} jumped {before} -> {after} at n={n}");
            }
        }
    }

    #[test]
    fn jump_spreads_keys_over_all_buckets() {
        let buckets = 8;
        let mut seen = HashSet::new();
        for key in 0..10_000u64 {
            seen.insert(jump_hash(key, buckets));
        }
        assert_eq!(seen.len(), buckets as usize);
    }

    #[test]
    fn shard_index_is_stable_for_identical_series() {
        let tenant = Tenant::new(1, 2);
        let series = labels(&[("", "cpu"), ("host", "a")]);
        let mut buf = Vec::new();

        for shard_count in [1, 2, 3, 16] {
            let first = shard_index(tenant, &series, &mut buf, shard_count).unwrap();
            for _ in 0..10 {
                let again = shard_index(tenant, &series, &mut buf, shard_count).unwrap();
                assert_eq!(first, again);
                assert!(again < shard_count);
            }
        }
    }

    #[test]
    fn shard_index_single_shard_fast_path() {
        let mut buf = Vec::new();
        let idx = shard_index(Tenant::new(1, 0), &labels(&[("", "m")]), &mut buf, 1).unwrap();
        assert_eq!(idx, 0);
        // The fast path never touches the scratch buffer.
        assert!(buf.is_empty());
    }

    #[test]
    fn shard_index_depends_on_label_order() {
        let tenant = Tenant::new(1, 0);
        let a = labels(&[("a", "1"), ("b", "2")]);
        let b = labels(&[("b", "2"), ("a", "1")]);
        let mut buf = Vec::new();

        let fp_a = fingerprint(tenant, &a, &mut buf).unwrap();
        let fp_b = fingerprint(tenant, &b, &mut buf).unwrap();
        assert_ne!(fp_a, fp_b);
    }

    #[test]
    fn jump_hash_shard_lookup() {
        let jump = JumpHash::new(["a", "b", "c"]);
        assert_eq!(jump.len(), 3);
        let shard = jump.hash(42);
        // Deterministic: the same key always lands on the same shard.
        assert_eq!(jump.hash(42), shard);
        assert_eq!(&jump.shards()[jump.index(42)], shard);
    }

    #[test]
    #[should_panic(expected = "at least one shard is required")]
    fn empty_shard_set_panics() {
        let _ = JumpHash::<usize>::new([]);
    }
}
