//! Sparse bloom filters for proximity routing
//!
//! Not a classic membership bloom filter: each key is hashed with BLAKE3
//! and the digest is split into fixed-size chunks, each interpreted as an
//! integer bucket. The union of all buckets, deduplicated and sorted,
//! forms a small fingerprint set used for approximate closeness ranking
//! and content advertisement.

use serde::{Deserialize, Serialize};

/// Size of each digest chunk in bytes. A 32-byte BLAKE3 digest yields
/// eight buckets per key.
const CHUNK_SIZE: usize = 4;

/// A sparse, sorted integer fingerprint set derived from string keys.
///
/// Deterministic and input-order-independent: `Bloom::new(keys)` equals
/// `Bloom::new(shuffle(keys))`. An empty input produces an empty set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bloom(Vec<u64>);

impl Bloom {
    /// Build a bloom from a set of keys.
    pub fn new<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut buckets = Vec::new();
        for key in keys {
            let digest = blake3::hash(key.as_ref());
            for chunk in digest.as_bytes().chunks(CHUNK_SIZE) {
                let mut bytes = [0u8; CHUNK_SIZE];
                bytes.copy_from_slice(chunk);
                buckets.push(u32::from_be_bytes(bytes) as u64);
            }
        }
        buckets.sort_unstable();
        buckets.dedup();
        Bloom(buckets)
    }

    /// Bloom for a single key.
    pub fn from_key(key: impl AsRef<[u8]>) -> Self {
        Self::new([key.as_ref()])
    }

    /// The sorted bucket values.
    pub fn values(&self) -> &[u64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of buckets present in both blooms.
    ///
    /// Both sides are sorted, so this is a linear merge walk.
    pub fn intersection_count(&self, other: &Bloom) -> usize {
        let (mut i, mut j, mut count) = (0, 0, 0);
        while i < self.0.len() && j < other.0.len() {
            match self.0[i].cmp(&other.0[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    count += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        count
    }

    /// Whether this bloom is a superset of `query`.
    ///
    /// True when the intersection covers every bucket of `query`. An empty
    /// query matches everything.
    pub fn contains(&self, query: &Bloom) -> bool {
        self.intersection_count(query) == query.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_empty_bloom() {
        let bloom = Bloom::new(Vec::<&str>::new());
        assert!(bloom.is_empty());
        assert_eq!(bloom.values(), &[] as &[u64]);
    }

    #[test]
    fn test_deterministic_across_calls() {
        let a = Bloom::new(["foo", "bar", "baz"]);
        let b = Bloom::new(["foo", "bar", "baz"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_order_independence() {
        let a = Bloom::new(["foo", "bar", "baz"]);
        let b = Bloom::new(["baz", "foo", "bar"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_duplicate_keys_collapse() {
        let a = Bloom::new(["foo"]);
        let b = Bloom::new(["foo", "foo", "foo"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_values_sorted_and_deduped() {
        let bloom = Bloom::new(["a", "b", "c", "d"]);
        let values = bloom.values();
        for pair in values.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_self_intersection_covers_all() {
        let bloom = Bloom::new(["some", "content", "keys"]);
        assert_eq!(bloom.intersection_count(&bloom), bloom.len());
        assert!(bloom.contains(&bloom));
    }

    #[test]
    fn test_superset_match() {
        let full = Bloom::new(["x", "y", "z"]);
        let query = Bloom::new(["y"]);
        assert!(full.contains(&query));
        assert!(!query.contains(&full));
    }

    #[test]
    fn test_disjoint_keys_do_not_match() {
        let a = Bloom::new(["content-x"]);
        let b = Bloom::new(["content-y"]);
        // Chunk collisions are possible in principle but not for these keys.
        assert!(!a.contains(&b));
        assert!(!b.contains(&a));
    }

    #[test]
    fn test_empty_query_matches_everything() {
        let full = Bloom::new(["x"]);
        let empty = Bloom::default();
        assert!(full.contains(&empty));
        assert!(empty.contains(&empty));
    }

    #[test]
    fn test_buckets_per_key() {
        // One key, 32-byte digest, 4-byte chunks: at most 8 buckets.
        let bloom = Bloom::from_key("single");
        assert!(bloom.len() <= 8);
        assert!(!bloom.is_empty());
    }
}
