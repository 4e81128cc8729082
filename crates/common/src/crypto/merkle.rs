//! Bucketed Merkle tree over the set of data entry hashes.
//!
//! The 256-bit hash space is split into `num_buckets` equal-width ranges;
//! each bucket holds its hashes sorted ascending. The tree root summarizes
//! the whole multiset and is what updates carry as `data_hash`. Peers with
//! the same entries and the same bucket count always compute identical
//! bucket hashes and root, which is what the sync diff relies on.

use super::{Hash32, HASH_SIZE};

/// Target number of hashes per bucket.
pub const HASHES_PER_BUCKET: usize = 10;

// Rebuild with more buckets when avg > HASHES_PER_BUCKET * 2, with fewer
// when avg < HASHES_PER_BUCKET / 4.
const REBUILD_UPPER_MULTIPLIER: usize = 2;
const REBUILD_LOWER_DIVISOR: usize = 4;

/// Which bucket a hash belongs to, for a given bucket count.
pub fn bucket_index(hash: &Hash32, num_buckets: usize) -> usize {
    if num_buckets <= 1 {
        return 0;
    }
    let width = bucket_width(num_buckets);
    // The quotient hash / width is at most num_buckets, so a binary search
    // over k * width stays cheap and exact.
    let mut lo = 0usize;
    let mut hi = num_buckets;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        match mul_width(&width, mid as u64) {
            Some(bound) if bound <= hash.0 => lo = mid,
            _ => hi = mid - 1,
        }
    }
    lo.min(num_buckets - 1)
}

/// The half-open hash range `[start, end)` covered by a bucket. `None` for
/// the end means the range extends to the top of the hash space (the last
/// bucket absorbs the division remainder).
pub fn bucket_range(index: usize, num_buckets: usize) -> ([u8; HASH_SIZE], Option<[u8; HASH_SIZE]>) {
    if num_buckets <= 1 {
        return ([0u8; HASH_SIZE], None);
    }
    let width = bucket_width(num_buckets);
    let start = mul_width(&width, index as u64).unwrap_or([0u8; HASH_SIZE]);
    let end = if index == num_buckets - 1 {
        None
    } else {
        mul_width(&width, index as u64 + 1)
    };
    (start, end)
}

// floor(2^256 / num_buckets) as a big-endian 32-byte integer, computed by
// byte-wise long division. Only valid for num_buckets >= 2.
fn bucket_width(num_buckets: usize) -> [u8; HASH_SIZE] {
    let divisor = num_buckets as u128;
    let mut quotient = [0u8; HASH_SIZE];
    // Dividend is 2^256: a leading 1 followed by 32 zero bytes. The leading
    // byte's quotient digit is always zero for divisor >= 2.
    let mut remainder: u128 = 1;
    for q in quotient.iter_mut() {
        let cur = remainder * 256;
        *q = (cur / divisor) as u8;
        remainder = cur % divisor;
    }
    quotient
}

// k * width as a 32-byte big-endian integer; None on overflow past 2^256.
fn mul_width(width: &[u8; HASH_SIZE], k: u64) -> Option<[u8; HASH_SIZE]> {
    let mut out = [0u8; HASH_SIZE];
    let mut carry: u128 = 0;
    for i in (0..HASH_SIZE).rev() {
        let product = width[i] as u128 * k as u128 + carry;
        out[i] = (product & 0xff) as u8;
        carry = product >> 8;
    }
    if carry != 0 {
        None
    } else {
        Some(out)
    }
}

fn bucket_hash(hashes: &[Hash32]) -> Hash32 {
    if hashes.is_empty() {
        return Hash32::ZERO;
    }
    let mut hasher = blake3::Hasher::new();
    for h in hashes {
        hasher.update(h.as_bytes());
    }
    hasher.finalize().into()
}

/// Range-partitioned summary of the entry hash set.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    buckets: Vec<Vec<Hash32>>,
    total: usize,
}

impl MerkleTree {
    /// Build a tree with the bucket count sized for the hash count.
    pub fn new(hashes: Vec<Hash32>) -> Self {
        let num_buckets = ideal_num_buckets(hashes.len());
        Self::new_with_buckets(hashes, num_buckets)
    }

    /// Build a tree with an explicit bucket count. Replicas use this to
    /// mirror the master's bucketing during a full rebuild.
    pub fn new_with_buckets(hashes: Vec<Hash32>, num_buckets: usize) -> Self {
        let num_buckets = num_buckets.max(1);
        let mut buckets = vec![Vec::new(); num_buckets];
        let total = hashes.len();
        for hash in hashes {
            buckets[bucket_index(&hash, num_buckets)].push(hash);
        }
        for bucket in &mut buckets {
            bucket.sort_unstable();
        }
        Self { buckets, total }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn total_hashes(&self) -> usize {
        self.total
    }

    /// Root of the binary tree built bottom-up from the bucket hashes. An
    /// odd node at any level is promoted unpaired. Empty tree hashes to the
    /// all-zero hash.
    pub fn root_hash(&self) -> Hash32 {
        let mut level: Vec<Hash32> = self.bucket_hashes();
        while level.len() > 1 {
            let mut parents = Vec::with_capacity(level.len() / 2 + 1);
            let mut pairs = level.chunks_exact(2);
            for pair in &mut pairs {
                let mut hasher = blake3::Hasher::new();
                hasher.update(pair[0].as_bytes());
                hasher.update(pair[1].as_bytes());
                parents.push(hasher.finalize().into());
            }
            if let [odd] = pairs.remainder() {
                parents.push(*odd);
            }
            level = parents;
        }
        level.first().copied().unwrap_or(Hash32::ZERO)
    }

    /// All bucket hashes in index order.
    pub fn bucket_hashes(&self) -> Vec<Hash32> {
        self.buckets.iter().map(|b| bucket_hash(b)).collect()
    }

    /// The sorted hashes held by one bucket.
    pub fn bucket_contents(&self, index: usize) -> &[Hash32] {
        self.buckets.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Insert a hash. Idempotent: inserting a present hash is a no-op.
    /// Returns true when the insert triggered a rebucketing rebuild.
    pub fn insert(&mut self, hash: Hash32) -> bool {
        let idx = bucket_index(&hash, self.num_buckets());
        let bucket = &mut self.buckets[idx];
        match bucket.binary_search(&hash) {
            Ok(_) => return false,
            Err(pos) => bucket.insert(pos, hash),
        }
        self.total += 1;

        let avg = self.total as f64 / self.num_buckets() as f64;
        if avg > (HASHES_PER_BUCKET * REBUILD_UPPER_MULTIPLIER) as f64 {
            self.rebuild();
            return true;
        }
        false
    }

    /// Remove a hash if present. Returns true when the delete triggered a
    /// rebucketing rebuild.
    pub fn delete(&mut self, hash: &Hash32) -> bool {
        let idx = bucket_index(hash, self.num_buckets());
        let bucket = &mut self.buckets[idx];
        if let Ok(pos) = bucket.binary_search(hash) {
            bucket.remove(pos);
            self.total -= 1;
        }

        if self.total > 0 && self.num_buckets() > 1 {
            let avg = self.total as f64 / self.num_buckets() as f64;
            if avg < HASHES_PER_BUCKET as f64 / REBUILD_LOWER_DIVISOR as f64 {
                self.rebuild();
                return true;
            }
        }
        false
    }

    /// Indices of buckets whose hashes differ from a peer's bucket hashes.
    /// A bucket-count mismatch means nothing lines up: every index of the
    /// larger layout is returned.
    pub fn diff_buckets(&self, other: &[Hash32]) -> Vec<usize> {
        let ours = self.bucket_hashes();
        if ours.len() != other.len() {
            return (0..ours.len().max(other.len())).collect();
        }
        ours.iter()
            .zip(other)
            .enumerate()
            .filter(|(_, (a, b))| a != b)
            .map(|(i, _)| i)
            .collect()
    }

    fn rebuild(&mut self) {
        let all: Vec<Hash32> = self.buckets.drain(..).flatten().collect();
        *self = Self::new(all);
    }
}

fn ideal_num_buckets(num_hashes: usize) -> usize {
    if num_hashes == 0 {
        return 1;
    }
    num_hashes.div_ceil(HASHES_PER_BUCKET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash;

    fn hashes(n: usize) -> Vec<Hash32> {
        (0..n).map(|i| hash(&(i as u64).to_le_bytes())).collect()
    }

    #[test]
    fn empty_tree_has_zero_root() {
        let tree = MerkleTree::new(Vec::new());
        assert_eq!(tree.num_buckets(), 1);
        assert_eq!(tree.root_hash(), Hash32::ZERO);
    }

    #[test]
    fn single_bucket_root_equals_bucket_hash() {
        let tree = MerkleTree::new(hashes(5));
        assert_eq!(tree.num_buckets(), 1);
        assert_eq!(tree.root_hash(), tree.bucket_hashes()[0]);
    }

    #[test]
    fn root_is_permutation_invariant() {
        let mut set = hashes(57);
        let tree_a = MerkleTree::new_with_buckets(set.clone(), 6);
        set.reverse();
        set.rotate_left(13);
        let tree_b = MerkleTree::new_with_buckets(set, 6);

        assert_eq!(tree_a.bucket_hashes(), tree_b.bucket_hashes());
        assert_eq!(tree_a.root_hash(), tree_b.root_hash());
    }

    #[test]
    fn insert_is_idempotent() {
        let mut tree = MerkleTree::new(hashes(8));
        let root = tree.root_hash();
        let existing = hash(&3u64.to_le_bytes());

        assert!(!tree.insert(existing));
        assert_eq!(tree.total_hashes(), 8);
        assert_eq!(tree.root_hash(), root);
    }

    #[test]
    fn insert_and_delete_roundtrip() {
        let mut tree = MerkleTree::new(hashes(8));
        let root = tree.root_hash();

        let extra = hash(b"extra");
        tree.insert(extra);
        assert_ne!(tree.root_hash(), root);
        assert_eq!(tree.total_hashes(), 9);

        tree.delete(&extra);
        assert_eq!(tree.root_hash(), root);
        assert_eq!(tree.total_hashes(), 8);
    }

    #[test]
    fn grows_when_buckets_overflow() {
        // 21 hashes in a single bucket pushes the average past 20.
        let mut tree = MerkleTree::new_with_buckets(hashes(20), 1);
        assert_eq!(tree.num_buckets(), 1);

        let rebuilt = tree.insert(hash(b"one more"));
        assert!(rebuilt);
        assert_eq!(tree.num_buckets(), 3);
        assert_eq!(tree.total_hashes(), 21);
    }

    #[test]
    fn shrinks_when_buckets_empty_out() {
        // 10 buckets with 20 entries averages 2.0 < 2.5: deleting forces a
        // shrink on the next delete.
        let mut tree = MerkleTree::new_with_buckets(hashes(21), 10);
        let victim = hash(&0u64.to_le_bytes());
        let rebuilt = tree.delete(&victim);
        assert!(rebuilt);
        assert_eq!(tree.num_buckets(), 2);
        assert_eq!(tree.total_hashes(), 20);
    }

    #[test]
    fn rebuild_preserves_membership() {
        let set = hashes(35);
        let mut tree = MerkleTree::new_with_buckets(set.clone(), 1);
        tree.insert(hash(b"trigger")); // forces grow

        let reference = {
            let mut all = set;
            all.push(hash(b"trigger"));
            MerkleTree::new_with_buckets(all, tree.num_buckets())
        };
        assert_eq!(tree.root_hash(), reference.root_hash());
    }

    #[test]
    fn diff_buckets_finds_divergence() {
        let tree_a = MerkleTree::new_with_buckets(hashes(40), 4);
        let mut tree_b = MerkleTree::new_with_buckets(hashes(40), 4);
        assert!(tree_a.diff_buckets(&tree_b.bucket_hashes()).is_empty());

        let extra = hash(b"divergence");
        tree_b.insert(extra);
        let diff = tree_a.diff_buckets(&tree_b.bucket_hashes());
        assert_eq!(diff, vec![bucket_index(&extra, 4)]);
    }

    #[test]
    fn diff_buckets_with_mismatched_counts_returns_full_range() {
        let tree_a = MerkleTree::new_with_buckets(hashes(10), 2);
        let tree_b = MerkleTree::new_with_buckets(hashes(10), 5);
        let diff = tree_a.diff_buckets(&tree_b.bucket_hashes());
        assert_eq!(diff, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn bucket_index_agrees_with_bucket_range() {
        for num_buckets in [1usize, 2, 3, 7, 16] {
            for h in hashes(100) {
                let idx = bucket_index(&h, num_buckets);
                assert!(idx < num_buckets);
                let (start, end) = bucket_range(idx, num_buckets);
                assert!(h.0 >= start, "hash below its bucket range");
                if let Some(end) = end {
                    assert!(h.0 < end, "hash above its bucket range");
                }
            }
        }
    }

    #[test]
    fn bucket_contents_are_sorted() {
        let tree = MerkleTree::new(hashes(50));
        for i in 0..tree.num_buckets() {
            let contents = tree.bucket_contents(i);
            assert!(contents.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
