/// Approximate membership filter for block hashes.
///
/// A bloom filter sized up front for an expected number of entries and a
/// target false-positive rate. It never forgets an inserted hash, so
/// `contains` has no false negatives; a hash that was never inserted may
/// still be reported present with roughly the configured probability as long
/// as the filter stays within its capacity.
///
/// Used per peer to skip sending blocks the peer already has, and globally to
/// skip re-processing blocks already received.
use ledger::Hash;
use sha2::{Digest, Sha256};

/// Hash functions are clamped to this range regardless of the sizing math.
const MIN_HASHES: u32 = 1;
const MAX_HASHES: u32 = 16;

#[derive(Debug, Clone)]
pub struct DedupFilter {
    bits: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
    capacity: usize,
    false_positive_rate: f64,
    inserted: usize,
}

impl DedupFilter {
    /// Create a filter for `capacity` entries at `false_positive_rate`.
    ///
    /// Out-of-range arguments are clamped: capacity to at least 1 and the
    /// rate into `(0, 0.5]`.
    pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
        let capacity = capacity.max(1);
        let rate = if false_positive_rate.is_finite() {
            false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5)
        } else {
            0.5
        };

        let ln2 = std::f64::consts::LN_2;
        let n = capacity as f64;
        let num_bits = ((-n * rate.ln()) / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2)
            .round()
            .clamp(MIN_HASHES as f64, MAX_HASHES as f64) as u32;

        let words = num_bits.div_ceil(64) as usize;

        Self {
            bits: vec![0; words],
            num_bits: words as u64 * 64,
            num_hashes,
            capacity,
            false_positive_rate: rate,
            inserted: 0,
        }
    }

    /// Insert a hash.
    ///
    /// Returns `true` if the hash was not already (possibly) present.
    pub fn add(&mut self, hash: &Hash) -> bool {
        let indexes: Vec<u64> = self.indexes(hash).collect();
        let mut fresh = false;
        for index in indexes {
            let (word, mask) = Self::locate(index);
            if self.bits[word] & mask == 0 {
                fresh = true;
                self.bits[word] |= mask;
            }
        }
        if fresh {
            self.inserted += 1;
        }
        fresh
    }

    /// Check whether a hash may have been inserted.
    pub fn contains(&self, hash: &Hash) -> bool {
        self.indexes(hash).all(|index| {
            let (word, mask) = Self::locate(index);
            self.bits[word] & mask != 0
        })
    }

    /// Number of distinct insertions observed (approximate).
    pub fn len(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.inserted == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn false_positive_rate(&self) -> f64 {
        self.false_positive_rate
    }

    /// Whether the filter holds as many entries as it was sized for.
    pub fn is_full(&self) -> bool {
        self.inserted >= self.capacity
    }

    fn locate(index: u64) -> (usize, u64) {
        ((index / 64) as usize, 1u64 << (index % 64))
    }

    /// Kirsch-Mitzenmacher double hashing over a SHA-256 digest of the key.
    fn indexes(&self, hash: &Hash) -> impl Iterator<Item = u64> + '_ {
        let digest = Sha256::digest(hash.as_bytes());
        let mut h1 = [0u8; 8];
        let mut h2 = [0u8; 8];
        h1.copy_from_slice(&digest[0..8]);
        h2.copy_from_slice(&digest[8..16]);
        let h1 = u64::from_le_bytes(h1);
        let h2 = u64::from_le_bytes(h2) | 1;

        (0..self.num_hashes as u64)
            .map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % self.num_bits)
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(10_000, 0.001)
    }
}

/// Received-block record that grows instead of degrading.
///
/// Entries live in a stack of [`DedupFilter`] layers of equal capacity. When
/// the newest layer is full a fresh one is pushed with half the
/// false-positive rate of its predecessor, so the combined rate stays under
/// twice the configured rate. Nothing is ever removed: a recorded hash is
/// reported present for the lifetime of the record.
#[derive(Debug, Clone)]
pub struct BlockRecord {
    layers: Vec<DedupFilter>,
    capacity: usize,
    false_positive_rate: f64,
}

impl BlockRecord {
    pub fn new(capacity: usize, false_positive_rate: f64) -> Self {
        Self {
            layers: vec![DedupFilter::new(capacity, false_positive_rate)],
            capacity,
            false_positive_rate,
        }
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.layers.iter().any(|layer| layer.contains(hash))
    }

    /// Record a hash. Returns `true` if it was not already (possibly) present.
    pub fn add(&mut self, hash: &Hash) -> bool {
        if self.contains(hash) {
            return false;
        }
        if self.layers.last().is_none_or(DedupFilter::is_full) {
            let rate = self.false_positive_rate * 0.5f64.powi(self.layers.len() as i32);
            self.layers.push(DedupFilter::new(self.capacity, rate));
        }
        self.layers
            .last_mut()
            .is_some_and(|layer| layer.add(hash))
    }

    pub fn len(&self) -> usize {
        self.layers.iter().map(DedupFilter::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layers(&self) -> usize {
        self.layers.len()
    }
}
