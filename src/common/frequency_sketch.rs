// License and Copyright Notice:
//
// The counter layout, seed table and aging scheme in this module follow
// a Java class `com.github.benmanes.caffeine.cache.FrequencySketch` of Caffeine.
// https://github.com/ben-manes/caffeine/blob/master/caffeine/src/main/java/com/github/benmanes/caffeine/cache/FrequencySketch.java
//
// The original code/comments from Caffeine are licensed under the Apache License,
// Version 2.0 <https://github.com/ben-manes/caffeine/blob/master/LICENSE>
//
// Copyrights of the original code/comments are retained by their contributors.
// For full authorship information, see the version control history of
// https://github.com/ben-manes/caffeine/

// A 4-bit Count-Min sketch [1] that records the popularity history for
// the TinyLfu admission policy [2]. Each table word packs sixteen 4-bit
// counters; a hash picks one word per depth and one counter group within
// it, so an element touches four counters and its estimate is their
// minimum. The table length matches the cache maximum rounded up to a
// power of two, which keeps indexing a mask and the error bound at
// e / width with 93.75% confidence.
//
// Popularity decays through a periodic aging pass: once the number of
// recorded increments reaches a sampling window (ten times the maximum),
// every counter is halved in place with word-wide bit tricks and the
// window restarts. That keeps one-hit wonders from accumulating weight
// forever while frequently read entries stay warm.
//
// [1] An Improved Data Stream Summary: The Count-Min Sketch and its Applications
//     http://dimacs.rutgers.edu/~graham/pubs/papers/cm-full.pdf
// [2] TinyLFU: A Highly Efficient Cache Admission Policy
//     https://dl.acm.org/citation.cfm?id=3149371

/// A probabilistic multi-set for estimating the popularity of an element
/// within a time window. Counters saturate at 15 and are periodically
/// halved so stale popularity fades away.
pub(crate) struct FrequencySketch {
    sample_size: usize,
    table_mask: usize,
    table: Vec<u64>,
    size: usize,
    // Instance-specific permutation of the key hashes, so that a crafted
    // key set cannot collide across every cache instance (hash flooding).
    seed: u32,
}

/// Counters consulted per element.
const DEPTH: usize = 4;

const NIBBLE_MASK: u64 = 0xF;

// A mixture of seeds from FNV-1a, CityHash, and Murmur3.
static SEED: [u64; 4] = [
    0xc3a5_c85c_97cb_3127,
    0xb492_b66f_be98_f273,
    0x9ae1_6a3b_2f90_404f,
    0xcbf2_9ce4_8422_2325,
];

static RESET_MASK: u64 = 0x7777_7777_7777_7777;

static ONE_MASK: u64 = 0x1111_1111_1111_1111;

static SPREAD_MULTIPLIER: u32 = 0x45d9_f3b;

impl Default for FrequencySketch {
    fn default() -> Self {
        Self {
            sample_size: 0,
            table_mask: 0,
            table: Vec::new(),
            size: 0,
            seed: random_seed(),
        }
    }
}

impl FrequencySketch {
    /// Initializes or grows the table so the sketch can track a cache of
    /// `cap` entries. Growing discards the recorded history.
    pub(crate) fn ensure_capacity(&mut self, cap: usize) {
        let capped = cap.min((i32::MAX >> 1) as usize);
        let table_len = capped.next_power_of_two();
        if self.table.len() >= table_len {
            return;
        }

        self.table = vec![0; table_len];
        self.table_mask = table_len - 1;
        self.sample_size = if cap == 0 {
            10
        } else {
            capped.saturating_mul(10).min(i32::MAX as usize)
        };
        self.size = 0;
    }

    pub(crate) fn is_initialized(&self) -> bool {
        !self.table.is_empty()
    }

    /// Estimated number of occurrences of the element with this hash,
    /// saturating at 15: the minimum over the element's four counters.
    pub(crate) fn frequency(&self, key_hash: u64) -> u8 {
        if self.table.is_empty() {
            return 0;
        }
        let hash = self.spread(key_hash);
        (0..DEPTH)
            .map(|depth| {
                let word = self.table[self.slot_of(hash, depth)];
                ((word >> Self::counter_shift(hash, depth)) & NIBBLE_MASK) as u8
            })
            .min()
            .unwrap_or(0)
    }

    /// Bumps the element's four counters, each saturating at 15, and
    /// runs an aging pass once the sampling window fills up.
    pub(crate) fn increment(&mut self, key_hash: u64) {
        if self.table.is_empty() {
            return;
        }
        let hash = self.spread(key_hash);
        let mut added = false;
        for depth in 0..DEPTH {
            let slot = self.slot_of(hash, depth);
            added |= self.try_bump(slot, Self::counter_shift(hash, depth));
        }

        if added {
            self.size += 1;
            if self.size >= self.sample_size {
                self.age();
            }
        }
    }

    /// Adds one to a single counter unless it is already saturated.
    /// Returns whether the counter changed.
    fn try_bump(&mut self, slot: usize, shift: u32) -> bool {
        let word = self.table[slot];
        if (word >> shift) & NIBBLE_MASK == NIBBLE_MASK {
            return false;
        }
        self.table[slot] = word + (1 << shift);
        true
    }

    /// Halves every counter in place. The sample restarts at half, less
    /// a quarter of the odd counters whose halves rounded down.
    fn age(&mut self) {
        let mut odd_counters = 0;
        for word in self.table.iter_mut() {
            odd_counters += (*word & ONE_MASK).count_ones() as usize;
            *word = (*word >> 1) & RESET_MASK;
        }
        self.size = (self.size / 2).saturating_sub(odd_counters / 4);
    }

    /// Table slot holding the element's counter at the given depth.
    fn slot_of(&self, hash: u64, depth: usize) -> usize {
        let seed = SEED[depth];
        let mut mixed = hash.wrapping_add(seed).wrapping_mul(seed);
        mixed = mixed.wrapping_add(mixed >> 32);
        (mixed as usize) & self.table_mask
    }

    /// Bit offset of the element's counter within a table word. The low
    /// two hash bits select one of four counter groups; the depth picks
    /// within the group.
    fn counter_shift(hash: u64, depth: usize) -> u32 {
        (((((hash & 3) as usize) << 2) + depth) as u32) << 2
    }

    /// Applies a supplemental hash so that keys with similar low bits use
    /// different counters, folding in the per-instance seed.
    fn spread(&self, key_hash: u64) -> u64 {
        let mut x = (key_hash as u32) ^ ((key_hash >> 32) as u32);
        x = ((x >> 16) ^ x).wrapping_mul(SPREAD_MULTIPLIER);
        x = ((x >> 16) ^ x).wrapping_mul(self.seed);
        ((x >> 16) ^ x) as u64
    }
}

fn random_seed() -> u32 {
    let mut buf = [0u8; 4];
    let seed = match getrandom::getrandom(&mut buf) {
        Ok(()) => u32::from_ne_bytes(buf),
        Err(_) => 0x9e37_79b9,
    };
    // Must be nonzero; an odd multiplier keeps the spread a bijection.
    seed | 1
}

// Some test cases were ported from Caffeine at:
// https://github.com/ben-manes/caffeine/blob/master/caffeine/src/test/java/com/github/benmanes/caffeine/cache/FrequencySketchTest.java
//
// To see the debug prints, run test as `cargo test -- --nocapture`
#[cfg(test)]
mod tests {
    use super::FrequencySketch;
    use once_cell::sync::Lazy;
    use std::hash::{BuildHasher, Hash, Hasher};

    static ITEM: Lazy<u32> = Lazy::new(|| {
        let mut buf = [0; 4];
        getrandom::getrandom(&mut buf).unwrap();
        u32::from_ne_bytes(buf)
    });

    fn sketch_with_capacity(cap: usize) -> FrequencySketch {
        let mut sketch = FrequencySketch::default();
        sketch.ensure_capacity(cap);
        sketch
    }

    #[test]
    fn increment_once() {
        let mut sketch = sketch_with_capacity(512);
        let hasher = hasher();
        let item_hash = hasher(*ITEM);
        sketch.increment(item_hash);
        assert_eq!(sketch.frequency(item_hash), 1);
    }

    #[test]
    fn increment_max() {
        let mut sketch = sketch_with_capacity(512);
        let hasher = hasher();
        let item_hash = hasher(*ITEM);
        for _ in 0..20 {
            sketch.increment(item_hash);
        }
        assert_eq!(sketch.frequency(item_hash), 15);
    }

    #[test]
    fn increment_distinct() {
        let mut sketch = sketch_with_capacity(512);
        let hasher = hasher();
        sketch.increment(hasher(*ITEM));
        sketch.increment(hasher(ITEM.wrapping_add(1)));
        assert_eq!(sketch.frequency(hasher(*ITEM)), 1);
        assert_eq!(sketch.frequency(hasher(ITEM.wrapping_add(1))), 1);
        assert_eq!(sketch.frequency(hasher(ITEM.wrapping_add(2))), 0);
    }

    #[test]
    fn uninitialized_is_inert() {
        let mut sketch = FrequencySketch::default();
        assert!(!sketch.is_initialized());
        sketch.increment(100);
        assert_eq!(sketch.frequency(100), 0);

        sketch.ensure_capacity(64);
        assert!(sketch.is_initialized());
        sketch.increment(100);
        assert_eq!(sketch.frequency(100), 1);
    }

    #[test]
    fn ensure_capacity_does_not_shrink() {
        let mut sketch = sketch_with_capacity(512);
        let len = sketch.table.len();
        sketch.ensure_capacity(4);
        assert_eq!(sketch.table.len(), len);
    }

    #[test]
    fn aging_halves_every_counter() {
        let mut sketch = sketch_with_capacity(64);
        let hasher = hasher();
        for i in 0..10u32 {
            for _ in 0..=i {
                sketch.increment(hasher(i));
            }
        }

        let before = sketch.table.clone();
        sketch.age();
        for (old_word, new_word) in before.iter().zip(sketch.table.iter()) {
            for counter in 0..16 {
                let old = (old_word >> (counter * 4)) & 0xF;
                let new = (new_word >> (counter * 4)) & 0xF;
                assert_eq!(new, old / 2);
            }
        }
    }

    #[test]
    fn slots_spread_around_zero() {
        let sketch = sketch_with_capacity(512);
        let mut slots = std::collections::HashSet::new();
        let hashes = vec![u64::MAX, 0, 1];
        for hash in hashes.iter() {
            for depth in 0..4 {
                slots.insert(sketch.slot_of(*hash, depth));
            }
        }
        assert_eq!(slots.len(), 4 * hashes.len())
    }

    #[test]
    fn reset() {
        let mut reset = false;
        let mut sketch = sketch_with_capacity(64);
        let hasher = hasher();

        for i in 1..(20 * sketch.table.len()) {
            sketch.increment(hasher(i));
            if sketch.size != i {
                reset = true;
                break;
            }
        }

        assert!(reset);
        assert!(sketch.size <= sketch.sample_size / 2);
    }

    #[test]
    fn heavy_hitters() {
        let mut sketch = sketch_with_capacity(512);
        let hasher = hasher();

        for i in 100..100_000 {
            sketch.increment(hasher(i));
        }

        for i in (0..10).step_by(2) {
            for _ in 0..i {
                sketch.increment(hasher(i));
            }
        }

        // A perfect popularity count yields an array [0, 0, 2, 0, 4, 0, 6, 0, 8, 0]
        let popularity = (0..10)
            .map(|i| sketch.frequency(hasher(i)))
            .collect::<Vec<_>>();

        for (i, freq) in popularity.iter().enumerate() {
            match i {
                2 => assert!(freq <= &popularity[4]),
                4 => assert!(freq <= &popularity[6]),
                6 => assert!(freq <= &popularity[8]),
                8 => (),
                _ => assert!(freq <= &popularity[2]),
            }
        }
    }

    fn hasher<K: Hash>() -> impl Fn(K) -> u64 {
        let build_hasher = std::collections::hash_map::RandomState::default();
        move |key| {
            let mut hasher = build_hasher.build_hasher();
            key.hash(&mut hasher);
            hasher.finish()
        }
    }
}
