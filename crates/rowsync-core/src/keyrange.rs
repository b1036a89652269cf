//! Shard key-range filtering.
//!
//! A sharded target routes each row by an 8-byte keyspace id computed
//! from the row's sharding key. Cloning into a single target shard must
//! therefore ignore source rows the cluster routes elsewhere, or they
//! would be diffed as "missing" and re-inserted on every run. The filter
//! is an ordered set of half-open byte intervals over the keyspace; a
//! row is admitted iff the hash of its sharding key lands in any of
//! them.

use crate::error::CloneError;

/// An 8-byte keyspace id.
pub type KeyspaceId = [u8; 8];

/// Fixed scatter hash from a sharding key to its keyspace id.
///
/// FNV-1a over the big-endian bytes of the key, emitted big-endian.
/// Pure and stable across runs, which is all shard routing requires:
/// the same function must be used when the target cluster was populated
/// and when it is diffed.
#[must_use]
pub fn vhash(sharding_id: i64) -> KeyspaceId {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in sharding_id.to_be_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash.to_be_bytes()
}

/// A half-open interval `[start, end)` of keyspace ids.
///
/// Bounds are byte strings compared lexicographically; an empty bound is
/// unbounded on that side, so `KeyRange::full()` contains every key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRange {
    /// Inclusive lower bound; empty means unbounded below.
    pub start: Vec<u8>,
    /// Exclusive upper bound; empty means unbounded above.
    pub end: Vec<u8>,
}

impl KeyRange {
    /// The interval containing the entire keyspace.
    #[must_use]
    pub fn full() -> KeyRange {
        KeyRange { start: Vec::new(), end: Vec::new() }
    }

    /// Builds `[start, end)` from byte bounds.
    #[must_use]
    pub fn new(start: Vec<u8>, end: Vec<u8>) -> KeyRange {
        KeyRange { start, end }
    }

    /// Half-open containment: inclusive start, exclusive end.
    #[must_use]
    pub fn contains(&self, key: &KeyspaceId) -> bool {
        (self.start.is_empty() || key.as_slice() >= self.start.as_slice())
            && (self.end.is_empty() || key.as_slice() < self.end.as_slice())
    }
}

/// An ordered set of disjoint key ranges admitted for the target shard.
///
/// The default filter admits every key (single full range). An empty
/// filter admits nothing. Construction validates shape, so a malformed
/// filter fails the clone before any I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRangeFilter {
    ranges: Vec<KeyRange>,
}

impl Default for KeyRangeFilter {
    fn default() -> Self {
        KeyRangeFilter { ranges: vec![KeyRange::full()] }
    }
}

impl KeyRangeFilter {
    /// Builds a filter from ranges, validating that each range is
    /// non-inverted and that ranges are ascending and non-overlapping.
    ///
    /// # Errors
    ///
    /// Returns [`CloneError::InvalidFilter`] when a range has
    /// `start >= end`, when an unbounded side appears anywhere but the
    /// outermost position, or when consecutive ranges overlap or are out
    /// of order.
    pub fn new(ranges: Vec<KeyRange>) -> Result<KeyRangeFilter, CloneError> {
        for (i, range) in ranges.iter().enumerate() {
            if !range.start.is_empty() && !range.end.is_empty() && range.start >= range.end {
                return Err(CloneError::InvalidFilter(format!(
                    "range {i} has start >= end"
                )));
            }
            if range.start.is_empty() && i != 0 {
                return Err(CloneError::InvalidFilter(format!(
                    "range {i} is unbounded below but not first"
                )));
            }
            if range.end.is_empty() && i != ranges.len() - 1 {
                return Err(CloneError::InvalidFilter(format!(
                    "range {i} is unbounded above but not last"
                )));
            }
        }
        for (i, pair) in ranges.windows(2).enumerate() {
            // Bounded on the inner sides by the checks above.
            if pair[1].start < pair[0].end {
                return Err(CloneError::InvalidFilter(format!(
                    "ranges {i} and {} overlap or are out of order",
                    i + 1
                )));
            }
        }
        Ok(KeyRangeFilter { ranges })
    }

    /// A filter admitting the entire keyspace.
    #[must_use]
    pub fn all() -> KeyRangeFilter {
        KeyRangeFilter::default()
    }

    /// A filter admitting nothing.
    #[must_use]
    pub fn none() -> KeyRangeFilter {
        KeyRangeFilter { ranges: Vec::new() }
    }

    /// True when any range contains `key`.
    #[must_use]
    pub fn contains(&self, key: &KeyspaceId) -> bool {
        self.ranges.iter().any(|r| r.contains(key))
    }

    /// True when the hashed sharding key belongs to the target shard.
    #[must_use]
    pub fn admits(&self, sharding_id: i64) -> bool {
        self.contains(&vhash(sharding_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vhash_is_stable_and_scatters() {
        // Fixed function: these values must never change between runs.
        assert_eq!(vhash(0), vhash(0));
        assert_ne!(vhash(0), vhash(1));
        assert_ne!(vhash(1), vhash(2));
        assert_ne!(vhash(1), vhash(-1));
    }

    #[test]
    fn full_range_contains_everything() {
        let range = KeyRange::full();
        assert!(range.contains(&[0; 8]));
        assert!(range.contains(&[0xff; 8]));
    }

    #[test]
    fn half_open_containment() {
        let range = KeyRange::new(vec![0x40], vec![0x80]);
        assert!(range.contains(&[0x40, 0, 0, 0, 0, 0, 0, 0]));
        assert!(range.contains(&[0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]));
        assert!(!range.contains(&[0x80, 0, 0, 0, 0, 0, 0, 0]));
        assert!(!range.contains(&[0x3f, 0xff, 0, 0, 0, 0, 0, 0]));
    }

    #[test]
    fn prefix_bounds_split_the_keyspace() {
        // [ , 0x80) and [0x80, ) partition every 8-byte key.
        let low = KeyRange::new(vec![], vec![0x80]);
        let high = KeyRange::new(vec![0x80], vec![]);
        for key in [[0u8; 8], [0x7f; 8], [0x80; 8], [0xff; 8]] {
            assert_ne!(low.contains(&key), high.contains(&key));
        }
    }

    #[test]
    fn default_filter_admits_everything() {
        let filter = KeyRangeFilter::default();
        for id in [i64::MIN, -1, 0, 1, i64::MAX] {
            assert!(filter.admits(id));
        }
    }

    #[test]
    fn empty_filter_admits_nothing() {
        let filter = KeyRangeFilter::none();
        assert!(!filter.admits(0));
        assert!(!filter.admits(42));
    }

    #[test]
    fn validation_rejects_inverted_range() {
        let err = KeyRangeFilter::new(vec![KeyRange::new(vec![0x80], vec![0x40])]);
        assert!(matches!(err, Err(CloneError::InvalidFilter(_))));
    }

    #[test]
    fn validation_rejects_overlap_and_disorder() {
        let overlapping = KeyRangeFilter::new(vec![
            KeyRange::new(vec![], vec![0x80]),
            KeyRange::new(vec![0x40], vec![]),
        ]);
        assert!(matches!(overlapping, Err(CloneError::InvalidFilter(_))));

        let disordered = KeyRangeFilter::new(vec![
            KeyRange::new(vec![0x80], vec![0xc0]),
            KeyRange::new(vec![0x40], vec![0x80]),
        ]);
        assert!(matches!(disordered, Err(CloneError::InvalidFilter(_))));
    }

    #[test]
    fn validation_rejects_misplaced_unbounded_sides() {
        let err = KeyRangeFilter::new(vec![
            KeyRange::new(vec![0x10], vec![0x20]),
            KeyRange::new(vec![], vec![0x40]),
        ]);
        assert!(matches!(err, Err(CloneError::InvalidFilter(_))));
    }

    #[test]
    fn disjoint_ranges_admit_their_union() {
        let filter = KeyRangeFilter::new(vec![
            KeyRange::new(vec![], vec![0x40]),
            KeyRange::new(vec![0xc0], vec![]),
        ])
        .unwrap();
        assert!(filter.contains(&[0x00, 1, 2, 3, 4, 5, 6, 7]));
        assert!(filter.contains(&[0xc0, 0, 0, 0, 0, 0, 0, 0]));
        assert!(!filter.contains(&[0x80, 0, 0, 0, 0, 0, 0, 0]));
    }
}
