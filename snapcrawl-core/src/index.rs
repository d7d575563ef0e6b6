//! BK-tree over perceptual hashes for exact and near-duplicate lookup.
//!
//! Nodes live in a flat arena and refer to their children by index, keyed by
//! the Hamming distance from the parent. Every child key under a node is
//! unique, so the structure is a plain tree owned entirely by the index.
//!
//! Radius queries prune with the triangle inequality: a subtree hanging off
//! distance `c` can only contain a match for a query at distance `d` from the
//! node if `|d - c| <= radius`. Expected cost is logarithmic for well spread
//! hashes and degrades to a full scan when the radius approaches the typical
//! pairwise distance. No rebalancing is done.

use std::collections::BTreeMap;

use crate::hash::PerceptualHash;

#[derive(Debug, Clone)]
struct Node {
    hash: PerceptualHash,
    children: BTreeMap<u32, usize>,
}

impl Node {
    fn new(hash: PerceptualHash) -> Self {
        Self {
            hash,
            children: BTreeMap::new(),
        }
    }
}

/// Result of [`SimilarityIndex::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The hash was new and now has its own node.
    Inserted,
    /// A node with the identical hash already exists.
    AlreadyPresent,
}

/// A stored hash returned by a radius query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub hash: PerceptualHash,
    pub distance: u32,
}

/// Metric tree indexing perceptual hashes under Hamming distance.
#[derive(Debug, Clone, Default)]
pub struct SimilarityIndex {
    nodes: Vec<Node>,
}

impl SimilarityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from previously persisted hashes.
    pub fn from_hashes<I>(hashes: I) -> Self
    where
        I: IntoIterator<Item = PerceptualHash>,
    {
        let mut index = Self::new();
        for hash in hashes {
            index.insert(hash);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add a hash. The first hash becomes the root; an identical hash is a no-op.
    pub fn insert(&mut self, hash: PerceptualHash) -> InsertOutcome {
        if self.nodes.is_empty() {
            self.nodes.push(Node::new(hash));
            return InsertOutcome::Inserted;
        }

        let mut current = 0;
        loop {
            let node = &self.nodes[current];
            let distance = node.hash.hamming_distance(hash);
            if distance == 0 {
                return InsertOutcome::AlreadyPresent;
            }
            match node.children.get(&distance) {
                Some(&child) => current = child,
                None => {
                    let slot = self.nodes.len();
                    self.nodes.push(Node::new(hash));
                    self.nodes[current].children.insert(distance, slot);
                    return InsertOutcome::Inserted;
                }
            }
        }
    }

    /// Distance-0 lookup. Follows a single path from the root.
    pub fn has_exact_match(&self, hash: PerceptualHash) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        let mut current = 0;
        loop {
            let node = &self.nodes[current];
            let distance = node.hash.hamming_distance(hash);
            if distance == 0 {
                return true;
            }
            match node.children.get(&distance) {
                Some(&child) => current = child,
                None => return false,
            }
        }
    }

    /// Lazily enumerate every stored hash within `radius` of `hash`.
    ///
    /// Each call starts a fresh depth-first traversal.
    pub fn find_within_radius(&self, hash: PerceptualHash, radius: u32) -> RadiusMatches<'_> {
        let stack = if self.nodes.is_empty() {
            Vec::new()
        } else {
            vec![0]
        };
        RadiusMatches {
            nodes: &self.nodes,
            query: hash,
            radius,
            stack,
            visited: 0,
        }
    }

    /// The closest stored hash within `radius`, if any.
    ///
    /// Walks every match; use `find_within_radius(..).next()` to test for one.
    pub fn nearest_within(&self, hash: PerceptualHash, radius: u32) -> Option<Match> {
        self.find_within_radius(hash, radius).min_by_key(|m| m.distance)
    }
}

/// Iterator returned by [`SimilarityIndex::find_within_radius`].
pub struct RadiusMatches<'a> {
    nodes: &'a [Node],
    query: PerceptualHash,
    radius: u32,
    stack: Vec<usize>,
    visited: usize,
}

impl RadiusMatches<'_> {
    /// Nodes whose distance has been computed so far.
    pub fn nodes_visited(&self) -> usize {
        self.visited
    }
}

impl Iterator for RadiusMatches<'_> {
    type Item = Match;

    fn next(&mut self) -> Option<Match> {
        while let Some(slot) = self.stack.pop() {
            let node = &self.nodes[slot];
            let distance = node.hash.hamming_distance(self.query);
            self.visited += 1;

            let low = distance.saturating_sub(self.radius);
            let high = distance.saturating_add(self.radius);
            self.stack.extend(node.children.range(low..=high).map(|(_, &child)| child));

            if distance <= self.radius {
                return Some(Match {
                    hash: node.hash,
                    distance,
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn h(bits: u64) -> PerceptualHash {
        PerceptualHash::new(bits)
    }

    #[test]
    fn test_empty_index() {
        let index = SimilarityIndex::new();
        assert!(index.is_empty());
        assert!(!index.has_exact_match(h(0)));
        assert_eq!(index.find_within_radius(h(0), 64).count(), 0);
    }

    #[test]
    fn test_first_insert_becomes_root() {
        let mut index = SimilarityIndex::new();
        assert_eq!(index.insert(h(0x0F)), InsertOutcome::Inserted);
        assert_eq!(index.len(), 1);
        assert!(index.has_exact_match(h(0x0F)));
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut index = SimilarityIndex::new();
        index.insert(h(0x0F));
        index.insert(h(0xF0));
        assert_eq!(index.insert(h(0xF0)), InsertOutcome::AlreadyPresent);
        assert_eq!(index.insert(h(0x0F)), InsertOutcome::AlreadyPresent);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_one_bit_neighbour_scenario() {
        let a = h(0x0F);
        let b = h(0x07);
        let mut index = SimilarityIndex::new();
        index.insert(a);

        let within_one: Vec<_> = index.find_within_radius(b, 1).collect();
        assert_eq!(within_one, vec![Match { hash: a, distance: 1 }]);
        assert_eq!(index.find_within_radius(b, 0).count(), 0);

        index.insert(b);
        assert!(index.has_exact_match(a));
        assert!(index.has_exact_match(b));
    }

    #[test]
    fn test_children_keyed_by_distance() {
        let mut index = SimilarityIndex::new();
        index.insert(h(0));
        // Both at distance 1 from the root: second one hangs below the first.
        index.insert(h(0b01));
        index.insert(h(0b10));
        assert_eq!(index.nodes[0].children.len(), 1);
        assert_eq!(index.nodes[1].children.get(&2), Some(&2));
    }

    #[test]
    fn test_nearest_within_picks_smallest_distance() {
        let mut index = SimilarityIndex::new();
        index.insert(h(0xFF));
        index.insert(h(0x0F));
        index.insert(h(0x07));
        let nearest = index.nearest_within(h(0x03), 8).unwrap();
        assert_eq!(nearest.hash, h(0x07));
        assert_eq!(nearest.distance, 1);
    }

    #[test]
    fn test_pruning_skips_far_subtrees() {
        // Hashes with 0, 8, 16, ... 64 leading ones are spread far apart.
        let hashes: Vec<_> = (0..=8u32)
            .map(|k| h(if k == 8 { u64::MAX } else { (1u64 << (8 * k)) - 1 }))
            .collect();
        let index = SimilarityIndex::from_hashes(hashes.iter().copied());
        assert_eq!(index.len(), hashes.len());

        let mut matches = index.find_within_radius(h(0), 0);
        assert_eq!(matches.next().map(|m| m.hash), Some(h(0)));
        assert!(matches.next().is_none());
        assert!(matches.nodes_visited() < index.len());
    }

    #[test]
    fn test_first_match_stops_the_walk() {
        let index = SimilarityIndex::from_hashes((0..64u64).map(h));
        let mut matches = index.find_within_radius(h(0), 64);
        assert!(matches.next().is_some());
        assert_eq!(matches.nodes_visited(), 1);
        assert_eq!(index.find_within_radius(h(0), 64).count(), 64);
    }

    #[test]
    fn test_iterator_is_finite_and_fresh_per_call() {
        let index = SimilarityIndex::from_hashes((0..32u64).map(h));
        let first: Vec<_> = index.find_within_radius(h(5), 2).collect();
        let second: Vec<_> = index.find_within_radius(h(5), 2).collect();
        assert_eq!(first.len(), second.len());
        assert!(!first.is_empty());
    }

    proptest! {
        #[test]
        fn prop_exact_match_after_insert(hashes in proptest::collection::vec(any::<u64>(), 1..200)) {
            let mut index = SimilarityIndex::new();
            for (i, &bits) in hashes.iter().enumerate() {
                index.insert(h(bits));
                for &earlier in &hashes[..=i] {
                    prop_assert!(index.has_exact_match(h(earlier)));
                }
            }
        }

        #[test]
        fn prop_radius_query_matches_brute_force(
            hashes in proptest::collection::vec(any::<u64>(), 0..150),
            flips in proptest::collection::vec(0u32..64, 0..12),
            base in any::<prop::sample::Index>(),
            radius in 0u32..20,
        ) {
            let index = SimilarityIndex::from_hashes(hashes.iter().map(|&b| h(b)));

            // Query near a stored hash so there is something to find.
            let mut query = if hashes.is_empty() { 0 } else { hashes[base.index(hashes.len())] };
            for bit in flips {
                query ^= 1u64 << bit;
            }
            let query = h(query);

            let mut expected: Vec<u64> = hashes
                .iter()
                .copied()
                .filter(|&b| h(b).hamming_distance(query) <= radius)
                .collect();
            expected.sort_unstable();
            expected.dedup();

            let mut found: Vec<u64> = index
                .find_within_radius(query, radius)
                .map(|m| m.hash.bits())
                .collect();
            found.sort_unstable();

            prop_assert_eq!(found, expected);
        }
    }
}
