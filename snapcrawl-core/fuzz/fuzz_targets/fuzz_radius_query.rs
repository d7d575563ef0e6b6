#![no_main]

//! Fuzz target for SimilarityIndex radius queries
//!
//! Builds an index from arbitrary hashes and checks every radius query
//! against a linear scan.
//!
//! Run with: cargo +nightly fuzz run fuzz_radius_query

use libfuzzer_sys::fuzz_target;
use snapcrawl_core::{PerceptualHash, SimilarityIndex};

fuzz_target!(|data: &[u8]| {
    if data.len() < 9 {
        return;
    }
    let radius = u32::from(data[0] % 65);
    let hashes: Vec<PerceptualHash> = data[1..]
        .chunks_exact(8)
        .map(|chunk| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(chunk);
            PerceptualHash::new(u64::from_le_bytes(bytes))
        })
        .collect();
    let Some((&query, stored)) = hashes.split_last() else {
        return;
    };

    let index = SimilarityIndex::from_hashes(stored.iter().copied());

    let mut found: Vec<u64> = index
        .find_within_radius(query, radius)
        .map(|m| {
            assert_eq!(m.distance, m.hash.hamming_distance(query));
            m.hash.bits()
        })
        .collect();
    found.sort_unstable();

    let mut expected: Vec<u64> = stored
        .iter()
        .filter(|h| h.hamming_distance(query) <= radius)
        .map(|h| h.bits())
        .collect();
    expected.sort_unstable();
    expected.dedup();

    assert_eq!(found, expected);
    assert_eq!(
        index.has_exact_match(query),
        stored.contains(&query)
    );
});
