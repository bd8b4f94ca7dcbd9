//! Property-based coverage for the extent binary format (C1), exercising
//! the round-trip, idempotent-serialization and sparse-bitmap invariants
//! from spec.md's testable-properties section (P1, P2, I9, I10) at the
//! crate's public boundary rather than from within `src/extent/format.rs`.

use fsx::extent::format::{build, count_present, extract_page, parse_header, present_indices, validate};
use proptest::collection::{hash_map, vec as pvec};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn pages_strategy(page_size: usize, max_pages: u32) -> impl Strategy<Value = BTreeMap<u32, Vec<u8>>> {
    hash_map(0..max_pages, pvec(any::<u8>(), page_size), 0..=max_pages as usize)
        .prop_map(|m| m.into_iter().collect::<BTreeMap<_, _>>())
}

proptest! {
    /// P1: round-trip of the extent format for any sparse page map with a
    /// uniform page size.
    #[test]
    fn prop_round_trip_extract_page(pages in pages_strategy(32, 24)) {
        let blob = build(&pages, 32, 0).unwrap();
        prop_assert!(validate(&blob));
        for (idx, bytes) in &pages {
            prop_assert_eq!(extract_page(&blob, *idx).as_ref(), Some(bytes));
        }
    }

    /// P2: building the same page map twice produces byte-identical output.
    #[test]
    fn prop_idempotent_build(pages in pages_strategy(32, 24)) {
        let a = build(&pages, 32, 0).unwrap();
        let b = build(&pages, 32, 0).unwrap();
        prop_assert_eq!(a, b);
    }

    /// I9/I10: the header's declared extent size and present-page count
    /// always agree with the bitmap's popcount, and the FNV-1a checksum
    /// always validates against the data section it was computed over.
    #[test]
    fn prop_sparse_bitmap_consistency(pages in pages_strategy(16, 40)) {
        let blob = build(&pages, 16, 0).unwrap();
        let header = parse_header(&blob).unwrap();
        prop_assert_eq!(count_present(&blob), pages.len() as u32);
        prop_assert_eq!(header.extent_size as usize, pages.len() * 16);
        prop_assert_eq!(present_indices(&blob).len(), pages.len());
        prop_assert!(validate(&blob));
    }

    /// Flipping any single byte in a non-empty extent's data section must
    /// cause validation to fail (checksum tamper detection, S7).
    #[test]
    fn prop_tamper_detection(pages in pages_strategy(16, 8).prop_filter("need at least one page", |m| !m.is_empty()), flip_offset in 0usize..64) {
        let blob = build(&pages, 16, 0).unwrap();
        prop_assume!(blob.len() > 64);
        let idx = 64 + (flip_offset % (blob.len() - 64));
        let mut tampered = blob.clone();
        tampered[idx] ^= 0xFF;
        prop_assert!(!validate(&tampered));
    }
}
