//! Property-based tests for the range tree and the overlap classifier.
//!
//! These verify invariants that should hold for *any* sequence of
//! operations, not just the hand-picked examples in `range_tree_tests.rs`.

use std::ops::ControlFlow;

use chrono::{DateTime, TimeZone, Utc};
use eventline_core::{Overlap, Range, RangeKind, RangeTree, TraverseOrder};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

const EPOCH_2020: i64 = 1_577_836_800;

fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    // One year of hour-aligned timestamps starting 2020-01-01.
    (0i64..=24 * 365).prop_map(|hours| {
        Utc.timestamp_opt(EPOCH_2020 + hours * 3600, 0)
            .single()
            .expect("in-range timestamp")
    })
}

fn arb_range() -> impl Strategy<Value = Range> {
    (arb_timestamp(), 0i64..=96).prop_map(|(start, duration_hours)| {
        let end = start + chrono::Duration::hours(duration_hours);
        Range::new(start, end, RangeKind::Timed).expect("start <= end by construction")
    })
}

#[derive(Debug, Clone)]
enum Op {
    Insert(Range),
    /// Remove the entry made by the i-th insert so far (modulo count).
    RemoveEarlier(usize),
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => arb_range().prop_map(Op::Insert),
            1 => (0usize..64).prop_map(Op::RemoveEarlier),
        ],
        1..80,
    )
}

/// Collect the in-order key sequence of a tree.
fn in_order_keys(tree: &RangeTree<usize>) -> Vec<Range> {
    let mut keys = Vec::new();
    tree.traverse(TraverseOrder::InOrder, &mut |range, _| {
        keys.push(*range);
        ControlFlow::Continue(())
    });
    keys
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    /// The position reported by the overlap classifier is the exact inverse
    /// relation when the operands are swapped.
    #[test]
    fn overlap_position_inverts(a in arb_range(), b in arb_range()) {
        let (_, position) = a.overlap(&b);
        let (_, reverse) = b.overlap(&a);
        prop_assert_eq!(reverse, position.inverse());
    }

    /// The overlap classification itself mirrors: Superset ↔ Subset,
    /// everything else is symmetric.
    #[test]
    fn overlap_kind_mirrors(a in arb_range(), b in arb_range()) {
        let (forward, _) = a.overlap(&b);
        let (backward, _) = b.overlap(&a);

        let expected = match forward {
            Overlap::Superset => Overlap::Subset,
            Overlap::Subset => Overlap::Superset,
            other => other,
        };
        prop_assert_eq!(backward, expected);
    }

    /// After any sequence of inserts and removes: every node passes the
    /// integrity walk (balance factor, stored height, subtree max),
    /// in-order traversal is sorted, the stored multiset matches a model,
    /// and the height stays within the AVL bound.
    #[test]
    fn tree_stays_sorted_balanced_and_complete(ops in arb_ops()) {
        let mut tree: RangeTree<usize> = RangeTree::new();
        let mut model: Vec<(Range, usize)> = Vec::new();
        let mut inserted: Vec<(Range, usize)> = Vec::new();
        let mut next_payload = 0usize;

        for op in ops {
            match op {
                Op::Insert(range) => {
                    tree.insert(range, next_payload);
                    model.push((range, next_payload));
                    inserted.push((range, next_payload));
                    next_payload += 1;
                }
                Op::RemoveEarlier(index) => {
                    if inserted.is_empty() {
                        continue;
                    }
                    let (range, payload) = inserted.remove(index % inserted.len());
                    tree.remove(&range, &payload);
                    if let Some(position) = model.iter().position(|(r, p)| *r == range && *p == payload) {
                        model.remove(position);
                    }
                }
            }

            // Per-node balance, stored height, and subtree max
            // augmentation hold after every mutation.
            prop_assert_eq!(tree.check_integrity(), Ok(()));
        }

        // Multiset equality with the model.
        prop_assert_eq!(tree.len(), model.len());
        let mut stored = tree.payloads();
        stored.sort_unstable();
        let mut expected: Vec<usize> = model.iter().map(|(_, p)| *p).collect();
        expected.sort_unstable();
        prop_assert_eq!(stored, expected);

        // Sorted in-order traversal.
        let keys = in_order_keys(&tree);
        for pair in keys.windows(2) {
            prop_assert_ne!(pair[0].compare(&pair[1]), std::cmp::Ordering::Greater);
        }

        // AVL height bound: 1.44 * log2(n + 2).
        let n = keys.len() as f64;
        let bound = (1.4405 * (n + 2.0).log2()).ceil() as i64;
        prop_assert!(
            tree.height() <= bound.max(1),
            "height {} exceeds AVL bound {} for {} nodes",
            tree.height(),
            bound,
            keys.len()
        );
    }

    /// `query_range` returns exactly the payloads whose key overlaps the
    /// query, for arbitrary trees and arbitrary queries.
    #[test]
    fn query_range_matches_brute_force(
        entries in prop::collection::vec(arb_range(), 1..60),
        query in arb_range(),
    ) {
        let mut tree: RangeTree<usize> = RangeTree::new();
        for (payload, range) in entries.iter().enumerate() {
            tree.insert(*range, payload);
        }

        let mut result = tree.query_range(&query);
        result.sort_unstable();

        let mut expected: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(_, range)| range.overlap(&query).0 != Overlap::NoOverlap)
            .map(|(payload, _)| payload)
            .collect();
        expected.sort_unstable();

        // Counting agrees without collecting.
        prop_assert_eq!(tree.count_range(&query), expected.len() as u64);
        prop_assert_eq!(result, expected);
    }
}
