//! Tests for the augmented AVL range tree.

use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use eventline_core::{Range, RangeKind, RangeTree, TraverseOrder};

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().expect("valid RFC 3339 timestamp")
}

fn range(start: &str, end: &str) -> Range {
    Range::new(ts(start), ts(end), RangeKind::Timed).expect("valid range")
}

fn day(d: u32) -> Range {
    range(
        &format!("2020-03-{d:02}T00:00:00Z"),
        &format!("2020-03-{d:02}T23:00:00Z"),
    )
}

#[test]
fn insert_and_query() {
    let mut tree: RangeTree<&str> = RangeTree::new();
    assert!(tree.is_empty());

    tree.insert(day(5), "five");
    tree.insert(day(10), "ten");
    tree.insert(day(15), "fifteen");
    assert_eq!(tree.len(), 3);

    let hits = tree.query_range(&range("2020-03-09T00:00:00Z", "2020-03-11T00:00:00Z"));
    assert_eq!(hits, vec!["ten"]);

    let all = tree.query_range(&range("2020-03-01T00:00:00Z", "2020-04-01T00:00:00Z"));
    assert_eq!(all, vec!["five", "ten", "fifteen"]);
}

#[test]
fn insert_remove_round_trip() {
    let mut tree: RangeTree<&str> = RangeTree::new();

    tree.insert(day(5), "five");
    tree.insert(day(10), "ten");
    let baseline = tree.payloads();

    tree.insert(day(7), "seven");
    tree.remove(&day(7), &"seven");

    // The tree is indistinguishable from before the insert.
    assert_eq!(tree.payloads(), baseline);
    assert_eq!(tree.len(), 2);
}

#[test]
fn multiplicity_shares_one_node() {
    let mut tree: RangeTree<&str> = RangeTree::new();
    let shared = day(5);

    tree.insert(shared, "first");
    tree.insert(shared, "second");
    assert_eq!(tree.len(), 2);

    // Removing one payload leaves exactly the other retrievable.
    tree.remove(&shared, &"first");
    assert_eq!(tree.query_range(&shared), vec!["second"]);
    assert_eq!(tree.len(), 1);

    tree.remove(&shared, &"second");
    assert!(tree.is_empty());
    assert!(tree.query_range(&shared).is_empty());
}

#[test]
fn remove_absent_range_is_a_noop() {
    let mut tree: RangeTree<&str> = RangeTree::new();
    tree.insert(day(5), "five");
    tree.insert(day(10), "ten");

    tree.remove(&day(20), &"missing");
    tree.remove(&day(5), &"not-five");

    assert_eq!(tree.len(), 2);
    assert_eq!(tree.payloads(), vec!["five", "ten"]);
}

#[test]
fn remove_payload_without_knowing_the_range() {
    let mut tree: RangeTree<&str> = RangeTree::new();
    tree.insert(day(5), "five");
    tree.insert(day(10), "ten");
    tree.insert(day(15), "fifteen");

    tree.remove_payload(&"ten");

    assert_eq!(tree.payloads(), vec!["five", "fifteen"]);

    // Unknown payloads are ignored.
    tree.remove_payload(&"never-inserted");
    assert_eq!(tree.len(), 2);
}

#[test]
fn remove_payload_targets_one_occurrence() {
    let mut tree: RangeTree<&str> = RangeTree::new();
    tree.insert(day(5), "dup");
    tree.insert(day(10), "dup");

    tree.remove_payload(&"dup");

    // Only the first in-order occurrence is gone.
    assert_eq!(tree.len(), 1);
    assert!(tree
        .query_range(&day(10))
        .contains(&"dup"));
    assert!(tree.query_range(&day(5)).is_empty());
}

#[test]
fn in_order_traversal_is_sorted() {
    let mut tree: RangeTree<u32> = RangeTree::new();
    for d in [17u32, 3, 25, 9, 1, 12, 21, 6, 28, 15] {
        tree.insert(day(d), d);
    }

    let mut keys = Vec::new();
    tree.traverse(TraverseOrder::InOrder, &mut |range, _| {
        keys.push(*range);
        ControlFlow::Continue(())
    });

    for pair in keys.windows(2) {
        assert_ne!(
            pair[0].compare(&pair[1]),
            std::cmp::Ordering::Greater,
            "in-order traversal must yield sorted keys"
        );
    }
}

#[test]
fn traversal_stops_when_visitor_breaks() {
    let mut tree: RangeTree<u32> = RangeTree::new();
    for d in 1..=20u32 {
        tree.insert(day(d), d);
    }

    let mut visited = 0;
    tree.traverse(TraverseOrder::InOrder, &mut |_, _| {
        visited += 1;
        if visited == 5 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    });

    assert_eq!(visited, 5);
}

#[test]
fn pre_and_post_order_visit_every_payload() {
    let mut tree: RangeTree<u32> = RangeTree::new();
    for d in 1..=15u32 {
        tree.insert(day(d), d);
    }

    for order in [TraverseOrder::PreOrder, TraverseOrder::PostOrder] {
        let mut visited = Vec::new();
        tree.traverse(order, &mut |_, payload| {
            visited.push(*payload);
            ControlFlow::Continue(())
        });

        visited.sort_unstable();
        assert_eq!(visited, (1..=15u32).collect::<Vec<_>>());
    }
}

#[test]
fn query_range_returns_every_matching_multiplicity() {
    let mut tree: RangeTree<&str> = RangeTree::new();
    let slot = day(5);

    tree.insert(slot, "a");
    tree.insert(slot, "b");
    tree.insert(day(6), "c");
    tree.insert(day(20), "far");

    let mut hits = tree.query_range(&range("2020-03-05T00:00:00Z", "2020-03-07T00:00:00Z"));
    hits.sort_unstable();
    assert_eq!(hits, vec!["a", "b", "c"]);
}

#[test]
fn count_range_matches_query_range() {
    let mut tree: RangeTree<u32> = RangeTree::new();
    for d in 1..=28u32 {
        tree.insert(day(d), d);
    }
    tree.insert(day(14), 100);

    let query = range("2020-03-10T00:00:00Z", "2020-03-20T00:00:00Z");
    assert_eq!(
        tree.count_range(&query),
        tree.query_range(&query).len() as u64
    );

    let empty = range("2021-01-01T00:00:00Z", "2021-01-02T00:00:00Z");
    assert_eq!(tree.count_range(&empty), 0);
}

#[test]
fn removals_keep_the_tree_consistent() {
    let mut tree: RangeTree<u32> = RangeTree::new();
    for d in 1..=28u32 {
        tree.insert(day(d), d);
    }

    // Remove from the middle, the edges, and in a scattered order; the
    // balance factors and subtree max stay accurate throughout.
    for d in [14u32, 1, 28, 7, 21, 2, 27] {
        tree.remove(&day(d), &d);
        assert_eq!(tree.check_integrity(), Ok(()));
    }
    assert_eq!(tree.len(), 21);

    let mut keys = Vec::new();
    tree.traverse(TraverseOrder::InOrder, &mut |range, _| {
        keys.push(*range);
        ControlFlow::Continue(())
    });
    for pair in keys.windows(2) {
        assert_ne!(pair[0].compare(&pair[1]), std::cmp::Ordering::Greater);
    }

    // Every survivor is still reachable through a query.
    let all = tree.query_range(&range("2020-03-01T00:00:00Z", "2020-04-01T00:00:00Z"));
    assert_eq!(all.len(), 21);
}
