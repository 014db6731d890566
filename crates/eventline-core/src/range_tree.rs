//! Augmented AVL tree keyed by time ranges.
//!
//! [`RangeTree`] is an augmented AVL tree that handles time ranges rather
//! than point values, letting calendar views answer "which events overlap
//! this sub-range" in better than linear time. Each node carries the maximum
//! end timestamp of its subtree, and the same range key may be inserted
//! multiple times with distinct payloads (two events with an identical time
//! span share one node with a hit count).
//!
//! Conforming to the overall standard of iCalendar ranges, the start of a
//! range is inclusive and the end is exclusive.

use std::cmp::Ordering;
use std::ops::ControlFlow;

use chrono::{DateTime, Utc};

use crate::range::{Overlap, Range, RangePosition};

/// Traversal orders accepted by [`RangeTree::traverse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseOrder {
    PreOrder,
    InOrder,
    PostOrder,
}

struct Node<P> {
    left: Option<Box<Node<P>>>,
    right: Option<Box<Node<P>>>,
    key: Range,
    /// Maximum end timestamp across this node's key and both subtrees.
    max: DateTime<Utc>,
    height: i64,
    /// Payloads sharing this exact range key. The hit count of the node is
    /// the length of this vector; the node dies when it reaches zero.
    payloads: Vec<P>,
}

impl<P> Node<P> {
    fn new(key: Range, payload: P) -> Box<Node<P>> {
        Box::new(Node {
            left: None,
            right: None,
            max: key.end(),
            height: 1,
            key,
            payloads: vec![payload],
        })
    }
}

fn height<P>(n: &Option<Box<Node<P>>>) -> i64 {
    n.as_ref().map_or(0, |n| n.height)
}

fn subtree_max<P>(n: &Option<Box<Node<P>>>) -> Option<DateTime<Utc>> {
    n.as_ref().map(|n| n.max)
}

/// Recompute a node's height and subtree max from its children.
fn update<P>(n: &mut Node<P>) {
    n.height = height(&n.left).max(height(&n.right)) + 1;

    let mut max = n.key.end();
    if let Some(left_max) = subtree_max(&n.left) {
        max = max.max(left_max);
    }
    if let Some(right_max) = subtree_max(&n.right) {
        max = max.max(right_max);
    }
    n.max = max;
}

fn balance<P>(n: &Node<P>) -> i64 {
    height(&n.left) - height(&n.right)
}

fn rotate_left<P>(mut n: Box<Node<P>>) -> Box<Node<P>> {
    let mut pivot = n.right.take().expect("rotate_left requires a right child");
    n.right = pivot.left.take();
    update(&mut n);
    pivot.left = Some(n);
    update(&mut pivot);
    pivot
}

fn rotate_right<P>(mut n: Box<Node<P>>) -> Box<Node<P>> {
    let mut pivot = n.left.take().expect("rotate_right requires a left child");
    n.left = pivot.right.take();
    update(&mut n);
    pivot.right = Some(n);
    update(&mut pivot);
    pivot
}

/// Restore the AVL balance invariant at `n` after a mutation below it.
fn rebalance<P>(mut n: Box<Node<P>>) -> Box<Node<P>> {
    update(&mut n);

    let node_balance = balance(&n);
    if node_balance > 1 {
        let left = n.left.as_ref().expect("left-heavy node has a left child");
        if height(&left.right) > height(&left.left) {
            n.left = Some(rotate_left(n.left.take().expect("checked above")));
        }
        rotate_right(n)
    } else if node_balance < -1 {
        let right = n.right.as_ref().expect("right-heavy node has a right child");
        if height(&right.right) < height(&right.left) {
            n.right = Some(rotate_right(n.right.take().expect("checked above")));
        }
        rotate_left(n)
    } else {
        n
    }
}

fn insert<P>(n: Option<Box<Node<P>>>, range: Range, payload: P) -> Box<Node<P>> {
    let Some(mut n) = n else {
        return Node::new(range, payload);
    };

    match range.compare(&n.key) {
        Ordering::Less => n.left = Some(insert(n.left.take(), range, payload)),
        Ordering::Greater => n.right = Some(insert(n.right.take(), range, payload)),
        Ordering::Equal => {
            // Same interval, one more hit.
            n.payloads.push(payload);
            return n;
        }
    }

    rebalance(n)
}

/// Detach the minimum node of the subtree, returning it along with the
/// rebalanced remainder.
fn take_minimum<P>(mut n: Box<Node<P>>) -> (Box<Node<P>>, Option<Box<Node<P>>>) {
    match n.left.take() {
        None => {
            let rest = n.right.take();
            (n, rest)
        }
        Some(left) => {
            let (min, rest) = take_minimum(left);
            n.left = rest;
            (min, Some(rebalance(n)))
        }
    }
}

/// Remove one payload occurrence from `n`, dropping the node itself when its
/// hit count reaches zero. Standard AVL deletion: the in-order successor is
/// promoted from the right subtree.
fn delete_payload<P: PartialEq>(
    mut n: Box<Node<P>>,
    payload: &P,
    removed: &mut bool,
) -> Option<Box<Node<P>>> {
    match n.payloads.iter().position(|p| p == payload) {
        Some(index) => {
            n.payloads.remove(index);
            *removed = true;
        }
        // The range matched but this payload never lived here.
        None => return Some(n),
    }

    // Only remove the node when the hit count reaches zero.
    if !n.payloads.is_empty() {
        return Some(n);
    }

    let left = n.left.take();
    let right = n.right.take();

    match right {
        None => left,
        Some(right) => {
            let (mut successor, rest) = take_minimum(right);
            successor.right = rest;
            successor.left = left;
            Some(rebalance(successor))
        }
    }
}

fn remove<P: PartialEq>(
    n: Option<Box<Node<P>>>,
    range: &Range,
    payload: &P,
    removed: &mut bool,
) -> Option<Box<Node<P>>> {
    let mut n = n?;

    let (_, position) = range.overlap(&n.key);
    match position {
        RangePosition::Before => n.left = remove(n.left.take(), range, payload, removed),
        RangePosition::Match => return delete_payload(n, payload, removed),
        RangePosition::After => n.right = remove(n.right.take(), range, payload, removed),
    }

    Some(rebalance(n))
}

/// Recompute height and subtree max bottom-up, comparing them against the
/// stored values and checking the balance factor at every node. Returns the
/// recomputed `(height, max)` of the subtree.
fn check_node<P>(n: &Option<Box<Node<P>>>) -> Result<Option<(i64, DateTime<Utc>)>, String> {
    let Some(n) = n else {
        return Ok(None);
    };

    let left = check_node(&n.left)?;
    let right = check_node(&n.right)?;

    let left_height = left.map_or(0, |(h, _)| h);
    let right_height = right.map_or(0, |(h, _)| h);
    if (left_height - right_height).abs() > 1 {
        return Err(format!(
            "node {} is unbalanced: left height {left_height}, right height {right_height}",
            n.key
        ));
    }

    let height = left_height.max(right_height) + 1;
    if n.height != height {
        return Err(format!(
            "node {} stores height {}, recomputed {height}",
            n.key, n.height
        ));
    }

    let mut max = n.key.end();
    if let Some((_, left_max)) = left {
        max = max.max(left_max);
    }
    if let Some((_, right_max)) = right {
        max = max.max(right_max);
    }
    if n.max != max {
        return Err(format!(
            "node {} stores subtree max {}, recomputed {max}",
            n.key, n.max
        ));
    }

    Ok(Some((height, max)))
}

fn run_visitor<P, F>(n: &Node<P>, visitor: &mut F) -> ControlFlow<()>
where
    F: FnMut(&Range, &P) -> ControlFlow<()>,
{
    for payload in &n.payloads {
        visitor(&n.key, payload)?;
    }
    ControlFlow::Continue(())
}

fn traverse<P, F>(n: &Option<Box<Node<P>>>, order: TraverseOrder, visitor: &mut F) -> ControlFlow<()>
where
    F: FnMut(&Range, &P) -> ControlFlow<()>,
{
    let Some(n) = n else {
        return ControlFlow::Continue(());
    };

    if order == TraverseOrder::PreOrder {
        run_visitor(n, visitor)?;
    }

    traverse(&n.left, order, visitor)?;

    if order == TraverseOrder::InOrder {
        run_visitor(n, visitor)?;
    }

    traverse(&n.right, order, visitor)?;

    if order == TraverseOrder::PostOrder {
        run_visitor(n, visitor)?;
    }

    ControlFlow::Continue(())
}

/// Multiset of `(Range, payload)` pairs with ordered traversal and
/// range-overlap queries.
pub struct RangeTree<P> {
    root: Option<Box<Node<P>>>,
    len: usize,
}

impl<P> Default for RangeTree<P> {
    fn default() -> Self {
        RangeTree { root: None, len: 0 }
    }
}

impl<P: PartialEq + Clone> RangeTree<P> {
    pub fn new() -> RangeTree<P> {
        RangeTree::default()
    }

    /// Number of stored payloads, counting multiplicities.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Height of the tree. Zero when empty; AVL balancing keeps this within
    /// ~1.44·log2(n) of a perfectly balanced tree.
    pub fn height(&self) -> i64 {
        height(&self.root)
    }

    /// Walk every node and verify its stored height, its subtree max
    /// augmentation, and the AVL balance factor against recomputed values.
    /// Debugging aid for the test suite; the error names the first corrupted
    /// node.
    pub fn check_integrity(&self) -> Result<(), String> {
        check_node(&self.root).map(|_| ())
    }

    /// Add `range` to the tree with `payload` attached. Multiple entries may
    /// share the same interval, in which case the interval node behaves like
    /// a refcount.
    pub fn insert(&mut self, range: Range, payload: P) {
        self.root = Some(insert(self.root.take(), range, payload));
        self.len += 1;
    }

    /// Remove one `(range, payload)` occurrence. A mismatched range or
    /// payload is a silent no-op; the tree is never corrupted by it.
    pub fn remove(&mut self, range: &Range, payload: &P) {
        let mut removed = false;
        self.root = remove(self.root.take(), range, payload, &mut removed);
        if removed {
            self.len -= 1;
        }
    }

    /// Remove the first occurrence of `payload` found in in-order traversal.
    /// Used when the caller no longer knows the range the payload was stored
    /// under (e.g. the event's time changed).
    pub fn remove_payload(&mut self, payload: &P) {
        let mut found: Option<Range> = None;
        self.traverse(TraverseOrder::InOrder, &mut |range, p| {
            if p == payload {
                found = Some(*range);
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });

        if let Some(range) = found {
            self.remove(&range, payload);
        }
    }

    /// Traverse the tree, calling `visitor` once per `(range, payload)` hit.
    /// Traversal halts as soon as the visitor breaks.
    pub fn traverse<F>(&self, order: TraverseOrder, visitor: &mut F)
    where
        F: FnMut(&Range, &P) -> ControlFlow<()>,
    {
        let _ = traverse(&self.root, order, visitor);
    }

    /// Every payload whose range overlaps `range`, across multiplicities.
    ///
    /// In-order traversal with pruning: nodes strictly before the queried
    /// range are skipped, and the first node strictly after it terminates
    /// the scan (in-order yields keys in sorted order).
    pub fn query_range(&self, range: &Range) -> Vec<P> {
        let mut result = Vec::new();
        self.traverse(TraverseOrder::InOrder, &mut |key, payload| {
            let (overlap, position) = key.overlap(range);
            if overlap == Overlap::NoOverlap {
                match position {
                    RangePosition::Before => return ControlFlow::Continue(()),
                    RangePosition::After => return ControlFlow::Break(()),
                    RangePosition::Match => {}
                }
            }
            result.push(payload.clone());
            ControlFlow::Continue(())
        });
        result
    }

    /// Count the payloads whose range overlaps `range`, without collecting
    /// them. Same pruning as [`RangeTree::query_range`].
    pub fn count_range(&self, range: &Range) -> u64 {
        let mut counter = 0u64;
        self.traverse(TraverseOrder::InOrder, &mut |key, _| {
            let (overlap, position) = key.overlap(range);
            if overlap == Overlap::NoOverlap {
                match position {
                    RangePosition::Before => return ControlFlow::Continue(()),
                    RangePosition::After => return ControlFlow::Break(()),
                    RangePosition::Match => {}
                }
            }
            counter += 1;
            ControlFlow::Continue(())
        });
        counter
    }

    /// All stored payloads in in-order key order.
    pub fn payloads(&self) -> Vec<P> {
        let mut result = Vec::with_capacity(self.len);
        self.traverse(TraverseOrder::InOrder, &mut |_, payload| {
            result.push(payload.clone());
            ControlFlow::Continue(())
        });
        result
    }
}
