//! Half-open time ranges with overlap classification.
//!
//! A [`Range`] is an immutable `[start, end)` interval. Following the overall
//! convention of iCalendar-based calendars, the start of a range is inclusive
//! and the end is exclusive — except for date-only ranges (all-day events),
//! where both day boundaries are treated as inclusive during comparisons.
//!
//! Whenever either operand of a binary operation is date-only, comparison
//! drops the time-of-day component entirely and compares calendar dates.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EventlineError, Result};

/// Controls how a range's boundaries are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RangeKind {
    /// Regular timed range: start inclusive, end exclusive.
    #[default]
    Timed,
    /// Whole-day range: comparisons ignore time-of-day, and both the start
    /// and end days are inclusive.
    DateOnly,
}

/// How two ranges overlap. See [`Range::overlap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    NoOverlap,
    Intersects,
    /// The first range fully contains the second.
    Superset,
    /// The first range is fully contained by the second.
    Subset,
    Equal,
}

/// Relative position of the first range of a comparison.
///
/// `Before` means the first range sorts before the second: it either starts
/// earlier, or starts at the same moment and ends earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangePosition {
    Before,
    Match,
    After,
}

impl RangePosition {
    /// The position the other operand would report: `Before` ↔ `After`,
    /// `Match` is symmetric.
    pub fn inverse(self) -> RangePosition {
        match self {
            RangePosition::Before => RangePosition::After,
            RangePosition::Match => RangePosition::Match,
            RangePosition::After => RangePosition::Before,
        }
    }
}

/// An immutable half-open time interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    kind: RangeKind,
}

/// Compare two timestamps by calendar date, ignoring time-of-day.
fn compare_date(a: &DateTime<Utc>, b: &DateTime<Utc>) -> Ordering {
    a.date_naive().cmp(&b.date_naive())
}

/// Full timestamp comparison.
fn compare_datetime(a: &DateTime<Utc>, b: &DateTime<Utc>) -> Ordering {
    a.cmp(b)
}

type CompareFn = fn(&DateTime<Utc>, &DateTime<Utc>) -> Ordering;

fn compare_fn_for(a: &Range, b: &Range) -> CompareFn {
    if a.kind == RangeKind::DateOnly || b.kind == RangeKind::DateOnly {
        compare_date
    } else {
        compare_datetime
    }
}

impl Range {
    /// Create a new range.
    ///
    /// # Errors
    /// Returns [`EventlineError::InvalidRange`] when `start > end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, kind: RangeKind) -> Result<Range> {
        if start > end {
            return Err(EventlineError::InvalidRange { start, end });
        }
        Ok(Range { start, end, kind })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn kind(&self) -> RangeKind {
        self.kind
    }

    /// Whether `datetime` falls inside this range.
    ///
    /// The end boundary is exclusive for timed ranges and inclusive for
    /// date-only ranges (an all-day event covers its whole last day).
    pub fn contains(&self, datetime: DateTime<Utc>) -> bool {
        match self.kind {
            RangeKind::Timed => datetime >= self.start && datetime < self.end,
            RangeKind::DateOnly => {
                compare_date(&datetime, &self.start) != Ordering::Less
                    && compare_date(&datetime, &self.end) != Ordering::Greater
            }
        }
    }

    /// Compare two ranges: by start first, then by end. Both comparisons use
    /// the date-only comparator when either range is date-only.
    pub fn compare(&self, other: &Range) -> Ordering {
        let cmp = compare_fn_for(self, other);
        cmp(&self.start, &other.start).then_with(|| cmp(&self.end, &other.end))
    }

    /// Classify how `self` and `other` overlap.
    ///
    /// The returned position is always relative to `self`: `After` means
    /// `self` comes after `other`. The heuristic for the position is:
    ///
    /// 1. If `self` begins before `other`, `self` comes before.
    /// 2. If both begin at precisely the same moment but `self` ends before
    ///    `other`, `self` comes before.
    /// 3. Otherwise `other` comes before `self`.
    pub fn overlap(&self, other: &Range) -> (Overlap, RangePosition) {
        /*
         * There are 11 cases to take care of:
         *
         * 1. Equal
         *
         *   A |------------------------|
         *   B |------------------------|
         *
         * 2. Superset
         *
         * i.
         *   A |------------------------|
         *   B |-------------------|
         *
         * ii.
         *   A |------------------------|
         *   B   |-------------------|
         *
         * iii.
         *   A |------------------------|
         *   B      |-------------------|
         *
         * 3. Subset (i–iii mirror the Superset cases)
         *
         * 4. Intersection
         *
         * i.
         *   A |--------------------|
         *   B     |--------------------|
         *
         * ii.
         *   A     |--------------------|
         *   B |--------------------|
         *
         * 5. No overlap
         *
         * i.
         *   A             |------------|
         *   B |-----------|
         *
         * ii.
         *   A |------------|
         *   B              |-----------|
         */
        let cmp = compare_fn_for(self, other);
        let start_start = cmp(&self.start, &other.start);
        let end_end = cmp(&self.end, &other.end);

        if start_start == Ordering::Equal && end_end == Ordering::Equal {
            // Case 1, the easiest.
            return (Overlap::Equal, RangePosition::Match);
        }

        if start_start == Ordering::Equal {
            return if end_end == Ordering::Greater {
                // Case 2.i
                (Overlap::Superset, RangePosition::After)
            } else {
                // Case 3.i
                (Overlap::Subset, RangePosition::Before)
            };
        }

        if end_end == Ordering::Equal {
            let start_end = cmp(&self.start, &other.end);
            let end_start = cmp(&self.end, &other.start);

            return if start_end != Ordering::Less {
                // Case 5.i for zero-length self
                (Overlap::NoOverlap, RangePosition::After)
            } else if end_start != Ordering::Greater {
                // Case 5.ii for zero-length other
                (Overlap::NoOverlap, RangePosition::Before)
            } else if start_start == Ordering::Less {
                // Case 2.iii
                (Overlap::Superset, RangePosition::Before)
            } else {
                // Case 3.iii
                (Overlap::Subset, RangePosition::After)
            };
        }

        if start_start == Ordering::Less && end_end == Ordering::Greater {
            // Case 2.ii
            return (Overlap::Superset, RangePosition::Before);
        }

        if start_start == Ordering::Greater && end_end == Ordering::Less {
            // Case 3.ii
            return (Overlap::Subset, RangePosition::After);
        }

        let start_end = cmp(&self.start, &other.end);
        let end_start = cmp(&self.end, &other.start);

        // No-overlap cases first.
        if start_end != Ordering::Less {
            // Case 5.i
            (Overlap::NoOverlap, RangePosition::After)
        } else if end_start != Ordering::Greater {
            // Case 5.ii
            (Overlap::NoOverlap, RangePosition::Before)
        } else if start_start == Ordering::Less
            && end_start == Ordering::Greater
            && end_end == Ordering::Less
        {
            // Case 4.i
            (Overlap::Intersects, RangePosition::Before)
        } else if start_start == Ordering::Greater
            && start_end == Ordering::Less
            && end_end == Ordering::Greater
        {
            // Case 4.ii
            (Overlap::Intersects, RangePosition::After)
        } else {
            // Every geometric arrangement is covered above; reaching this
            // arm means the classifier itself is corrupted.
            unreachable!("unhandled range overlap case: {self} vs {other}")
        }
    }

    /// The smallest range covering both `self` and `other`.
    ///
    /// The result is date-only when either input is date-only.
    pub fn union(&self, other: &Range) -> Range {
        let cmp = compare_fn_for(self, other);

        let start = if cmp(&self.start, &other.start) == Ordering::Less {
            self.start
        } else {
            other.start
        };

        let end = if cmp(&self.end, &other.end) == Ordering::Greater {
            self.end
        } else {
            other.end
        };

        let kind = if self.kind == RangeKind::DateOnly || other.kind == RangeKind::DateOnly {
            RangeKind::DateOnly
        } else {
            RangeKind::Timed
        };

        // start <= end holds for min/max of two valid ranges.
        Range { start, end, kind }
    }
}

impl fmt::Display for Range {
    /// Formats the range using ISO 8601 dates. Only useful for debugging.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} | {})",
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}
