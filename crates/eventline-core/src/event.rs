//! Typed calendar events and the raw components they are parsed from.
//!
//! A backend streams [`RawComponent`]s; [`parse_event`] turns one into a
//! typed [`Event`] with a stable id and a time [`Range`]. Parsing is a pure
//! function — parse failures are per-item and never abort a stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EventlineError, Result};
use crate::range::{Range, RangeKind};

/// Identity of a raw component within a single calendar: the component uid
/// plus, for one expanded occurrence of a recurring event, the recurrence
/// instance id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ComponentId {
    pub uid: String,
    pub recurrence_id: Option<String>,
}

impl ComponentId {
    pub fn new(uid: impl Into<String>, recurrence_id: Option<String>) -> ComponentId {
        ComponentId {
            uid: uid.into(),
            recurrence_id,
        }
    }
}

/// Stable composite event id, used as the monitor's cache key.
///
/// Deterministically derived as `calendar:uid` for plain events and
/// `calendar:uid:rid` for expanded recurrence instances, so the same
/// component always maps to the same cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(String);

impl EventId {
    pub fn new(calendar_id: &str, uid: &str, recurrence_id: Option<&str>) -> EventId {
        match recurrence_id {
            Some(rid) => EventId(format!("{calendar_id}:{uid}:{rid}")),
            None => EventId(format!("{calendar_id}:{uid}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id names an expanded recurrence instance of the
    /// (instance-less) `master` id. Used to sweep lingering instances out of
    /// the cache when their master is modified or removed.
    pub fn is_instance_of(&self, master: &EventId) -> bool {
        self != master
            && self.0.starts_with(master.0.as_str())
            && self.0.as_bytes().get(master.0.len()) == Some(&b':')
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An opaque calendar component as delivered by a backend, before parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawComponent {
    /// Component uid. Components without one are skipped by the monitor.
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// All-day component: range boundaries compare date-only.
    pub all_day: bool,
    /// RFC 5545 recurrence rule, present on recurrence masters.
    pub rrule: Option<String>,
    /// Set on components that are one concrete occurrence of a recurring
    /// event (either server-expanded or expanded by us).
    pub recurrence_id: Option<String>,
    pub categories: Vec<String>,
}

impl RawComponent {
    /// A recurrence master carries recurrence rules and is not itself one
    /// expanded instance.
    pub fn is_recurrence_master(&self) -> bool {
        self.rrule.is_some() && self.recurrence_id.is_none()
    }

    pub fn component_id(&self) -> Option<ComponentId> {
        self.uid
            .as_ref()
            .map(|uid| ComponentId::new(uid.clone(), self.recurrence_id.clone()))
    }
}

/// A parsed calendar event owned by one calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    uid: String,
    recurrence_id: Option<String>,
    summary: String,
    categories: Vec<String>,
    range: Range,
}

impl Event {
    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn recurrence_id(&self) -> Option<&str> {
        self.recurrence_id.as_deref()
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn range(&self) -> &Range {
        &self.range
    }
}

/// Parse a raw component into a typed [`Event`].
///
/// # Errors
/// Returns [`EventlineError::Parse`] when the component has no uid, has no
/// start time, or describes an inverted time range.
pub fn parse_event(calendar_id: &str, component: &RawComponent) -> Result<Event> {
    let uid = component
        .uid
        .as_deref()
        .ok_or_else(|| EventlineError::Parse("component has no uid".into()))?;

    let start = component
        .start
        .ok_or_else(|| EventlineError::Parse(format!("component {uid} has no start time")))?;

    // A missing end means a zero-length (or, for all-day, single-day) event.
    let end = component.end.unwrap_or(start);

    let kind = if component.all_day {
        RangeKind::DateOnly
    } else {
        RangeKind::Timed
    };

    let range = Range::new(start, end, kind)
        .map_err(|e| EventlineError::Parse(format!("component {uid}: {e}")))?;

    Ok(Event {
        id: EventId::new(calendar_id, uid, component.recurrence_id.as_deref()),
        uid: uid.to_string(),
        recurrence_id: component.recurrence_id.clone(),
        summary: component.summary.clone().unwrap_or_default(),
        categories: component.categories.clone(),
        range,
    })
}
