//! In-memory calendar backend.
//!
//! [`LocalBackend`] is a reference implementation of [`CalendarBackend`]
//! backed by a plain component list. It gives the monitor a real streaming
//! backend without any server: integration tests drive it, and it doubles
//! as the storage for purely local calendars.
//!
//! Recurrence expansion wraps the `rrule` crate: the component's RRULE and
//! DTSTART are assembled into an iCalendar text block, parsed into an
//! `RRuleSet`, and expanded with a hard instance cap.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rrule::RRuleSet;
use tracing::warn;

use crate::backend::{
    CalendarBackend, CancellationToken, Subscription, ViewEvent, ViewEventSink, ViewFilter,
};
use crate::error::{EventlineError, Result};
use crate::event::{ComponentId, RawComponent};

/// Upper bound on instances generated per recurrence expansion. Guards
/// against unbounded rules (no COUNT/UNTIL) over large windows.
const MAX_INSTANCES: u16 = 512;

struct OpenView {
    filter: ViewFilter,
    sink: Option<ViewEventSink>,
}

#[derive(Default)]
struct LocalState {
    components: HashMap<ComponentId, RawComponent>,
    views: HashMap<u64, OpenView>,
    next_view_id: u64,
    unavailable: bool,
}

/// An in-memory [`CalendarBackend`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct LocalBackend {
    state: Arc<Mutex<LocalState>>,
}

/// Whether `component` matches a view's query.
///
/// Plain components match when their time span overlaps the (inclusive)
/// window; a recurrence master matches when its series starts before the
/// window end, since later occurrences may fall inside. The optional
/// expression only understands `categories:<name>`.
fn matches_filter(filter: &ViewFilter, component: &RawComponent) -> bool {
    let Some(start) = component.start else {
        return false;
    };

    let in_window = if component.is_recurrence_master() {
        start < filter.end
    } else {
        let end = component.end.unwrap_or(start);
        (start < filter.end && end > filter.start)
            || (start == end && start >= filter.start && start < filter.end)
    };

    if !in_window {
        return false;
    }

    match filter.expression.as_deref() {
        Some(expression) => match expression.strip_prefix("categories:") {
            Some(category) => component.categories.iter().any(|c| c == category),
            // Unknown expression syntax matches everything.
            None => true,
        },
        None => true,
    }
}

impl LocalBackend {
    pub fn new() -> LocalBackend {
        LocalBackend::default()
    }

    /// Simulate the backend going away; subsequent view creation fails
    /// with a backend error until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Number of currently registered views, started or not.
    pub fn open_views(&self) -> usize {
        self.state.lock().views.len()
    }

    /// Store a component and stream it to every open view it matches.
    pub fn add_component(&self, component: RawComponent) {
        let Some(id) = component.component_id() else {
            return;
        };

        let sinks = {
            let mut state = self.state.lock();
            state.components.insert(id, component.clone());
            matching_sinks(&state, &component)
        };

        for sink in sinks {
            sink.deliver(ViewEvent::Added(vec![component.clone()]));
        }
    }

    /// Replace a stored component and stream the modification.
    pub fn modify_component(&self, component: RawComponent) {
        let Some(id) = component.component_id() else {
            return;
        };

        let sinks = {
            let mut state = self.state.lock();
            state.components.insert(id, component.clone());
            matching_sinks(&state, &component)
        };

        for sink in sinks {
            sink.deliver(ViewEvent::Modified(vec![component.clone()]));
        }
    }

    /// Drop a stored component and stream the removal to every open view.
    pub fn remove_component(&self, id: &ComponentId) {
        let sinks: Vec<ViewEventSink> = {
            let mut state = self.state.lock();
            if state.components.remove(id).is_none() {
                return;
            }
            state
                .views
                .values()
                .filter_map(|view| view.sink.clone())
                .collect()
        };

        for sink in sinks {
            sink.deliver(ViewEvent::Removed(vec![id.clone()]));
        }
    }
}

fn matching_sinks(state: &LocalState, component: &RawComponent) -> Vec<ViewEventSink> {
    state
        .views
        .values()
        .filter(|view| matches_filter(&view.filter, component))
        .filter_map(|view| view.sink.clone())
        .collect()
}

struct LocalSubscription {
    state: Arc<Mutex<LocalState>>,
    view_id: u64,
}

impl Subscription for LocalSubscription {
    fn start(&mut self, sink: ViewEventSink) -> Result<()> {
        let backfill: Vec<RawComponent> = {
            let mut state = self.state.lock();

            let Some(view) = state.views.get(&self.view_id) else {
                return Err(EventlineError::Backend("view already stopped".into()));
            };
            let filter = view.filter.clone();

            let backfill = state
                .components
                .values()
                .filter(|component| matches_filter(&filter, component))
                .cloned()
                .collect();

            if let Some(view) = state.views.get_mut(&self.view_id) {
                view.sink = Some(sink.clone());
            }

            backfill
        };

        if !backfill.is_empty() {
            sink.deliver(ViewEvent::Added(backfill));
        }
        sink.deliver(ViewEvent::Complete);

        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.state.lock().views.remove(&self.view_id);
        Ok(())
    }
}

impl Drop for LocalSubscription {
    /// A subscription dropped without `stop()` (e.g. a view creation
    /// abandoned mid-flight) must still release its registration.
    fn drop(&mut self) {
        self.state.lock().views.remove(&self.view_id);
    }
}

impl CalendarBackend for LocalBackend {
    fn open_filtered_view(
        &self,
        filter: &ViewFilter,
        token: &CancellationToken,
    ) -> Result<Box<dyn Subscription>> {
        if token.is_cancelled() {
            return Err(EventlineError::Cancelled);
        }

        let mut state = self.state.lock();

        if state.unavailable {
            return Err(EventlineError::Backend("local backend unavailable".into()));
        }

        let view_id = state.next_view_id;
        state.next_view_id += 1;
        state.views.insert(
            view_id,
            OpenView {
                filter: filter.clone(),
                sink: None,
            },
        );

        Ok(Box::new(LocalSubscription {
            state: Arc::clone(&self.state),
            view_id,
        }))
    }

    fn generate_instances(
        &self,
        component: &RawComponent,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        token: &CancellationToken,
        callback: &mut dyn FnMut(RawComponent),
    ) {
        let (Some(rrule), Some(dtstart)) = (component.rrule.as_deref(), component.start) else {
            return;
        };

        let duration = component
            .end
            .map(|component_end| component_end - dtstart)
            .unwrap_or_else(chrono::Duration::zero);

        // Assemble the iCalendar text block the rrule crate parses.
        let rrule_text = format!(
            "DTSTART:{}\nRRULE:{}",
            dtstart.format("%Y%m%dT%H%M%SZ"),
            rrule
        );

        let rrule_set: RRuleSet = match rrule_text.parse() {
            Ok(set) => set,
            Err(e) => {
                warn!(
                    uid = component.uid.as_deref().unwrap_or_default(),
                    "invalid recurrence rule: {e}"
                );
                return;
            }
        };

        let instances = rrule_set.all(MAX_INSTANCES);

        for date in instances.dates {
            if token.is_cancelled() {
                return;
            }

            let instance_start: DateTime<Utc> = date.with_timezone(&Utc);
            let instance_end = instance_start + duration;

            // Clip to the requested window.
            if instance_start >= end || instance_end < start {
                continue;
            }

            callback(RawComponent {
                rrule: None,
                recurrence_id: Some(instance_start.format("%Y%m%dT%H%M%SZ").to_string()),
                start: Some(instance_start),
                end: Some(instance_end),
                ..component.clone()
            });
        }
    }
}
