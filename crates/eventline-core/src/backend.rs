//! The backend boundary: filtered views, streaming subscriptions,
//! cancellation.
//!
//! A [`CalendarBackend`] is an externally-owned collaborator. The monitor
//! only ever asks it to open a filtered view over a time window, to stream
//! component changes through a [`Subscription`], and to generate concrete
//! instances of a recurring component inside a window. Everything else
//! (wire protocol, auth, storage) is the backend's business.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::event::{ComponentId, RawComponent};
use crate::range::Range;

/// Cooperative cancellation handle carried by every subscription attempt.
///
/// Cancelling is the only early-exit mechanism for in-flight backend calls:
/// there are no timeouts. Cheap to clone; all clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> CancellationToken {
        CancellationToken::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// The query a view subscription is opened with: the visible time window
/// plus an optional user filter expression, conjoined.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewFilter {
    /// Window start, inclusive.
    pub start: DateTime<Utc>,
    /// Window end, exclusive.
    pub end: DateTime<Utc>,
    /// Optional backend-native filter expression (e.g. `categories:work`).
    pub expression: Option<String>,
}

impl ViewFilter {
    /// Build the subscription filter for a query window.
    pub fn from_window(range: &Range, expression: Option<&str>) -> ViewFilter {
        ViewFilter {
            start: range.start(),
            end: range.end(),
            expression: expression.map(str::to_string),
        }
    }

    /// The window as a `[start, end)` range.
    pub fn window(&self) -> Range {
        // start <= end is guaranteed by construction from a valid Range.
        Range::new(self.start, self.end, Default::default())
            .expect("view filter window is a valid range")
    }
}

impl std::fmt::Display for ViewFilter {
    /// Renders the s-expression form of the query, with the exclusive end
    /// pulled back one second to fit the backend's inclusive time-range
    /// predicate. Useful for logging what a subscription asked for.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let start = self.start.format("%Y%m%dT%H%M%SZ");
        let end = (self.end - Duration::seconds(1)).format("%Y%m%dT%H%M%SZ");

        match &self.expression {
            Some(expression) => write!(
                f,
                "(and (occur-in-time-range? (make-time \"{start}\") (make-time \"{end}\")) {expression})"
            ),
            None => write!(
                f,
                "(occur-in-time-range? (make-time \"{start}\") (make-time \"{end}\"))"
            ),
        }
    }
}

/// A change notification streamed by a live view.
#[derive(Debug, Clone)]
pub enum ViewEvent {
    /// Components matching the filter appeared: the initial backfill batch
    /// and later live additions.
    Added(Vec<RawComponent>),
    /// Matching components changed.
    Modified(Vec<RawComponent>),
    /// Matching components disappeared, identified by id only.
    Removed(Vec<ComponentId>),
    /// The initial backfill finished; everything after this is incremental.
    Complete,
}

/// Where a subscription delivers its [`ViewEvent`]s.
///
/// The monitor hands one sink per subscription to the backend; events
/// delivered through a sink belonging to a torn-down subscription are
/// silently discarded, so a backend may keep streaming into a stale sink
/// without corrupting a newer view.
#[derive(Clone)]
pub struct ViewEventSink {
    deliver: Arc<dyn Fn(ViewEvent) + Send + Sync>,
}

impl ViewEventSink {
    pub(crate) fn new(deliver: Arc<dyn Fn(ViewEvent) + Send + Sync>) -> ViewEventSink {
        ViewEventSink { deliver }
    }

    pub fn deliver(&self, event: ViewEvent) {
        (self.deliver)(event);
    }
}

impl std::fmt::Debug for ViewEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewEventSink").finish_non_exhaustive()
    }
}

/// A live, filtered view over one calendar.
pub trait Subscription: Send {
    /// Begin streaming. The backend must deliver the initial backfill as
    /// one or more [`ViewEvent::Added`] batches followed by
    /// [`ViewEvent::Complete`], then incremental changes as they happen.
    fn start(&mut self, sink: ViewEventSink) -> Result<()>;

    /// Stop streaming. No events may be delivered after this returns.
    fn stop(&mut self) -> Result<()>;
}

/// A calendar backend, shared by every monitor watching one of its
/// calendars.
pub trait CalendarBackend: Send + Sync {
    /// Open a filtered view.
    ///
    /// # Errors
    /// [`crate::EventlineError::Cancelled`] when `token` was cancelled
    /// mid-call (expected during teardown races), any other error for a
    /// genuine backend failure.
    fn open_filtered_view(
        &self,
        filter: &ViewFilter,
        token: &CancellationToken,
    ) -> Result<Box<dyn Subscription>>;

    /// Synchronously generate the concrete instances of a recurring
    /// component that fall within `[start, end)`, invoking `callback` once
    /// per instance. Returns early when `token` is cancelled.
    fn generate_instances(
        &self,
        component: &RawComponent,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        token: &CancellationToken,
        callback: &mut dyn FnMut(RawComponent),
    );
}
