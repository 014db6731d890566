//! # eventline-core
//!
//! Data and event synchronization core for a desktop calendar application.
//!
//! Given one or more calendar backends, this crate maintains an
//! always-current, deduplicated, range-filtered view of calendar events for
//! the time window the UI is displaying, and lets UI components efficiently
//! ask "which events overlap this sub-range" without rescanning the whole
//! event set.
//!
//! ## Modules
//!
//! - [`range`] — half-open time intervals with overlap classification
//! - [`range_tree`] — augmented AVL tree keyed by ranges, with multiplicity
//! - [`event`] — typed events, stable ids, raw-component parsing
//! - [`backend`] — the backend boundary: views, subscriptions, cancellation
//! - [`local`] — in-memory reference backend with RRULE expansion
//! - [`monitor`] — the per-calendar background synchronization engine
//! - [`error`] — error types

pub mod backend;
pub mod error;
pub mod event;
pub mod local;
pub mod monitor;
pub mod range;
pub mod range_tree;

pub use backend::{CalendarBackend, CancellationToken, Subscription, ViewEvent, ViewFilter};
pub use error::EventlineError;
pub use event::{parse_event, ComponentId, Event, EventId, RawComponent};
pub use local::LocalBackend;
pub use monitor::{CalendarMonitor, MonitorListener};
pub use range::{Overlap, Range, RangeKind, RangePosition};
pub use range_tree::{RangeTree, TraverseOrder};
