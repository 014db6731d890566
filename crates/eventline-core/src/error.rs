//! Error types for eventline-core operations.

use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventlineError {
    /// A range was constructed with `start > end`.
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// A raw component could not be turned into an event. Per-item and
    /// non-fatal: the monitor logs it and skips the component.
    #[error("component parse error: {0}")]
    Parse(String),

    /// The backend refused or failed a call for a reason other than
    /// cancellation.
    #[error("backend error: {0}")]
    Backend(String),

    /// An in-flight backend call was cancelled. Expected during rapid
    /// teardown/recreate cycles; not a failure.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, EventlineError>;
