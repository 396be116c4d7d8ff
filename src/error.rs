//! Errors returned when building or starting a [`TimedMap`](crate::TimedMap).
//!
//! The map operations themselves never fail: an absent key is reported as
//! `false` or `None`.

use thiserror::Error;

/// Errors that can occur while setting up the background tasks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The reaper and workers are Tokio tasks and need a runtime to spawn on
    #[error("no Tokio runtime available; construct and start the map from within a runtime")]
    NoRuntime,

    /// A configuration value was rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result type for map setup operations.
pub type Result<T> = std::result::Result<T, Error>;
