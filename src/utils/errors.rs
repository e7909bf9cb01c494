// src/utils/errors.rs
//! Structured error types for the tracer.

use thiserror::Error;

/// Errors reported to callers of the tracer API.
///
/// Internal invariant violations never surface here; they abort the process
/// via [`fatal`] instead, since a corrupted trace stream is worse than a
/// crash.
#[derive(Error, Debug)]
pub enum TraceError {
    /// A session is already active or still draining.
    #[error("tracing is already enabled")]
    AlreadyEnabled,

    /// Configuration could not be loaded or deserialized.
    #[error("trace configuration error: {0}")]
    Config(String),
}

/// Result type for tracer operations.
pub type Result<T> = std::result::Result<T, TraceError>;

/// Abort the process on an unrecoverable internal failure.
///
/// Used for allocation failures and invariant violations on the recording
/// path, where continuing would silently corrupt the event stream.
pub(crate) fn fatal(msg: &str) -> ! {
    tracing::error!("fatal trace error: {msg}");
    std::process::abort()
}
