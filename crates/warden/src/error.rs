//! Unified error type for the governance engine.
//!
//! The variants mirror how failures are handled: `InvalidInput` and
//! `PermissionDenied` are terminal for a single request, `NotFound` means
//! "skip this item" inside the daemon, and `Transient` is retried naturally
//! at the next poll cycle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Timeouts and other failures expected to clear by the next cycle.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("telemetry error: {0}")]
    Telemetry(#[from] nvml_wrapper::error::NvmlError),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WardenError>;

impl WardenError {
    /// True when the daemon should drop the current item and keep going.
    pub fn is_skippable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Transient(_))
    }
}
