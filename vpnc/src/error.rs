//! Error types shared across the daemon.

use std::io;

use thiserror::Error;

/// Top-level error for daemon operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Structural or semantic validation failure. Never applied; the
    /// offending config path is reported back to the caller.
    #[error("invalid configuration at {path}: {reason}")]
    InvalidConfig { path: String, reason: String },

    /// The service prefixes are too small for the configured tenants.
    #[error("allocator exhausted: {0}")]
    AllocatorExhausted(String),

    /// Timeout or disconnect talking to a subordinate daemon or the
    /// kernel. Recovered locally with backoff.
    #[error("transient driver failure: {0}")]
    DriverTransient(String),

    /// Configuration rejected by a subordinate daemon. The connection
    /// stays CONFIGURED with this reason attached.
    #[error("fatal driver failure: {0}")]
    DriverFatal(String),

    /// Retryable EBUSY/EEXIST from the kernel.
    #[error("kernel busy: {0}")]
    KernelBusy(String),

    /// An older duplicate SA could not be removed after retries.
    #[error("failed to reap SA {unique_id} after {attempts} attempts")]
    SaReapFailed { unique_id: String, attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Shorthand for an [`Error::InvalidConfig`] at a dotted config path.
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
