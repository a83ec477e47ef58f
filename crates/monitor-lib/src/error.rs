//! Error types for the resource monitor.

use thiserror::Error;

/// Failures raised by telemetry backends.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Backend reachable but holds no usable data for the target
    #[error("Telemetry unavailable for {target}: {reason}")]
    Unavailable { target: String, reason: String },

    /// Timeout, connection failure or non-2xx response
    #[error("Telemetry transport error for {target}: {reason}")]
    Transport { target: String, reason: String },

    /// Raw samples that cannot be combined into a record
    #[error("Inconsistent telemetry for {target}: {reason}")]
    Inconsistent { target: String, reason: String },

    #[error("Failed to decode telemetry for {target}: {reason}")]
    Decode { target: String, reason: String },
}

impl TelemetryError {
    pub fn unavailable(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Transport {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn inconsistent(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Inconsistent {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn decode(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Decode {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Transport failures are logged at error level, everything else is "no data"
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Failures raised while running a monitoring tick.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// A required policy value is absent or malformed
    #[error("Configuration error for {key}: {reason}")]
    Configuration { key: String, reason: String },

    #[error("Lock {name} unavailable")]
    LockUnavailable { name: String },

    #[error("Run store error: {0}")]
    Store(String),

    #[error("Notification error: {0}")]
    Notification(String),
}

impl MonitorError {
    pub fn configuration(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias for tick-level operations.
pub type Result<T> = std::result::Result<T, MonitorError>;
