//! Error types for telemetry operations.

use thiserror::Error;

/// Errors initializing or writing audit telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Could not connect to the local syslog daemon.
    #[error("syslog connection failed: {0}")]
    SyslogConnection(String),

    /// Event serialization failed.
    #[error("failed to serialize audit event: {0}")]
    Serialization(#[from] serde_json::Error),
}
