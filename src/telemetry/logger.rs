//! Audit sink: syslog in production, capture or null elsewhere.
//!
//! The production sink writes JSON events to the local syslog daemon with
//! the `EGRESS_WARDEN` tag. The capture sink records events in memory so
//! tests can assert on the exact audit trail a request produced; the null
//! sink discards everything.

use std::sync::Mutex;

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "EGRESS_WARDEN";

enum Sink {
    Syslog(Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>),
    Capture(Mutex<Vec<AuditEvent>>),
    Null,
}

/// Audit logger that writes structured JSON events to its sink.
///
/// Interior mutability lets callers log through a shared reference; the
/// logger is typically held in an `Arc` on the server context.
pub struct AuditLogger {
    sink: Sink,
}

impl AuditLogger {
    /// Create an audit logger connected to the local syslog daemon.
    pub fn new() -> Result<Self, super::TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_DAEMON,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter).map_err(|e| {
            super::TelemetryError::SyslogConnection(format!("failed to connect to syslog: {e}"))
        })?;

        debug!("connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            sink: Sink::Syslog(Mutex::new(writer)),
        })
    }

    /// Create a null logger that discards all events.
    #[must_use]
    pub fn new_null() -> Self {
        Self { sink: Sink::Null }
    }

    /// Create a capture logger that records events in memory.
    #[must_use]
    pub fn new_capture() -> Self {
        Self {
            sink: Sink::Capture(Mutex::new(Vec::new())),
        }
    }

    /// Log an audit event.
    ///
    /// Serialization or transport failures are reported on the operational
    /// log and otherwise swallowed; audit logging must never take down a
    /// proxied connection.
    pub fn log(&self, event: AuditEvent) {
        match &self.sink {
            Sink::Null => {}
            Sink::Capture(events) => {
                events.lock().unwrap().push(event);
            }
            Sink::Syslog(writer) => {
                let json = match serde_json::to_string(&event.with_timestamp()) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("failed to serialize audit event: {}", e);
                        return;
                    }
                };
                match writer.lock() {
                    Ok(mut writer) => {
                        if let Err(e) = writer.info(&json) {
                            error!("failed to write to syslog: {}", e);
                        }
                    }
                    Err(e) => {
                        error!("audit logger mutex poisoned: {}", e);
                    }
                }
            }
        }
    }

    /// Snapshot of captured events. Empty unless this is a capture logger.
    #[must_use]
    pub fn captured(&self) -> Vec<AuditEvent> {
        match &self.sink {
            Sink::Capture(events) => events.lock().unwrap().clone(),
            _ => Vec::new(),
        }
    }
}
