//! Audit events and the canonical decision record.
//!
//! Two logging concerns live side by side and never mix:
//!
//! - **Operational logging** goes through `tracing` and is configured by the
//!   binary's verbosity flags.
//! - **Audit logging** serializes typed events to JSON and ships them to
//!   syslog for SIEM ingestion. Tests swap in an in-memory capture sink.
//!
//! The centerpiece is the canonical decision record: exactly one per proxied
//! request, emitted with the stable message [`CANONICAL_PROXY_DECISION`] and
//! a fixed field set, so downstream tooling can key on it.

mod error;
mod events;
mod logger;

pub use error::TelemetryError;
pub use events::{AuditEvent, DecisionRecord, ProxyType};
pub use logger::{AuditLogger, SYSLOG_TAG};

use tracing::info;

/// Stable message of the canonical decision log line.
pub const CANONICAL_PROXY_DECISION: &str = "CANONICAL-PROXY-DECISION";

/// Emit the canonical decision record for one proxied request.
///
/// The record is written once to the operational log at INFO with its full
/// field set, and once to the audit sink. Callers are responsible for the
/// exactly-once discipline; every request trajectory ends in a single call
/// to this function.
pub fn emit_decision(audit: &AuditLogger, record: DecisionRecord) {
    info!(
        allow = record.allow,
        proxy_type = record.proxy_type.as_str(),
        requested_host = %record.requested_host,
        role = %record.role,
        project = record.project.as_deref().unwrap_or(""),
        decision_reason = %record.decision_reason,
        bytes_in = record.bytes_in,
        bytes_out = record.bytes_out,
        duration_ms = record.duration_ms,
        trace_id = record.trace_id.as_deref().unwrap_or(""),
        "{}",
        CANONICAL_PROXY_DECISION,
    );
    audit.log(AuditEvent::Decision { record });
}
