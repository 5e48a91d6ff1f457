//! Audit event types for structured logging.
//!
//! Events are serialized to JSON with an ISO8601 timestamp and shipped to
//! syslog for SIEM integration.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Which proxying mode handled a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    /// Plain HTTP forwarding.
    Http,
    /// CONNECT tunneling.
    Connect,
}

impl ProxyType {
    /// Stable lowercase name used in log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Connect => "connect",
        }
    }
}

/// The canonical decision record: the single structured summary of one
/// proxied request's outcome.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionRecord {
    /// Whether the request was allowed to proceed.
    pub allow: bool,
    /// Proxying mode of the request.
    pub proxy_type: ProxyType,
    /// Destination as the client presented it, `host:port`.
    pub requested_host: String,
    /// Role the request was attributed to; empty when none was extractable.
    pub role: String,
    /// Project metadata from the role's policy entry.
    pub project: Option<String>,
    /// Stable reason string for the decision.
    pub decision_reason: String,
    /// Bytes received from the upstream.
    pub bytes_in: u64,
    /// Bytes sent to the upstream.
    pub bytes_out: u64,
    /// Wall-clock time spent on the request.
    pub duration_ms: u64,
    /// Opaque client-provided trace identifier, echoed verbatim.
    pub trace_id: Option<String>,
}

/// Audit events for security logging.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Proxy started accepting connections.
    ProxyStart {
        /// Bound listen address.
        listen: String,
        /// Whether the listener requires client TLS.
        tls: bool,
    },

    /// Proxy stopped; drain outcome included.
    ProxyStop {
        /// Connections still open when the exit timeout expired.
        remaining_connections: usize,
    },

    /// Canonical per-request decision.
    Decision {
        /// The decision record.
        #[serde(flatten)]
        record: DecisionRecord,
    },

    /// The dialer was asked to reach an address that classifies as denied.
    /// Seen when a configured upstream proxy points at illegal address
    /// space; the request is refused.
    IllegalDial {
        /// The `host:port` that was refused.
        address: String,
    },
}

/// Wrapper adding a timestamp at serialization time.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The event itself, flattened.
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    #[must_use]
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
