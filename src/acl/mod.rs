//! Per-role egress ACL evaluation.
//!
//! The engine maps a `(role, destination hostname)` pair onto an allow/deny
//! decision under one of three enforcement modes:
//!
//! - `open` — every destination is allowed; the decision is still logged.
//! - `report` — the host list is evaluated, but a miss only records a
//!   "would deny" and the request proceeds.
//! - `enforce` — a miss denies the request.
//!
//! # Pattern Matching
//!
//! - Exact match: `example.com`
//! - Wildcard match: `*.example.com` matches `api.example.com` and
//!   `deep.sub.example.com`, but NOT `example.com` itself.
//!
//! Matching is case-insensitive and operates on the hostname the client
//! presented, never on resolved IPs; address-level policy is a separate axis
//! composed by the proxy layer.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

/// Decision reason for an open-mode allow.
pub const REASON_OPEN: &str = "rule has open enforcement policy";
/// Decision reason when the hostname matched the role's list.
pub const REASON_HOST_MATCH: &str = "host matched allowed domain in rule";
/// Decision reason for a report-mode miss that proceeds anyway.
pub const REASON_WOULD_DENY: &str = "would_deny";
/// Decision reason for an enforce-mode miss.
pub const REASON_ACL_DENY: &str = "host did not match any allowed domain";
/// Decision reason when the role has no policy entry.
pub const REASON_UNKNOWN_ROLE: &str = "unknown role";
/// Decision reason for the synthesized policy of a missing role.
pub const REASON_MISSING_ROLE_ALLOWED: &str = "role not configured, missing roles allowed";

/// Enforcement disposition of a policy entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// All destinations allowed; decisions are logged but never deny.
    Open,
    /// Violations are logged as would-deny but proceed.
    Report,
    /// Violations are denied.
    Enforce,
}

impl EnforcementMode {
    /// Stable lowercase name used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EnforcementMode::Open => "open",
            EnforcementMode::Report => "report",
            EnforcementMode::Enforce => "enforce",
        }
    }
}

/// A role's policy entry as it appears in the ACL document.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyEntry {
    /// Enforcement mode for this role.
    pub mode: EnforcementMode,
    /// Permitted destination hostname globs.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Owning project, echoed into the canonical decision record.
    #[serde(default)]
    pub project: Option<String>,
    /// Free-form operator note for this entry.
    #[serde(default)]
    pub reason: Option<String>,
    /// Whether this role may reach destinations that classify private.
    #[serde(default)]
    pub allow_private: bool,
}

/// Top-level structure of the ACL policy document.
#[derive(Debug, Deserialize)]
struct PolicyDocument {
    #[serde(default)]
    roles: HashMap<String, PolicyEntry>,
}

/// Result of evaluating a role against a destination hostname.
#[derive(Debug, Clone)]
pub struct AclDecision {
    /// Whether the request may proceed.
    pub allow: bool,
    /// The enforcement mode the decision was made under.
    pub mode: EnforcementMode,
    /// The glob that matched, when one did.
    pub matched_rule: Option<String>,
    /// Stable reason string for the canonical decision record.
    pub reason: String,
    /// Project metadata from the role's policy entry.
    pub project: Option<String>,
    /// Whether the role's policy permits private destinations.
    pub allow_private: bool,
}

/// Errors loading the ACL policy document.
#[derive(Debug, Error)]
pub enum AclError {
    /// Reading the policy file failed.
    #[error("failed to read ACL file {path}: {source}")]
    Read {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The policy document is not valid TOML.
    #[error("failed to parse ACL file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
}

/// Per-role policy with globs pre-split for evaluation.
#[derive(Debug, Clone)]
struct CompiledPolicy {
    mode: EnforcementMode,
    exact: HashSet<String>,
    wildcards: Vec<String>,
    project: Option<String>,
    allow_private: bool,
}

/// The ACL evaluation engine.
///
/// Immutable after construction; evaluation is pure and in-memory.
#[derive(Debug, Clone)]
pub struct AclEngine {
    roles: HashMap<String, CompiledPolicy>,
    allow_missing_role: bool,
}

impl AclEngine {
    /// Build an engine from already-parsed policy entries.
    #[must_use]
    pub fn from_policies(
        entries: HashMap<String, PolicyEntry>,
        allow_missing_role: bool,
    ) -> Self {
        let roles = entries
            .into_iter()
            .map(|(role, entry)| {
                let (exact, wildcards) = split_patterns(&entry.allowed_hosts);
                (
                    role,
                    CompiledPolicy {
                        mode: entry.mode,
                        exact,
                        wildcards,
                        project: entry.project,
                        allow_private: entry.allow_private,
                    },
                )
            })
            .collect();
        Self {
            roles,
            allow_missing_role,
        }
    }

    /// Load the ACL policy document from a TOML file.
    pub fn from_file(path: &Path, allow_missing_role: bool) -> Result<Self, AclError> {
        let text = std::fs::read_to_string(path).map_err(|e| AclError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let doc: PolicyDocument = toml::from_str(&text).map_err(|e| AclError::Parse {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(Self::from_policies(doc.roles, allow_missing_role))
    }

    /// An engine with no roles configured.
    #[must_use]
    pub fn empty(allow_missing_role: bool) -> Self {
        Self {
            roles: HashMap::new(),
            allow_missing_role,
        }
    }

    /// Number of configured roles.
    #[must_use]
    pub fn role_count(&self) -> usize {
        self.roles.len()
    }

    /// Evaluate a role against a destination hostname.
    ///
    /// The engine never consults DNS or address classification; it answers
    /// purely from the policy table.
    #[must_use]
    pub fn decide(&self, role: &str, host: &str) -> AclDecision {
        let Some(policy) = self.roles.get(role) else {
            if self.allow_missing_role {
                // Missing roles get a synthesized open policy.
                return AclDecision {
                    allow: true,
                    mode: EnforcementMode::Open,
                    matched_rule: None,
                    reason: REASON_MISSING_ROLE_ALLOWED.to_string(),
                    project: None,
                    allow_private: false,
                };
            }
            return AclDecision {
                allow: false,
                mode: EnforcementMode::Enforce,
                matched_rule: None,
                reason: REASON_UNKNOWN_ROLE.to_string(),
                project: None,
                allow_private: false,
            };
        };

        if policy.mode == EnforcementMode::Open {
            return AclDecision {
                allow: true,
                mode: policy.mode,
                matched_rule: None,
                reason: REASON_OPEN.to_string(),
                project: policy.project.clone(),
                allow_private: policy.allow_private,
            };
        }

        let host_lower = host.to_lowercase();
        if let Some(rule) = policy.matched_rule(&host_lower) {
            return AclDecision {
                allow: true,
                mode: policy.mode,
                matched_rule: Some(rule),
                reason: REASON_HOST_MATCH.to_string(),
                project: policy.project.clone(),
                allow_private: policy.allow_private,
            };
        }

        match policy.mode {
            EnforcementMode::Report => AclDecision {
                allow: true,
                mode: policy.mode,
                matched_rule: None,
                reason: REASON_WOULD_DENY.to_string(),
                project: policy.project.clone(),
                allow_private: policy.allow_private,
            },
            _ => AclDecision {
                allow: false,
                mode: policy.mode,
                matched_rule: None,
                reason: REASON_ACL_DENY.to_string(),
                project: policy.project.clone(),
                allow_private: policy.allow_private,
            },
        }
    }
}

impl CompiledPolicy {
    fn matched_rule(&self, host_lower: &str) -> Option<String> {
        if self.exact.contains(host_lower) {
            return Some(host_lower.to_string());
        }
        self.wildcards
            .iter()
            .find(|p| matches_wildcard(p, host_lower))
            .cloned()
    }
}

/// Split patterns into exact matches and wildcards, lowercased.
fn split_patterns(patterns: &[String]) -> (HashSet<String>, Vec<String>) {
    let mut exact = HashSet::new();
    let mut wildcards = Vec::new();
    for pattern in patterns {
        let lower = pattern.to_lowercase();
        if lower.starts_with("*.") {
            wildcards.push(lower);
        } else {
            exact.insert(lower);
        }
    }
    (exact, wildcards)
}

/// Check if a hostname matches a `*.suffix` wildcard pattern.
///
/// The bare domain never matches its own wildcard, and a domain that merely
/// ends with the suffix text (`fakeexample.com` vs `*.example.com`) does not
/// match either.
fn matches_wildcard(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if host.ends_with(suffix) {
            let prefix_len = host.len() - suffix.len();
            prefix_len > 0 && host.as_bytes().get(prefix_len - 1) == Some(&b'.')
        } else {
            false
        }
    } else {
        pattern == host
    }
}
