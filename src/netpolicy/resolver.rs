//! Deny-aware DNS resolution.
//!
//! The resolver turns a `(host, port)` destination into a single dialable
//! socket address. Literal IP inputs skip the lookup entirely. For DNS names
//! the *whole* record set is scanned for denied addresses before any
//! candidate is chosen: a name that mixes a safe and a denied record fails
//! outright, so an attacker cannot smuggle a denied address past the policy
//! by padding the answer with acceptable siblings.
//!
//! Lookup failures and timeouts surface as [`ResolveError::Resolution`] and
//! never as an allow.

use super::classify::{AddressClass, AddressClassifier};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors produced while resolving a destination.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The destination resolves to an address the policy refuses to dial.
    #[error("destination address {address} denied: {reason}")]
    Denied {
        /// The `ip:port` that triggered the denial.
        address: String,
        /// Why the address was refused.
        reason: String,
    },

    /// DNS lookup failed, timed out, or returned no usable records.
    #[error("failed to resolve {host}: {message}")]
    Resolution {
        /// The hostname that failed to resolve.
        host: String,
        /// Description of the failure.
        message: String,
    },
}

/// Resolver that refuses to return denied addresses.
#[derive(Debug, Clone)]
pub struct SafeResolver {
    classifier: AddressClassifier,
    timeout: Duration,
}

impl SafeResolver {
    /// Create a resolver over the given classifier.
    ///
    /// `timeout` bounds the DNS lookup; an expired timeout maps to
    /// [`ResolveError::Resolution`].
    #[must_use]
    pub fn new(classifier: AddressClassifier, timeout: Duration) -> Self {
        Self { classifier, timeout }
    }

    /// Access the underlying classifier.
    #[must_use]
    pub fn classifier(&self) -> &AddressClassifier {
        &self.classifier
    }

    /// Resolve `host:port` to one safe address.
    ///
    /// `allow_private` permits `Private` candidates when the role's policy
    /// explicitly allows private destinations; denied addresses are refused
    /// regardless.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        allow_private: bool,
    ) -> Result<SocketAddr, ResolveError> {
        // Literal IPs (including bracketed IPv6) need no lookup.
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            let addr = SocketAddr::new(ip, port);
            self.vet(&addr, allow_private)?;
            return Ok(addr);
        }

        let addrs = self.lookup(host, port).await?;
        if addrs.is_empty() {
            return Err(ResolveError::Resolution {
                host: host.to_string(),
                message: "lookup returned no addresses".to_string(),
            });
        }

        // First pass: any denied record poisons the whole resolution.
        for addr in &addrs {
            if self.classifier.classify(addr.ip()) == AddressClass::Denied {
                return Err(denied(addr, "address is in a denied range"));
            }
            if self.classifier.is_denied_addr(addr) {
                return Err(denied(addr, "address is specifically denied"));
            }
        }

        // Second pass: pick the first dialable candidate.
        if let Some(addr) = addrs
            .iter()
            .find(|a| self.classifier.classify(a.ip()).is_dialable())
        {
            debug!(host, %addr, "resolved destination");
            return Ok(*addr);
        }

        // Only private records remain.
        if allow_private {
            debug!(host, addr = %addrs[0], "resolved to private destination permitted by policy");
            return Ok(addrs[0]);
        }
        Err(denied(&addrs[0], "destination address is private"))
    }

    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, ResolveError> {
        let lookup = tokio::net::lookup_host((host, port));
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(addrs)) => Ok(addrs.collect()),
            Ok(Err(e)) => Err(ResolveError::Resolution {
                host: host.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(ResolveError::Resolution {
                host: host.to_string(),
                message: format!("lookup timed out after {:?}", self.timeout),
            }),
        }
    }

    fn vet(&self, addr: &SocketAddr, allow_private: bool) -> Result<(), ResolveError> {
        match self.classifier.classify(addr.ip()) {
            AddressClass::Denied => Err(denied(addr, "address is in a denied range")),
            _ if self.classifier.is_denied_addr(addr) => {
                Err(denied(addr, "address is specifically denied"))
            }
            AddressClass::Private if !allow_private => {
                Err(denied(addr, "destination address is private"))
            }
            _ => Ok(()),
        }
    }
}

fn denied(addr: &SocketAddr, reason: &str) -> ResolveError {
    ResolveError::Denied {
        address: addr.to_string(),
        reason: reason.to_string(),
    }
}
