//! IP address classification against operator and built-in ranges.
//!
//! Classification is a total, deterministic function evaluated in fixed
//! order:
//!
//! 1. Operator deny-ranges always win.
//! 2. The built-in private set classifies `Private`, unless the address sits
//!    in an operator allow-range *and* belongs to an exemptable range
//!    (RFC1918 / ULA). Loopback, link-local, multicast and broadcast space
//!    can never be exempted.
//! 3. An allow-range outside the private set is an operator override and
//!    classifies `AllowedExempt`.
//! 4. Everything else is `Public`.
//!
//! Specific `ip:port` denials are a separate, port-aware check consulted by
//! the resolver before it hands out an address.

use ipnet::IpNet;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

/// Classification of a destination IP address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    /// Globally routable address with no special handling.
    Public,
    /// Built-in private space: RFC1918, loopback, link-local, multicast,
    /// broadcast, ULA, and the cloud metadata endpoint.
    Private,
    /// Address inside an operator allow-range.
    AllowedExempt,
    /// Address inside an operator deny-range.
    Denied,
}

impl AddressClass {
    /// Whether an address of this class may be dialed without a private
    /// exemption from the role's policy.
    #[must_use]
    pub fn is_dialable(self) -> bool {
        matches!(self, AddressClass::Public | AddressClass::AllowedExempt)
    }
}

/// Private ranges an allow-range may promote to [`AddressClass::AllowedExempt`].
fn exemptable_private_networks() -> Vec<IpNet> {
    parse_builtin(&["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16", "fc00::/7"])
}

/// Private ranges that are never exemptable: loopback, link-local, multicast,
/// broadcast, unspecified. An allow-range overlapping these has no effect.
fn pinned_private_networks() -> Vec<IpNet> {
    parse_builtin(&[
        "127.0.0.0/8",
        "169.254.0.0/16",
        "224.0.0.0/4",
        "255.255.255.255/32",
        "0.0.0.0/32",
        "::1/128",
        "::/128",
        "fe80::/10",
        "ff00::/8",
    ])
}

fn parse_builtin(ranges: &[&str]) -> Vec<IpNet> {
    // All entries are compile-time constants; a parse failure here is a bug.
    ranges
        .iter()
        .map(|s| s.parse::<IpNet>().expect("builtin CIDR is valid"))
        .collect()
}

/// Classifier for destination IP addresses.
///
/// Holds the operator-configured deny and allow ranges together with the
/// built-in private set. Immutable after construction; `classify` is pure.
#[derive(Debug, Clone)]
pub struct AddressClassifier {
    deny_ranges: Vec<IpNet>,
    allow_ranges: Vec<IpNet>,
    deny_addrs: HashSet<SocketAddr>,
    exemptable_private: Vec<IpNet>,
    pinned_private: Vec<IpNet>,
}

impl AddressClassifier {
    /// Create a classifier from operator-configured ranges.
    ///
    /// * `deny_ranges` - CIDRs that classify `Denied` unconditionally.
    /// * `allow_ranges` - CIDRs that exempt RFC1918/ULA space (or mark public
    ///   space as explicitly allowed).
    /// * `deny_addrs` - exact `ip:port` pairs refused at resolution time.
    #[must_use]
    pub fn new(
        deny_ranges: Vec<IpNet>,
        allow_ranges: Vec<IpNet>,
        deny_addrs: Vec<SocketAddr>,
    ) -> Self {
        Self {
            deny_ranges,
            allow_ranges,
            deny_addrs: deny_addrs.into_iter().collect(),
            exemptable_private: exemptable_private_networks(),
            pinned_private: pinned_private_networks(),
        }
    }

    /// Create a classifier with no operator ranges (built-in set only).
    #[must_use]
    pub fn builtin_only() -> Self {
        Self::new(Vec::new(), Vec::new(), Vec::new())
    }

    /// Classify a single IP address. Deterministic and total.
    #[must_use]
    pub fn classify(&self, ip: IpAddr) -> AddressClass {
        if contains(&self.deny_ranges, &ip) {
            return AddressClass::Denied;
        }
        if contains(&self.pinned_private, &ip) {
            return AddressClass::Private;
        }
        if contains(&self.exemptable_private, &ip) {
            if contains(&self.allow_ranges, &ip) {
                return AddressClass::AllowedExempt;
            }
            return AddressClass::Private;
        }
        if contains(&self.allow_ranges, &ip) {
            return AddressClass::AllowedExempt;
        }
        AddressClass::Public
    }

    /// Port-aware check for the specific `ip:port` deny list.
    #[must_use]
    pub fn is_denied_addr(&self, addr: &SocketAddr) -> bool {
        self.deny_addrs.contains(addr)
    }
}

fn contains(nets: &[IpNet], ip: &IpAddr) -> bool {
    nets.iter().any(|net| net.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exemptions() -> Vec<IpNet> {
        [
            "8.8.9.0/24",
            "10.0.1.0/24",
            "172.16.1.0/24",
            "192.168.1.0/24",
            "127.0.1.0/24",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect()
    }

    fn classifier() -> AddressClassifier {
        AddressClassifier::new(Vec::new(), exemptions(), Vec::new())
    }

    fn classify(c: &AddressClassifier, ip: &str) -> AddressClass {
        c.classify(ip.parse().unwrap())
    }

    #[test]
    fn test_public_addresses() {
        let c = classifier();
        assert_eq!(classify(&c, "8.8.8.8"), AddressClass::Public);
        assert_eq!(classify(&c, "1.2.3.4"), AddressClass::Public);
    }

    #[test]
    fn test_allow_range_on_public_address() {
        let c = classifier();
        // 8.8.9.0/24 is configured as an allow-range on public space.
        assert_eq!(classify(&c, "8.8.9.8"), AddressClass::AllowedExempt);
    }

    #[test]
    fn test_private_networks_with_exemptions() {
        let c = classifier();
        assert_eq!(classify(&c, "10.0.0.1"), AddressClass::Private);
        assert_eq!(classify(&c, "10.0.1.1"), AddressClass::AllowedExempt);
        assert_eq!(classify(&c, "172.16.0.1"), AddressClass::Private);
        assert_eq!(classify(&c, "172.16.1.1"), AddressClass::AllowedExempt);
        assert_eq!(classify(&c, "192.168.0.1"), AddressClass::Private);
        assert_eq!(classify(&c, "192.168.1.1"), AddressClass::AllowedExempt);
    }

    #[test]
    fn test_loopback_is_never_exempted() {
        let c = classifier();
        assert_eq!(classify(&c, "127.0.0.1"), AddressClass::Private);
        assert_eq!(classify(&c, "127.255.255.255"), AddressClass::Private);
        assert_eq!(classify(&c, "::1"), AddressClass::Private);
        // 127.0.1.0/24 is in the allow-ranges but loopback stays private.
        assert_eq!(classify(&c, "127.0.1.1"), AddressClass::Private);
    }

    #[test]
    fn test_metadata_endpoint() {
        let c = classifier();
        assert_eq!(classify(&c, "169.254.169.254"), AddressClass::Private);
    }

    #[test]
    fn test_broadcast_and_multicast() {
        let c = classifier();
        assert_eq!(classify(&c, "255.255.255.255"), AddressClass::Private);
        assert_eq!(classify(&c, "ff02::2"), AddressClass::Private);
        assert_eq!(classify(&c, "224.0.0.251"), AddressClass::Private);
    }

    #[test]
    fn test_deny_range_wins_over_allow_range() {
        let c = AddressClassifier::new(
            vec!["10.0.1.0/24".parse().unwrap()],
            vec!["10.0.1.0/24".parse().unwrap()],
            Vec::new(),
        );
        assert_eq!(c.classify("10.0.1.1".parse().unwrap()), AddressClass::Denied);
    }

    #[test]
    fn test_deny_range_on_public_address() {
        let c = AddressClassifier::new(
            vec!["1.1.1.1/32".parse().unwrap()],
            Vec::new(),
            Vec::new(),
        );
        assert_eq!(c.classify("1.1.1.1".parse().unwrap()), AddressClass::Denied);
        assert_eq!(c.classify("1.1.1.2".parse().unwrap()), AddressClass::Public);
    }

    #[test]
    fn test_classification_is_stable() {
        let c = classifier();
        let ip: IpAddr = "10.0.1.1".parse().unwrap();
        let first = c.classify(ip);
        assert_eq!(first, AddressClass::AllowedExempt);
        assert_eq!(c.classify(ip), first);
    }

    #[test]
    fn test_specific_address_denials_are_port_aware() {
        let c = AddressClassifier::new(
            Vec::new(),
            Vec::new(),
            vec!["1.0.0.1:123".parse().unwrap()],
        );
        assert!(c.is_denied_addr(&"1.0.0.1:123".parse().unwrap()));
        assert!(!c.is_denied_addr(&"1.0.0.1:124".parse().unwrap()));
        // The bare classification is unaffected.
        assert_eq!(c.classify("1.0.0.1".parse().unwrap()), AddressClass::Public);
    }

    #[test]
    fn test_ipv6_link_local() {
        let c = classifier();
        assert_eq!(classify(&c, "fe80::1"), AddressClass::Private);
    }

    #[test]
    fn test_ipv6_unique_local_exemptable() {
        let c = AddressClassifier::new(
            Vec::new(),
            vec!["fd00::/8".parse().unwrap()],
            Vec::new(),
        );
        assert_eq!(c.classify("fd00::1".parse().unwrap()), AddressClass::AllowedExempt);
        assert_eq!(c.classify("fc00::1".parse().unwrap()), AddressClass::Private);
    }
}
