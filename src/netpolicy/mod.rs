//! Destination address policy: classification and safe resolution.
//!
//! This module decides whether a network *address* is reachable at all,
//! independently of any role's hostname ACL. The two concerns compose in the
//! proxy layer: the ACL answers "may this role talk to this hostname", the
//! netpolicy answers "is the address this hostname resolves to acceptable".
//!
//! - [`AddressClassifier`] maps an IP address onto a closed classification
//!   set: public, private, exempted-by-operator, or denied.
//! - [`SafeResolver`] performs DNS resolution that refuses to ever return a
//!   denied address, closing the DNS-rebinding hole where an attacker mixes
//!   safe and unsafe records under one name.

pub mod classify;
pub mod resolver;

pub use classify::{AddressClass, AddressClassifier};
pub use resolver::{ResolveError, SafeResolver};
