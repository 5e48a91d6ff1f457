//! egress-warden: egress HTTP forward proxy with per-role destination policy
//!
//! This crate implements a policy enforcement point for outbound traffic.
//! Trusted internal clients route their requests through the proxy, which
//! identifies the calling role (TLS client certificate CN or request header),
//! classifies the destination address, evaluates the role's egress ACL, and
//! either proxies the traffic or refuses it with a structured denial.
//!
//! # Security Model
//!
//! The security model is **fail-closed**: a destination that resolves to any
//! denied address is refused outright, DNS failures never turn into allows,
//! and private address space is unreachable unless operator policy exempts a
//! specific range.
//!
//! # Architecture
//!
//! - **Netpolicy**: address classification and deny-aware DNS resolution
//! - **Acl**: per-role destination policy under open/report/enforce modes
//! - **Conntrack**: registry of in-flight proxied connections for idle drain
//! - **Proxy**: plain HTTP forwarding and CONNECT tunneling over hyper
//! - **Config**: TOML configuration plus CLI flag overrides
//! - **Telemetry**: structured audit events and the canonical decision record

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod acl;
pub mod cli;
pub mod config;
pub mod conntrack;
pub mod netpolicy;
pub mod proxy;
pub mod telemetry;
