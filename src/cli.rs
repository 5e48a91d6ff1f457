//! Command-line interface definitions.
//!
//! Uses clap's derive API for type-safe argument parsing. Every flag has a
//! config-file counterpart; flags win (see [`crate::config::ConfigLoader`]).

use clap::Parser;
use std::path::PathBuf;

/// Egress HTTP forward proxy enforcing per-role destination policy.
///
/// Clients route outbound requests through the proxy, which identifies the
/// calling role, evaluates the role's egress ACL against the destination,
/// and either proxies the traffic (plain HTTP or CONNECT tunneling) or
/// refuses it with a structured denial.
#[derive(Parser, Debug)]
#[command(name = "egress-warden")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// IP address to listen on.
    #[arg(long = "listen-ip", value_name = "IP")]
    pub listen_ip: Option<String>,

    /// Port to listen on.
    #[arg(long = "port", value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to the server configuration file (TOML).
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Path to the egress ACL policy document (TOML).
    #[arg(long = "egress-acl-file", value_name = "PATH")]
    pub egress_acl_file: Option<PathBuf>,

    /// Deny a CIDR range (repeatable).
    #[arg(long = "deny-range", value_name = "CIDR")]
    pub deny_ranges: Vec<String>,

    /// Exempt a CIDR range from the private classification (repeatable).
    #[arg(long = "allow-range", value_name = "CIDR")]
    pub allow_ranges: Vec<String>,

    /// Deny a specific ip:port pair (repeatable).
    #[arg(long = "deny-address", value_name = "IP:PORT")]
    pub deny_addresses: Vec<String>,

    /// Extra context appended to every denial response body.
    #[arg(
        long = "additional-error-message-on-deny",
        value_name = "MESSAGE"
    )]
    pub additional_error_message_on_deny: Option<String>,

    /// Treat requests from roles missing in the ACL document as open.
    #[arg(long = "allow-missing-role")]
    pub allow_missing_role: bool,

    /// Chain all egress through this upstream proxy URL.
    #[arg(long = "upstream-proxy", value_name = "URL")]
    pub upstream_proxy: Option<String>,

    /// Bound on DNS resolution plus upstream dial, in milliseconds.
    #[arg(long = "connect-timeout-ms", value_name = "MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Bound on the shutdown drain phase, in milliseconds.
    #[arg(long = "exit-timeout-ms", value_name = "MS")]
    pub exit_timeout_ms: Option<u64>,

    /// Inactivity after which a connection counts as idle, in milliseconds.
    #[arg(long = "idle-threshold-ms", value_name = "MS")]
    pub idle_threshold_ms: Option<u64>,

    /// Server certificate bundle PEM (cert chain plus key). Enables TLS.
    #[arg(long = "tls-server-bundle-file", value_name = "PATH")]
    pub tls_server_bundle_file: Option<PathBuf>,

    /// CA file client certificates must chain to (repeatable).
    #[arg(long = "tls-client-ca-file", value_name = "PATH")]
    pub tls_client_ca_files: Vec<PathBuf>,

    /// CRL file applied to client certificates (repeatable).
    #[arg(long = "tls-crl-file", value_name = "PATH")]
    pub tls_crl_files: Vec<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}
