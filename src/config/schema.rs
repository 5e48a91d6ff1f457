//! Configuration schema definitions.

use super::error::ConfigError;
use ipnet::IpNet;
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

fn default_listen_ip() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    4750
}

const fn default_connect_timeout_ms() -> u64 {
    10_000
}

const fn default_exit_timeout_ms() -> u64 {
    60_000
}

const fn default_idle_threshold_ms() -> u64 {
    10_000
}

fn default_role_header() -> String {
    "X-Smokescreen-Role".to_string()
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the listener binds.
    #[serde(default = "default_listen_ip")]
    pub listen_ip: String,

    /// Port the listener binds.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bound on DNS resolution plus upstream dial, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Bound on the shutdown drain phase, in milliseconds.
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,

    /// Inactivity after which a tracked connection counts as idle, in
    /// milliseconds.
    #[serde(default = "default_idle_threshold_ms")]
    pub idle_threshold_ms: u64,

    /// CIDR ranges that are always denied.
    #[serde(default)]
    pub deny_ranges: Vec<String>,

    /// CIDR ranges exempted from the built-in private classification.
    #[serde(default)]
    pub allow_ranges: Vec<String>,

    /// Specific `ip:port` pairs that are always denied.
    #[serde(default)]
    pub deny_addresses: Vec<String>,

    /// Path to the ACL policy document.
    #[serde(default)]
    pub acl_file: Option<PathBuf>,

    /// Extra phrase appended to every denial body.
    #[serde(default)]
    pub deny_message_extra: Option<String>,

    /// Synthesize an open policy for roles missing from the ACL document.
    #[serde(default)]
    pub allow_missing_role: bool,

    /// Upstream proxy URL to chain all egress through.
    #[serde(default)]
    pub upstream_proxy: Option<String>,

    /// Header carrying the role when the listener is not TLS.
    #[serde(default = "default_role_header")]
    pub role_header: String,

    /// Inbound TLS settings; absent means a plaintext listener.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
            exit_timeout_ms: default_exit_timeout_ms(),
            idle_threshold_ms: default_idle_threshold_ms(),
            deny_ranges: Vec::new(),
            allow_ranges: Vec::new(),
            deny_addresses: Vec::new(),
            acl_file: None,
            deny_message_extra: None,
            allow_missing_role: false,
            upstream_proxy: None,
            role_header: default_role_header(),
            tls: None,
        }
    }
}

/// Inbound TLS settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// Server certificate chain PEM; may be a cert+key bundle.
    pub cert_file: PathBuf,

    /// Server private key PEM; defaults to `cert_file` (bundle).
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// CA roots that client certificates must chain to. Non-empty enables
    /// required client authentication.
    #[serde(default)]
    pub client_ca_files: Vec<PathBuf>,

    /// Certificate revocation lists applied to client certificates.
    #[serde(default)]
    pub crl_files: Vec<PathBuf>,
}

impl Config {
    /// Bound on DNS resolution plus upstream dial.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Bound on the shutdown drain phase.
    #[must_use]
    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }

    /// Idle threshold for tracked connections.
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.idle_threshold_ms)
    }

    /// Parsed listener socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .listen_ip
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddr(self.listen_ip.clone()))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Parsed deny ranges.
    pub fn parsed_deny_ranges(&self) -> Result<Vec<IpNet>, ConfigError> {
        parse_ranges(&self.deny_ranges)
    }

    /// Parsed allow ranges.
    pub fn parsed_allow_ranges(&self) -> Result<Vec<IpNet>, ConfigError> {
        parse_ranges(&self.allow_ranges)
    }

    /// Parsed specific deny addresses.
    pub fn parsed_deny_addresses(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.deny_addresses
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|_| ConfigError::InvalidAddress(s.clone()))
            })
            .collect()
    }
}

fn parse_ranges(ranges: &[String]) -> Result<Vec<IpNet>, ConfigError> {
    ranges
        .iter()
        .map(|s| s.parse().map_err(|_| ConfigError::InvalidCidr(s.clone())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.port, 4750);
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.exit_timeout(), Duration::from_secs(60));
        assert_eq!(config.role_header, "X-Smokescreen-Role");
        assert!(!config.allow_missing_role);
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_deserialize_full_document() {
        let toml_str = r#"
            listen_ip = "127.0.0.1"
            port = 4751
            connect_timeout_ms = 5000
            deny_ranges = ["1.1.1.1/32"]
            allow_ranges = ["10.0.1.0/24"]
            deny_addresses = ["1.0.0.1:123"]
            acl_file = "/etc/egress-warden/acl.toml"
            deny_message_extra = "see go/egress"
            allow_missing_role = true

            [tls]
            cert_file = "/etc/egress-warden/server-bundle.pem"
            client_ca_files = ["/etc/egress-warden/client-ca.pem"]
            crl_files = ["/etc/egress-warden/crl.pem"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 4751);
        assert_eq!(config.parsed_deny_ranges().unwrap().len(), 1);
        assert_eq!(config.parsed_allow_ranges().unwrap().len(), 1);
        assert_eq!(
            config.parsed_deny_addresses().unwrap()[0],
            "1.0.0.1:123".parse().unwrap()
        );
        assert!(config.allow_missing_role);
        let tls = config.tls.unwrap();
        assert!(tls.key_file.is_none());
        assert_eq!(tls.client_ca_files.len(), 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<Config, _> = toml::from_str("not_a_real_field = 1");
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_cidr_surfaces() {
        let config = Config {
            deny_ranges: vec!["not-a-cidr".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.parsed_deny_ranges(),
            Err(ConfigError::InvalidCidr(_))
        ));
    }

    #[test]
    fn test_invalid_deny_address_surfaces() {
        let config = Config {
            deny_addresses: vec!["1.0.0.1".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.parsed_deny_addresses(),
            Err(ConfigError::InvalidAddress(_))
        ));
    }
}
