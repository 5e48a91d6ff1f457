//! Configuration loading with CLI overrides.

use super::error::ConfigError;
use super::schema::{Config, TlsConfig};
use crate::cli::Cli;
use std::fs;
use tracing::debug;

/// Loads the configuration file and applies CLI flags on top.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Create a loader.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Resolve the effective configuration for this invocation.
    ///
    /// A missing `--config` flag means defaults plus CLI flags; a named but
    /// unreadable or invalid file is an error (fail fast with the path in
    /// the message).
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => {
                let text = fs::read_to_string(path).map_err(|e| ConfigError::Read {
                    path: path.display().to_string(),
                    source: e,
                })?;
                let config = toml::from_str(&text).map_err(|e| ConfigError::Parse {
                    path: path.display().to_string(),
                    source: e,
                })?;
                debug!("loaded configuration from {:?}", path);
                config
            }
            None => Config::default(),
        };

        apply_cli(&mut config, cli);

        // Validate eagerly so a bad range is a startup error, not a
        // first-request surprise.
        config.listen_addr()?;
        config.parsed_deny_ranges()?;
        config.parsed_allow_ranges()?;
        config.parsed_deny_addresses()?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// CLI flags take precedence: scalars override, list flags append.
fn apply_cli(config: &mut Config, cli: &Cli) {
    if let Some(ip) = &cli.listen_ip {
        config.listen_ip = ip.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(ms) = cli.connect_timeout_ms {
        config.connect_timeout_ms = ms;
    }
    if let Some(ms) = cli.exit_timeout_ms {
        config.exit_timeout_ms = ms;
    }
    if let Some(ms) = cli.idle_threshold_ms {
        config.idle_threshold_ms = ms;
    }
    config.deny_ranges.extend(cli.deny_ranges.iter().cloned());
    config.allow_ranges.extend(cli.allow_ranges.iter().cloned());
    config
        .deny_addresses
        .extend(cli.deny_addresses.iter().cloned());
    if let Some(path) = &cli.egress_acl_file {
        config.acl_file = Some(path.clone());
    }
    if let Some(extra) = &cli.additional_error_message_on_deny {
        config.deny_message_extra = Some(extra.clone());
    }
    if cli.allow_missing_role {
        config.allow_missing_role = true;
    }
    if let Some(proxy) = &cli.upstream_proxy {
        config.upstream_proxy = Some(proxy.clone());
    }

    if let Some(bundle) = &cli.tls_server_bundle_file {
        let tls = config.tls.get_or_insert_with(|| TlsConfig {
            cert_file: bundle.clone(),
            key_file: None,
            client_ca_files: Vec::new(),
            crl_files: Vec::new(),
        });
        tls.cert_file = bundle.clone();
    }
    if let Some(tls) = config.tls.as_mut() {
        tls.client_ca_files
            .extend(cli.tls_client_ca_files.iter().cloned());
        tls.crl_files.extend(cli.tls_crl_files.iter().cloned());
    }
}
