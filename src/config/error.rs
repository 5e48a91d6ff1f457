//! Error types for configuration loading.

use thiserror::Error;

/// Errors resolving the server configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A configured CIDR range does not parse.
    #[error("invalid CIDR range '{0}'")]
    InvalidCidr(String),

    /// A configured `ip:port` deny address does not parse.
    #[error("invalid deny address '{0}' (expected ip:port)")]
    InvalidAddress(String),

    /// The listen address does not parse.
    #[error("invalid listen address '{0}'")]
    InvalidListenAddr(String),
}
