//! Configuration: TOML schema, file loading, CLI overrides.
//!
//! Configuration is resolved in order:
//!
//! 1. Compiled-in defaults
//! 2. The TOML file named by `--config`, when given
//! 3. CLI flags (highest priority; list flags append, scalars override)
//!
//! The ACL policy document is a separate file referenced by `acl_file` /
//! `--egress-acl-file` and loaded by [`crate::acl::AclEngine::from_file`].

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::{Config, TlsConfig};
