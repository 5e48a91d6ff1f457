//! Inbound TLS for the listener.
//!
//! When configured, the listener terminates TLS itself and requires a
//! client certificate signed by one of the operator's CA roots and not
//! present on any configured CRL. The certificate's Common Name becomes the
//! request role (see [`super::role::RoleExtractor::TlsCommonName`]).
//!
//! The server certificate may be a single PEM bundle holding both the chain
//! and the private key; `key_file` defaults to `cert_file` in that case.

use crate::config::TlsConfig;
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::{CertificateDer, CertificateRevocationListDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Errors building the inbound TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        /// Path that could not be read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A PEM file held no usable material.
    #[error("no {expected} found in {path}")]
    Empty {
        /// What the file was expected to contain.
        expected: &'static str,
        /// Path that was searched.
        path: String,
    },

    /// rustls rejected the configuration.
    #[error("TLS configuration rejected: {0}")]
    Config(String),
}

/// Build a TLS acceptor from the configured bundle, client CAs, and CRLs.
pub fn build_acceptor(cfg: &TlsConfig) -> Result<TlsAcceptor, TlsError> {
    let chain = load_certs(&cfg.cert_file)?;
    // A missing key_file means cert_file is a cert+key bundle.
    let key_path = cfg.key_file.as_ref().unwrap_or(&cfg.cert_file);
    let key = load_key(key_path)?;

    let builder = ServerConfig::builder();
    let config = if cfg.client_ca_files.is_empty() {
        builder
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| TlsError::Config(e.to_string()))?
    } else {
        let mut roots = RootCertStore::empty();
        for path in &cfg.client_ca_files {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TlsError::Config(e.to_string()))?;
            }
        }
        let mut verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
        let crls = load_crls(&cfg.crl_files)?;
        if !crls.is_empty() {
            debug!(count = crls.len(), "loaded client certificate CRLs");
            verifier_builder = verifier_builder.with_crls(crls);
        }
        let verifier = verifier_builder
            .build()
            .map_err(|e| TlsError::Config(e.to_string()))?;
        builder
            .with_client_cert_verifier(verifier)
            .with_single_cert(chain, key)
            .map_err(|e| TlsError::Config(e.to_string()))?
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Common Name of the first peer certificate, if parseable.
pub fn client_common_name(certs: &[CertificateDer<'_>]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(certs.first()?.as_ref()).ok()?;
    let name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);
    name
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::Read {
            path: path.display().to_string(),
            source: e,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<_, _>>()
        .map_err(|e| TlsError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
    if certs.is_empty() {
        return Err(TlsError::Empty {
            expected: "certificates",
            path: path.display().to_string(),
        });
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| TlsError::Read {
            path: path.display().to_string(),
            source: e,
        })?
        .ok_or_else(|| TlsError::Empty {
            expected: "private key",
            path: path.display().to_string(),
        })
}

fn load_crls(paths: &[std::path::PathBuf]) -> Result<Vec<CertificateRevocationListDer<'static>>, TlsError> {
    let mut crls = Vec::new();
    for path in paths {
        for crl in rustls_pemfile::crls(&mut open(path)?) {
            crls.push(crl.map_err(|e| TlsError::Read {
                path: path.display().to_string(),
                source: e,
            })?);
        }
    }
    Ok(crls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_cert_file_errors() {
        let cfg = TlsConfig {
            cert_file: "/nonexistent/server.pem".into(),
            key_file: None,
            client_ca_files: Vec::new(),
            crl_files: Vec::new(),
        };
        let err = match build_acceptor(&cfg) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, TlsError::Read { .. }));
    }

    #[test]
    fn test_empty_pem_reports_no_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").unwrap();

        let cfg = TlsConfig {
            cert_file: path,
            key_file: None,
            client_ca_files: Vec::new(),
            crl_files: Vec::new(),
        };
        let err = match build_acceptor(&cfg) {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            TlsError::Empty {
                expected: "certificates",
                ..
            }
        ));
    }

    #[test]
    fn test_common_name_of_garbage_der_is_none() {
        let der = CertificateDer::from(vec![0u8, 1, 2, 3]);
        assert_eq!(client_common_name(&[der]), None);
    }

    #[test]
    fn test_common_name_of_empty_slice_is_none() {
        assert_eq!(client_common_name(&[]), None);
    }
}
