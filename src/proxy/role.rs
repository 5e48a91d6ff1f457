//! Role identification for inbound requests.
//!
//! Every request is attributed to exactly one role before any proxying
//! happens. Two strategies exist, chosen by how the listener is deployed:
//!
//! - **Header**: a named request header carries the role. Exactly one value
//!   is required; zero or multiple values are a missing-role error so a
//!   client cannot smuggle a second identity past an intermediary.
//! - **TLS common name**: the CN of the first peer certificate, extracted
//!   once per connection at TLS accept and threaded into each request.

use hyper::Request;
use thiserror::Error;

/// Error returned when no role could be attributed to a request.
#[derive(Debug, Error)]
pub enum RoleError {
    /// No usable role identity on the request.
    #[error("unable to identify client role: {0}")]
    Missing(String),
}

/// Strategy for mapping an inbound request to a role.
#[derive(Debug, Clone)]
pub enum RoleExtractor {
    /// Read the role from a named request header.
    Header {
        /// Name of the header carrying the role.
        header: String,
    },
    /// Read the role from the TLS peer certificate's Common Name.
    TlsCommonName,
}

impl RoleExtractor {
    /// Header-based extraction with the given header name.
    pub fn header(name: impl Into<String>) -> Self {
        RoleExtractor::Header {
            header: name.into(),
        }
    }

    /// Extract the role for one request.
    ///
    /// `tls_common_name` is the CN pulled from the peer certificate at
    /// connection accept, if the listener terminates TLS.
    pub fn extract<B>(
        &self,
        req: &Request<B>,
        tls_common_name: Option<&str>,
    ) -> Result<String, RoleError> {
        match self {
            RoleExtractor::Header { header } => {
                let mut values = req.headers().get_all(header.as_str()).iter();
                match (values.next(), values.next()) {
                    (Some(value), None) => value
                        .to_str()
                        .map(str::to_string)
                        .map_err(|_| RoleError::Missing(format!("{header} header is not valid UTF-8"))),
                    (None, _) => Err(RoleError::Missing(format!(
                        "expected exactly one {header} header, got 0"
                    ))),
                    (Some(_), Some(_)) => Err(RoleError::Missing(format!(
                        "expected exactly one {header} header, got multiple"
                    ))),
                }
            }
            RoleExtractor::TlsCommonName => tls_common_name
                .map(str::to_string)
                .ok_or_else(|| {
                    RoleError::Missing("client did not provide a certificate".to_string())
                }),
        }
    }
}
