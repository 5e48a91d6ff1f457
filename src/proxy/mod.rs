//! The proxy core: request orchestration for both proxying modes.
//!
//! An inbound request is attributed to a role, its destination parsed, the
//! ACL consulted, the destination resolved through the deny-aware resolver,
//! and the upstream dialed and registered with the connection tracker before
//! the first byte moves. Plain HTTP requests complete a round-trip through
//! [`forward`]; `CONNECT` requests become bidirectional tunnels through
//! [`connect`].
//!
//! Per request the trajectory is
//!
//! ```text
//! RECEIVED -> ROLE_OK -> ACL_OK -> RESOLVED -> DIALED -> ACTIVE -> CLOSED
//! ```
//!
//! with deny/error edges from every pre-DIALED state. Exactly one canonical
//! decision record is emitted per trajectory, whichever edge terminates it.

pub mod connect;
pub mod error;
pub mod forward;
pub mod role;
pub mod server;
pub mod tls;

pub use error::{ProxyError, ProxyResult};
pub use role::{RoleError, RoleExtractor};
pub use server::{ProxyContext, ProxyServer};

use crate::netpolicy::ResolveError;
use crate::telemetry::AuditEvent;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::{Response, StatusCode};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::error;

/// Request header carrying the client role when TLS is not in use.
pub const ROLE_HEADER: &str = "X-Smokescreen-Role";
/// Opaque client trace header, echoed into the canonical decision record.
pub const TRACE_HEADER: &str = "X-Random-Trace";
/// Reserved response header, stripped so an upstream cannot spoof proxy
/// errors to the client.
pub const ERROR_HEADER: &str = "X-Smokescreen-Error";

/// Stable message logged when the dialer is pointed at illegal address
/// space (a misconfigured upstream proxy, typically).
pub const ILLEGAL_DIAL_MESSAGE: &str = "unexpected illegal address in dialer";

/// Response body type used throughout the proxy.
pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// An upstream proxy to chain through instead of dialing destinations
/// directly.
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    /// Proxy hostname as configured.
    pub host: String,
    /// Proxy port.
    pub port: u16,
}

impl UpstreamProxy {
    /// Parse an `http://host:port` URL into an upstream proxy target.
    pub fn parse(url: &str) -> Result<Self, ProxyError> {
        let rest = url
            .strip_prefix("http://")
            .ok_or_else(|| ProxyError::InvalidRequest(format!("unsupported proxy URL: {url}")))?;
        let authority = rest.split('/').next().unwrap_or(rest);
        if authority.is_empty() {
            return Err(ProxyError::InvalidRequest(format!(
                "proxy URL has no host: {url}"
            )));
        }
        let (host, port) = parse_host_port(authority, 80)
            .map_err(|e| ProxyError::InvalidRequest(format!("bad proxy URL {url}: {e}")))?;
        Ok(Self { host, port })
    }
}

/// Parse a `host:port` authority, handling bracketed IPv6 literals.
///
/// A missing port falls back to `default_port`.
pub(crate) fn parse_host_port(authority: &str, default_port: u16) -> Result<(String, u16), String> {
    if let Some(rest) = authority.strip_prefix('[') {
        // [v6]:port or bare [v6]
        let Some((host, after)) = rest.split_once(']') else {
            return Err(format!("unterminated IPv6 literal in {authority}"));
        };
        let port = match after.strip_prefix(':') {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| format!("invalid port in {authority}"))?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        // A second colon means an unbracketed IPv6 literal with no port.
        Some((host, _)) if host.contains(':') => Ok((authority.to_string(), default_port)),
        Some((host, port_str)) => {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| format!("invalid port in {authority}"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

/// Build the denial body: the literal token `denied` plus the operator's
/// extra-context phrase.
pub(crate) fn deny_body(host: &str, reason: &str, extra: Option<&str>) -> String {
    let mut body = format!("egress proxying denied to {host}: {reason}");
    if let Some(extra) = extra {
        body.push(' ');
        body.push_str(extra);
    }
    body.push('\n');
    body
}

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn full_body(content: String) -> ProxyBody {
    Full::new(Bytes::from(content))
        .map_err(|never| match never {})
        .boxed()
}

/// A well-formed plain-text response; denial paths never leave the client
/// with a dangling connection.
pub(crate) fn text_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(full_body(body))
        .expect("static response construction cannot fail")
}

/// Why a dial was refused before any byte reached the destination.
pub(crate) struct DialRefusal {
    /// Stable reason for the canonical decision record.
    pub reason: String,
    /// True when the failure is a resolution/transport failure rather than
    /// a policy denial; CONNECT maps these to 502 instead of 503.
    pub gateway_failure: bool,
}

/// Resolve and dial the destination (or the configured upstream proxy),
/// registering the connection with the tracker.
///
/// An upstream proxy whose address classifies as denied or private is
/// refused with the [`ILLEGAL_DIAL_MESSAGE`] record; chained proxies live in
/// operator-controlled space, never in private or denied ranges.
pub(crate) async fn dial_destination(
    ctx: &ProxyContext,
    role: &str,
    host: &str,
    port: u16,
    allow_private: bool,
) -> Result<crate::conntrack::TrackedConn<TcpStream>, DialRefusal> {
    let (dial_host, dial_port, via_proxy) = match &ctx.upstream_proxy {
        Some(proxy) => (proxy.host.as_str(), proxy.port, true),
        None => (host, port, false),
    };

    let resolved = match ctx
        .resolver
        .resolve(dial_host, dial_port, allow_private && !via_proxy)
        .await
    {
        Ok(addr) => addr,
        Err(ResolveError::Denied { address, reason }) => {
            if via_proxy {
                error!(address = %address, "{}", ILLEGAL_DIAL_MESSAGE);
                ctx.audit.log(AuditEvent::IllegalDial {
                    address: address.clone(),
                });
                return Err(DialRefusal {
                    reason: format!("upstream proxy address denied: {reason}"),
                    gateway_failure: true,
                });
            }
            return Err(DialRefusal {
                reason: format!("destination address {address} denied: {reason}"),
                gateway_failure: false,
            });
        }
        Err(err @ ResolveError::Resolution { .. }) => {
            return Err(DialRefusal {
                reason: err.to_string(),
                gateway_failure: true,
            });
        }
    };

    let dial = TcpStream::connect(resolved);
    let stream = match tokio::time::timeout(ctx.connect_timeout, dial).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(DialRefusal {
                reason: format!("failed to connect to {resolved}: {e}"),
                gateway_failure: true,
            });
        }
        Err(_) => {
            return Err(DialRefusal {
                reason: format!(
                    "connection to {resolved} timed out after {:?}",
                    ctx.connect_timeout
                ),
                gateway_failure: true,
            });
        }
    };

    Ok(ctx
        .tracker
        .wrap(stream, role, &format!("{host}:{port}")))
}

/// Half-close grace: after one tunnel direction ends, the other is drained
/// for at most this long before the tunnel is torn down.
pub(crate) const HALF_CLOSE_GRACE: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_port_with_port() {
        assert_eq!(
            parse_host_port("api.example.com:8443", 443).unwrap(),
            ("api.example.com".to_string(), 8443)
        );
    }

    #[test]
    fn test_parse_host_port_default() {
        assert_eq!(
            parse_host_port("api.example.com", 443).unwrap(),
            ("api.example.com".to_string(), 443)
        );
    }

    #[test]
    fn test_parse_host_port_ipv6() {
        assert_eq!(
            parse_host_port("[::1]:8080", 443).unwrap(),
            ("::1".to_string(), 8080)
        );
        assert_eq!(
            parse_host_port("[2001:db8::1]", 443).unwrap(),
            ("2001:db8::1".to_string(), 443)
        );
    }

    #[test]
    fn test_parse_host_port_bad_port() {
        assert!(parse_host_port("example.com:notaport", 80).is_err());
    }

    #[test]
    fn test_deny_body_contains_token_and_extra() {
        let body = deny_body("evil.com:443", "host did not match", Some("moar ctx"));
        assert!(body.contains("denied"));
        assert!(body.contains("moar ctx"));
        assert!(body.contains("evil.com:443"));
    }

    #[test]
    fn test_deny_body_without_extra() {
        let body = deny_body("evil.com:443", "unknown role", None);
        assert!(body.contains("denied"));
        assert!(!body.ends_with(' '));
    }

    #[test]
    fn test_upstream_proxy_parse() {
        let p = UpstreamProxy::parse("http://127.0.0.2:80").unwrap();
        assert_eq!(p.host, "127.0.0.2");
        assert_eq!(p.port, 80);

        let p = UpstreamProxy::parse("http://proxy.corp").unwrap();
        assert_eq!(p.port, 80);

        assert!(UpstreamProxy::parse("socks5://proxy.corp").is_err());
        assert!(UpstreamProxy::parse("http://").is_err());
    }
}
