//! Proxy server: listener, per-connection tasks, graceful drain.
//!
//! The server accepts TCP (optionally TLS with required client certs) and
//! serves HTTP/1.1 with upgrade support so `CONNECT` can become a raw
//! tunnel. Each accepted connection runs in its own task to completion.
//!
//! # Shutdown
//!
//! On the shutdown signal the accept loop stops, the shared shutdown flag
//! flips, and the server polls the connection tracker: it sleeps for at most
//! [`crate::conntrack::Tracker::maybe_idle_in`] between checks and gives up
//! once `exit_timeout` elapses, at which point remaining connections are
//! forcibly dropped with the process.

use super::connect::handle_connect;
use super::error::ProxyError;
use super::forward::handle_http;
use super::role::RoleExtractor;
use super::tls::client_common_name;
use super::{ProxyBody, UpstreamProxy};
use crate::acl::AclEngine;
use crate::conntrack::Tracker;
use crate::netpolicy::SafeResolver;
use crate::telemetry::{AuditEvent, AuditLogger};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Shared state handed to every connection task.
///
/// Everything here is read-only after startup except the shutdown flag,
/// so connection tasks never contend on locks for policy decisions.
pub struct ProxyContext {
    /// Per-role destination policy.
    pub acl: AclEngine,
    /// Deny-aware resolver (owns the address classifier).
    pub resolver: SafeResolver,
    /// Registry of in-flight upstream connections.
    pub tracker: Arc<Tracker>,
    /// Audit sink for decision records.
    pub audit: Arc<AuditLogger>,
    /// Role identification strategy.
    pub role_extractor: RoleExtractor,
    /// Bound on upstream dial (resolution has its own copy).
    pub connect_timeout: Duration,
    /// Operator-configured extra phrase appended to denial bodies.
    pub deny_message_extra: Option<String>,
    /// Optional upstream proxy to chain through.
    pub upstream_proxy: Option<UpstreamProxy>,
    /// Set when shutdown begins; workers refuse new work.
    shutdown: AtomicBool,
}

impl ProxyContext {
    /// Create a context. The shutdown flag starts cleared.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        acl: AclEngine,
        resolver: SafeResolver,
        tracker: Arc<Tracker>,
        audit: Arc<AuditLogger>,
        role_extractor: RoleExtractor,
        connect_timeout: Duration,
        deny_message_extra: Option<String>,
        upstream_proxy: Option<UpstreamProxy>,
    ) -> Self {
        Self {
            acl,
            resolver,
            tracker,
            audit,
            role_extractor,
            connect_timeout,
            deny_message_extra,
            upstream_proxy,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Flip the shutdown flag for this context and its tracker.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.tracker.begin_shutdown();
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// The proxy server.
pub struct ProxyServer {
    ctx: Arc<ProxyContext>,
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    shutdown_rx: watch::Receiver<bool>,
    exit_timeout: Duration,
}

impl ProxyServer {
    /// Bind the listener and prepare the server.
    ///
    /// When `tls` is set, every accepted connection must complete a TLS
    /// handshake (with a client certificate, if the acceptor requires one)
    /// before any request is read.
    pub async fn bind(
        ctx: Arc<ProxyContext>,
        addr: SocketAddr,
        tls: Option<TlsAcceptor>,
        shutdown_rx: watch::Receiver<bool>,
        exit_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            ctx,
            listener,
            tls,
            shutdown_rx,
            exit_timeout,
        })
    }

    /// The address the listener actually bound (port 0 resolves here).
    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the accept loop until shutdown, then drain tracked connections.
    pub async fn run(self) -> Result<(), ProxyError> {
        let local = self.listener.local_addr()?;
        info!(%local, tls = self.tls.is_some(), "proxy listening");
        self.ctx.audit.log(AuditEvent::ProxyStart {
            listen: local.to_string(),
            tls: self.tls.is_some(),
        });

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            self.spawn_connection_handler(stream);
                        }
                        Err(e) => {
                            debug!("accept failed: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("proxy shutting down, draining connections");
                        break;
                    }
                }
            }
        }

        let remaining = self.drain().await;
        self.ctx.audit.log(AuditEvent::ProxyStop {
            remaining_connections: remaining,
        });
        Ok(())
    }

    /// Spawn a task to handle a single accepted connection.
    fn spawn_connection_handler(&self, stream: TcpStream) {
        let ctx = self.ctx.clone();
        let tls = self.tls.clone();

        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => handle_tls_connection(ctx, acceptor, stream).await,
                None => serve_http(ctx, stream, None).await,
            };
            match result {
                // Internal errors are the one class that escalates severity.
                Err(e @ ProxyError::Internal(_)) => warn!("{}", e),
                // Resets and half-finished requests are routine for a proxy;
                // none of them are worth more than a debug line.
                Err(e) => debug!("connection ended: {}", e),
                Ok(()) => {}
            }
        });
    }

    /// Poll the tracker until all connections are gone or idle, bounded by
    /// `exit_timeout`. Returns how many connections were still open.
    async fn drain(&self) -> usize {
        self.ctx.begin_shutdown();
        let deadline = Instant::now() + self.exit_timeout;

        loop {
            if self.ctx.tracker.is_empty() {
                info!("all proxied connections closed");
                return 0;
            }
            let idle_in = self.ctx.tracker.maybe_idle_in();
            if idle_in.is_zero() {
                let remaining = self.ctx.tracker.len();
                info!(remaining, "all remaining connections are idle, exiting");
                return remaining;
            }
            let now = Instant::now();
            if now >= deadline {
                let remaining = self.ctx.tracker.len();
                info!(remaining, "exit timeout reached, abandoning connections");
                return remaining;
            }
            let wait = idle_in
                .min(deadline - now)
                .min(Duration::from_millis(250));
            tokio::time::sleep(wait).await;
        }
    }
}

/// Terminate TLS, extract the peer certificate CN, and serve HTTP over the
/// session.
async fn handle_tls_connection(
    ctx: Arc<ProxyContext>,
    acceptor: TlsAcceptor,
    stream: TcpStream,
) -> Result<(), ProxyError> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| ProxyError::Tls(format!("handshake failed: {e}")))?;

    let common_name = {
        let (_, session) = tls_stream.get_ref();
        session.peer_certificates().and_then(client_common_name)
    };

    serve_http(ctx, tls_stream, common_name).await
}

/// Serve HTTP/1.1 with upgrade support over any byte stream.
async fn serve_http<I>(
    ctx: Arc<ProxyContext>,
    io: I,
    tls_role: Option<String>,
) -> Result<(), ProxyError>
where
    I: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let tls_role = tls_role.clone();
        async move { proxy_request(ctx, req, tls_role).await }
    });

    http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

/// Dispatch one request by method.
async fn proxy_request(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    tls_role: Option<String>,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        handle_connect(ctx, req, tls_role).await
    } else {
        handle_http(ctx, req, tls_role).await
    }
}
