//! `CONNECT` tunneling.
//!
//! The flow is:
//!
//! 1. Client sends `CONNECT host:port HTTP/1.1`
//! 2. Role is extracted and the ACL consulted
//! 3. The destination is resolved through the deny-aware resolver and
//!    dialed (or a nested CONNECT is issued to the chained upstream proxy)
//! 4. `200 Connection established` is returned and the connection upgraded
//! 5. Bytes are spliced in both directions until one side finishes; the
//!    peer is half-closed and the other direction drained under a bounded
//!    grace window
//!
//! The canonical decision record for an established tunnel is emitted when
//! the tunnel ends, so its byte counters and duration are final.

use super::forward::{deny_record, single_header};
use super::role::RoleError;
use super::server::ProxyContext;
use super::{
    deny_body, dial_destination, empty_body, parse_host_port, text_response, ProxyBody,
    ProxyError, HALF_CLOSE_GRACE, TRACE_HEADER,
};
use crate::conntrack::TrackedConn;
use crate::telemetry::{emit_decision, DecisionRecord, ProxyType};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Maximum bytes of a chained proxy's CONNECT response header section.
const PROXY_RESPONSE_MAX: usize = 8192;

/// Handle an HTTP CONNECT request.
pub async fn handle_connect(
    ctx: Arc<ProxyContext>,
    req: Request<Incoming>,
    tls_role: Option<String>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let started = Instant::now();
    let trace_id = single_header(&req, TRACE_HEADER);
    let extra = ctx.deny_message_extra.as_deref();

    let role = match ctx.role_extractor.extract(&req, tls_role.as_deref()) {
        Ok(role) => role,
        Err(RoleError::Missing(detail)) => {
            emit_decision(
                &ctx.audit,
                deny_record(
                    ProxyType::Connect,
                    String::new(),
                    String::new(),
                    format!("missing role: {detail}"),
                    None,
                    started,
                    trace_id,
                ),
            );
            return Ok(text_response(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                deny_body("unknown destination", "no role identity on request", extra),
            ));
        }
    };

    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        emit_decision(
            &ctx.audit,
            deny_record(
                ProxyType::Connect,
                String::new(),
                role,
                "missing authority in CONNECT target".to_string(),
                None,
                started,
                trace_id,
            ),
        );
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "missing authority in CONNECT target\n".to_string(),
        ));
    };
    let (host, port) = match parse_host_port(&authority, 443) {
        Ok(target) => target,
        Err(detail) => {
            emit_decision(
                &ctx.audit,
                deny_record(
                    ProxyType::Connect,
                    authority.clone(),
                    role,
                    detail.clone(),
                    None,
                    started,
                    trace_id,
                ),
            );
            return Ok(text_response(StatusCode::BAD_REQUEST, format!("{detail}\n")));
        }
    };
    let requested_host = format!("{host}:{port}");

    let decision = ctx.acl.decide(&role, &host);
    if !decision.allow {
        emit_decision(
            &ctx.audit,
            deny_record(
                ProxyType::Connect,
                requested_host.clone(),
                role,
                decision.reason.clone(),
                decision.project.clone(),
                started,
                trace_id,
            ),
        );
        return Ok(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            deny_body(&requested_host, &decision.reason, extra),
        ));
    }

    let mut upstream = match dial_destination(&ctx, &role, &host, port, decision.allow_private).await
    {
        Ok(conn) => conn,
        Err(refusal) => {
            let status = if refusal.gateway_failure {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            emit_decision(
                &ctx.audit,
                deny_record(
                    ProxyType::Connect,
                    requested_host.clone(),
                    role,
                    refusal.reason.clone(),
                    decision.project.clone(),
                    started,
                    trace_id,
                ),
            );
            return Ok(text_response(
                status,
                deny_body(&requested_host, &refusal.reason, extra),
            ));
        }
    };

    // When chaining, the upstream proxy has to build the second tunnel leg
    // before the client hears 200 from us.
    if ctx.upstream_proxy.is_some() {
        match establish_chained_tunnel(&mut upstream, &host, port).await {
            Ok(()) => {}
            Err(detail) => {
                emit_decision(
                    &ctx.audit,
                    deny_record(
                        ProxyType::Connect,
                        requested_host.clone(),
                        role,
                        detail.clone(),
                        decision.project.clone(),
                        started,
                        trace_id,
                    ),
                );
                return Ok(text_response(
                    StatusCode::BAD_GATEWAY,
                    deny_body(&requested_host, &detail, extra),
                ));
            }
        }
    }

    let stats = upstream.stats();
    let ctx_for_tunnel = ctx.clone();
    tokio::spawn(async move {
        let reason = match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let client = TokioIo::new(upgraded);
                if let Err(e) = tunnel(client, upstream).await {
                    debug!("tunnel for {}:{} ended: {}", host, port, e);
                }
                decision.reason
            }
            Err(e) => {
                debug!("upgrade failed for {}:{}: {}", host, port, e);
                format!("{} (client upgrade failed)", decision.reason)
            }
        };

        emit_decision(
            &ctx_for_tunnel.audit,
            DecisionRecord {
                allow: true,
                proxy_type: ProxyType::Connect,
                requested_host,
                role,
                project: decision.project,
                decision_reason: reason,
                bytes_in: stats.bytes_in(),
                bytes_out: stats.bytes_out(),
                duration_ms: started.elapsed().as_millis() as u64,
                trace_id,
            },
        );
    });

    // 200 with an empty body initiates the upgrade.
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .expect("static response construction cannot fail"))
}

/// Issue a nested CONNECT over an already-dialed chained proxy connection.
///
/// The response header section is consumed byte-by-byte up to the blank
/// line, so nothing belonging to the tunneled stream is overshot.
async fn establish_chained_tunnel(
    upstream: &mut TrackedConn<TcpStream>,
    host: &str,
    port: u16,
) -> Result<(), String> {
    let request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    upstream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| format!("failed to send CONNECT to upstream proxy: {e}"))?;

    let mut buf = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        let n = upstream
            .read(&mut byte)
            .await
            .map_err(|e| format!("failed to read upstream proxy response: {e}"))?;
        if n == 0 {
            return Err("upstream proxy closed during CONNECT handshake".to_string());
        }
        buf.push(byte[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
        if buf.len() > PROXY_RESPONSE_MAX {
            return Err("upstream proxy response header section too large".to_string());
        }
    }

    let head = String::from_utf8_lossy(&buf);
    let status_line = head.lines().next().unwrap_or_default();
    let status_ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code == "200");
    if !status_ok {
        return Err(format!(
            "upstream proxy refused CONNECT: {}",
            status_line.trim()
        ));
    }
    Ok(())
}

/// Splice bytes bidirectionally between client and upstream.
///
/// Each direction runs as its own copy task; the first to finish half-closes
/// its peer, and the other direction is drained for at most
/// [`HALF_CLOSE_GRACE`] before the tunnel is torn down. Both halves of the
/// upstream go through the tracked wrapper, so either direction refreshes
/// the same activity timestamp.
async fn tunnel<A, B>(client: A, upstream: B) -> std::io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let mut client_to_upstream = tokio::spawn(async move {
        let res = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        res
    });
    let mut upstream_to_client = tokio::spawn(async move {
        let res = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        res
    });

    tokio::select! {
        first = &mut client_to_upstream => {
            log_copy_end("client->upstream", first);
            if tokio::time::timeout(HALF_CLOSE_GRACE, &mut upstream_to_client).await.is_err() {
                upstream_to_client.abort();
            }
        }
        first = &mut upstream_to_client => {
            log_copy_end("upstream->client", first);
            if tokio::time::timeout(HALF_CLOSE_GRACE, &mut client_to_upstream).await.is_err() {
                client_to_upstream.abort();
            }
        }
    }
    Ok(())
}

fn log_copy_end(direction: &str, result: Result<std::io::Result<u64>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(n)) => debug!(direction, bytes = n, "tunnel direction finished"),
        Ok(Err(e)) => debug!(direction, "tunnel direction errored: {}", e),
        Err(e) => debug!(direction, "tunnel task aborted: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_tunnel_copies_both_directions() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, mut upstream_far) = duplex(1024);

        let handle = tokio::spawn(tunnel(client_near, upstream_near));

        client_far.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_far.write_all(b"pong").await.unwrap();
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing the client side lets the tunnel wind down.
        drop(client_far);
        drop(upstream_far);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(3), handle).await;
    }

    #[tokio::test]
    async fn test_tunnel_half_close_drains_peer() {
        let (client_near, mut client_far) = duplex(1024);
        let (upstream_near, mut upstream_far) = duplex(1024);

        let handle = tokio::spawn(tunnel(client_near, upstream_near));

        // Client finishes immediately; upstream still owes a response.
        client_far.shutdown().await.unwrap();
        upstream_far.write_all(b"late data").await.unwrap();
        drop(upstream_far);

        let mut received = Vec::new();
        client_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"late data");

        let _ = tokio::time::timeout(std::time::Duration::from_secs(3), handle).await;
    }
}
