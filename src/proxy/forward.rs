//! Plain HTTP forwarding (every method except `CONNECT`).
//!
//! The request is re-issued to the resolved destination over a tracked
//! connection and the response copied back, minus reserved headers. Denials
//! are well-formed responses carrying the `denied` token and the operator's
//! extra-context phrase.

use super::role::RoleError;
use super::server::ProxyContext;
use super::{
    deny_body, dial_destination, parse_host_port, text_response, ProxyBody, ProxyError,
    ERROR_HEADER, ROLE_HEADER, TRACE_HEADER,
};
use crate::telemetry::{emit_decision, DecisionRecord, ProxyType};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Hop-by-hop and proxy-control request headers never forwarded upstream.
const HOP_HEADERS: &[&str] = &["proxy-connection", "connection", "accept-encoding"];

/// Handle a plain HTTP proxy request.
pub async fn handle_http(
    ctx: Arc<ProxyContext>,
    mut req: Request<Incoming>,
    tls_role: Option<String>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let started = Instant::now();
    let trace_id = single_header(&req, TRACE_HEADER);
    let extra = ctx.deny_message_extra.as_deref();

    let role = match ctx.role_extractor.extract(&req, tls_role.as_deref()) {
        Ok(role) => role,
        Err(RoleError::Missing(detail)) => {
            let record = deny_record(
                ProxyType::Http,
                String::new(),
                String::new(),
                format!("missing role: {detail}"),
                None,
                started,
                trace_id,
            );
            emit_decision(&ctx.audit, record);
            return Ok(text_response(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                deny_body("unknown destination", "no role identity on request", extra),
            ));
        }
    };

    // Normalize the target: absolute-form URI first, Host header second.
    let Some((host, port)) = target_of(&req) else {
        let record = deny_record(
            ProxyType::Http,
            String::new(),
            role,
            "unable to determine destination host".to_string(),
            None,
            started,
            trace_id,
        );
        emit_decision(&ctx.audit, record);
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "unable to determine destination host\n".to_string(),
        ));
    };
    let requested_host = format!("{host}:{port}");

    let decision = ctx.acl.decide(&role, &host);
    if !decision.allow {
        let record = deny_record(
            ProxyType::Http,
            requested_host.clone(),
            role,
            decision.reason.clone(),
            decision.project.clone(),
            started,
            trace_id,
        );
        emit_decision(&ctx.audit, record);
        return Ok(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            deny_body(&requested_host, &decision.reason, extra),
        ));
    }

    let upstream = match dial_destination(&ctx, &role, &host, port, decision.allow_private).await {
        Ok(conn) => conn,
        Err(refusal) => {
            let record = deny_record(
                ProxyType::Http,
                requested_host.clone(),
                role,
                refusal.reason.clone(),
                decision.project.clone(),
                started,
                trace_id,
            );
            emit_decision(&ctx.audit, record);
            return Ok(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                deny_body(&requested_host, &refusal.reason, extra),
            ));
        }
    };
    let stats = upstream.stats();

    if let Err(e) = scrub_request(&mut req, &host, port, ctx.upstream_proxy.is_some()) {
        warn!("internal proxy error: {}", e);
        let record = deny_record(
            ProxyType::Http,
            requested_host.clone(),
            role,
            format!("internal error: {e}"),
            decision.project.clone(),
            started,
            trace_id,
        );
        emit_decision(&ctx.audit, record);
        return Ok(text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal proxy error\n".to_string(),
        ));
    }

    let (mut sender, conn) =
        match hyper::client::conn::http1::handshake(TokioIo::new(upstream)).await {
            Ok(pair) => pair,
            Err(e) => {
                let record = deny_record(
                    ProxyType::Http,
                    requested_host.clone(),
                    role,
                    format!("upstream handshake failed: {e}"),
                    decision.project.clone(),
                    started,
                    trace_id,
                );
                emit_decision(&ctx.audit, record);
                return Ok(text_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    deny_body(&requested_host, "upstream handshake failed", extra),
                ));
            }
        };
    tokio::spawn(async move {
        // The connection future owns the tracked upstream; the registry
        // entry goes away when this task finishes.
        if let Err(e) = conn.await {
            debug!("upstream connection ended: {}", e);
        }
    });

    let response = match sender.send_request(req).await {
        Ok(response) => response,
        Err(e) => {
            let record = deny_record(
                ProxyType::Http,
                requested_host.clone(),
                role,
                format!("upstream request failed: {e}"),
                decision.project.clone(),
                started,
                trace_id,
            );
            emit_decision(&ctx.audit, record);
            return Ok(text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                deny_body(&requested_host, "upstream request failed", extra),
            ));
        }
    };

    let mut response = response.map(|body| body.boxed());
    // Reserved headers are stripped so the upstream cannot spoof proxy
    // errors or reflect trace identifiers.
    response.headers_mut().remove(ERROR_HEADER);
    response.headers_mut().remove(TRACE_HEADER);

    emit_decision(
        &ctx.audit,
        DecisionRecord {
            allow: true,
            proxy_type: ProxyType::Http,
            requested_host,
            role,
            project: decision.project,
            decision_reason: decision.reason,
            bytes_in: stats.bytes_in(),
            bytes_out: stats.bytes_out(),
            duration_ms: started.elapsed().as_millis() as u64,
            trace_id,
        },
    );

    Ok(response)
}

/// Destination `(host, port)` of a plain proxy request.
fn target_of(req: &Request<Incoming>) -> Option<(String, u16)> {
    if let Some(host) = req.uri().host() {
        return Some((host.to_string(), req.uri().port_u16().unwrap_or(80)));
    }
    let authority = req.headers().get(HOST)?.to_str().ok()?;
    parse_host_port(authority, 80).ok()
}

/// Rewrite the request for the upstream leg.
///
/// Hop-by-hop and identity headers are dropped. Direct dials get an
/// origin-form URI plus a `Host` header; a chained upstream proxy gets the
/// absolute-form URI it expects.
fn scrub_request(
    req: &mut Request<Incoming>,
    host: &str,
    port: u16,
    via_proxy: bool,
) -> Result<(), ProxyError> {
    for header in HOP_HEADERS {
        req.headers_mut().remove(*header);
    }
    req.headers_mut().remove(ROLE_HEADER);
    req.headers_mut().remove(TRACE_HEADER);

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let target = if via_proxy {
        format!("http://{host}:{port}{path}")
    } else {
        path
    };
    *req.uri_mut() = target
        .parse::<Uri>()
        .map_err(|e| ProxyError::InvalidRequest(format!("unable to rebuild target URI: {e}")))?;

    let authority = if port == 80 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    let value = HeaderValue::from_str(&authority)
        .map_err(|e| ProxyError::InvalidRequest(format!("bad host header value: {e}")))?;
    req.headers_mut().insert(HOST, value);
    Ok(())
}

/// First value of a header, when exactly readable.
pub(crate) fn single_header<B>(req: &Request<B>, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// A deny-side decision record; byte counters are necessarily zero.
pub(crate) fn deny_record(
    proxy_type: ProxyType,
    requested_host: String,
    role: String,
    reason: String,
    project: Option<String>,
    started: Instant,
    trace_id: Option<String>,
) -> DecisionRecord {
    DecisionRecord {
        allow: false,
        proxy_type,
        requested_host,
        role,
        project,
        decision_reason: reason,
        bytes_in: 0,
        bytes_out: 0,
        duration_ms: started.elapsed().as_millis() as u64,
        trace_id,
    }
}
