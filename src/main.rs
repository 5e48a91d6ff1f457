//! egress-warden binary entry point.
//!
//! Wires CLI parsing, configuration loading, the policy engines, and the
//! proxy server together, then runs until SIGINT/SIGTERM. Shutdown stops
//! the accept loop and drains tracked connections, bounded by the
//! configured exit timeout.

use anyhow::{Context, Result};
use clap::Parser;
use egress_warden::{
    acl::AclEngine,
    cli::Cli,
    config::ConfigLoader,
    conntrack::Tracker,
    netpolicy::{AddressClassifier, SafeResolver},
    proxy::{tls::build_acceptor, ProxyContext, ProxyServer, RoleExtractor, UpstreamProxy},
    telemetry::AuditLogger,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;

    let config = ConfigLoader::new()
        .load(&cli)
        .context("failed to load configuration")?;

    let acl = match &config.acl_file {
        Some(path) => AclEngine::from_file(path, config.allow_missing_role)
            .context("failed to load ACL policy document")?,
        None => {
            warn!("no ACL file configured; every role is unknown");
            AclEngine::empty(config.allow_missing_role)
        }
    };
    info!(roles = acl.role_count(), "loaded egress ACL");

    let classifier = AddressClassifier::new(
        config.parsed_deny_ranges()?,
        config.parsed_allow_ranges()?,
        config.parsed_deny_addresses()?,
    );
    let resolver = SafeResolver::new(classifier, config.connect_timeout());

    let upstream_proxy = config
        .upstream_proxy
        .as_deref()
        .map(UpstreamProxy::parse)
        .transpose()
        .context("invalid upstream proxy URL")?;

    let tls_acceptor = config
        .tls
        .as_ref()
        .map(build_acceptor)
        .transpose()
        .context("failed to build TLS listener configuration")?;

    // With a TLS listener the client certificate is the identity; the role
    // header is only trusted on plaintext deployments behind the operator's
    // own network controls.
    let role_extractor = if tls_acceptor.is_some() {
        RoleExtractor::TlsCommonName
    } else {
        RoleExtractor::header(config.role_header.clone())
    };

    let audit = match AuditLogger::new() {
        Ok(logger) => Arc::new(logger),
        Err(e) => {
            warn!("audit logging disabled: {}", e);
            Arc::new(AuditLogger::new_null())
        }
    };

    let ctx = Arc::new(ProxyContext::new(
        acl,
        resolver,
        Tracker::new(config.idle_threshold()),
        audit,
        role_extractor,
        config.connect_timeout(),
        config.deny_message_extra.clone(),
        upstream_proxy,
    ));

    let listen_addr = config.listen_addr()?;
    let exit_timeout = config.exit_timeout();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let server = ProxyServer::bind(ctx, listen_addr, tls_acceptor, shutdown_rx, exit_timeout)
            .await
            .context("failed to bind listener")?;

        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        server.run().await.context("proxy server failed")
    })
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Initialize the tracing subscriber for operational logging.
///
/// Audit telemetry is separate and goes to syslog; these logs go to stderr.
fn init_tracing(verbose: u8) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}
