//! sluice-server
//!
//! Listens on three ports (plain TCP, TLS, QUIC) and forwards every tunneled
//! session to a local backend until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sluice_relay::config::ServerArgs;
use sluice_relay::shutdown::shutdown_signal;
use sluice_relay::{
    logging, BackendDialer, QuicListener, QuicListenerConfig, StreamListener,
    StreamListenerConfig, Supervisor, TcpDialer, QUIC_ALPN,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    logging::init(&args.log.log_level, args.log.log_format);

    info!("Starting sluice server");

    let identity = args.identity()?;
    let tls_config = identity.server_config(None)?;
    let quic_tls_config = identity.server_config(Some(QUIC_ALPN))?;
    let routes = Arc::new(args.route_table()?);
    let dialer = Arc::new(TcpDialer::default());

    info!(
        bind = %args.bind,
        tcp_port = args.tcp_port,
        tls_port = args.tls_port,
        quic_port = args.quic_port,
        backend = %args.backend,
        routes = routes.len(),
        idle_timeout_secs = args.idle_timeout_secs,
        drain_policy = ?args.drain_policy,
        "Configuration loaded"
    );
    for (proto, backend) in routes.iter() {
        info!(proto = %proto, backend = %backend, "Route");
    }

    let plain = StreamListener::bind(
        StreamListenerConfig::plain(args.addr(args.tcp_port)).with_backend(args.backend),
        None,
        Arc::clone(&dialer),
    )
    .await
    .context("failed to start tcp listener")?;

    let tls = StreamListener::bind(
        StreamListenerConfig::tls(args.addr(args.tls_port)).with_backend(args.backend),
        Some(tls_config),
        Arc::clone(&dialer),
    )
    .await
    .context("failed to start tls listener")?;

    let quic = QuicListener::bind(
        QuicListenerConfig {
            bind_addr: args.addr(args.quic_port),
            idle_timeout: args.idle_timeout(),
            drain_policy: args.drain_policy,
        },
        &quic_tls_config,
        BackendDialer::new(routes, dialer),
    )
    .context("failed to start quic listener")?;

    let mut supervisor = Supervisor::new();
    let reporter = supervisor.reporter();

    supervisor.spawn_listener(plain.port(), plain.closer(), plain.serve(reporter.clone()));
    supervisor.spawn_listener(tls.port(), tls.closer(), tls.serve(reporter.clone()));
    supervisor.spawn_listener(quic.port(), quic.closer(), quic.serve(reporter));

    let canceller = supervisor.canceller();
    tokio::spawn(async move {
        shutdown_signal().await;
        canceller.cancel();
    });

    let report = supervisor.join().await;
    info!(
        listeners = report.listeners,
        errors = report.errors_drained,
        "sluice server stopped"
    );

    Ok(())
}
