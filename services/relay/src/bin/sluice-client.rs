//! sluice-client
//!
//! Accepts local application connections and tunnels each one to a sluice
//! server over tcp, tls or quic.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sluice_relay::config::ClientArgs;
use sluice_relay::shutdown::shutdown_signal;
use sluice_relay::tls::server_name;
use sluice_relay::{
    logging, quic, Connector, LocalListener, QuicSession, Supervisor, TransportKind, QUIC_ALPN,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();
    logging::init(&args.log.log_level, args.log.log_format);

    let remote = args.resolve_remote().await?;
    info!(
        local_port = args.port,
        remote = %remote,
        mode = %args.mode,
        "Starting sluice client"
    );

    let connector = match args.mode {
        TransportKind::Plain => Connector::plain(remote),
        TransportKind::Tls => {
            let config = args.trust_roots()?.client_config(None)?;
            Connector::tls(remote, config, server_name(&args.server_name)?)
        }
        TransportKind::Quic => {
            let proto = args.proto()?;
            let tls = args.trust_roots()?.client_config(Some(QUIC_ALPN))?;
            let config = quic::client_config(&tls, args.idle_timeout())?;
            let bind = if remote.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let session = QuicSession::new(
                bind.parse().context("invalid quic bind address")?,
                remote,
                &args.server_name,
                config,
            )?;
            info!(proto = %proto, udp_port = session.local_port(), "QUIC endpoint ready");
            Connector::quic(Arc::new(session), proto)
        }
    };
    let connector = Arc::new(connector);

    let listener = LocalListener::bind(args.local_addr(), Arc::clone(&connector))
        .await
        .context("failed to start local listener")?;

    let mut supervisor = Supervisor::new();
    let reporter = supervisor.reporter();
    supervisor.spawn_listener(listener.port(), listener.closer(), listener.serve(reporter));

    let canceller = supervisor.canceller();
    tokio::spawn(async move {
        shutdown_signal().await;
        canceller.cancel();
    });

    let report = supervisor.join().await;

    if let Some(session) = connector.quic_session() {
        session.close();
    }

    info!(
        listeners = report.listeners,
        errors = report.errors_drained,
        "sluice client stopped"
    );

    Ok(())
}
