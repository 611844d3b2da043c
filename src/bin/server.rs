use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use tunnel_relay::common::logging::init_tracing;
use tunnel_relay::server::metrics::init_metrics;
use tunnel_relay::server::{Args, ServerOptions, TunnelServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let options = ServerOptions::from(&args);
    info!(
        "Server started with domain: {}, max sockets per client: {}",
        options.domain.as_deref().unwrap_or("<any>"),
        options.registry.max_sockets
    );
    if options.domain.is_none() {
        warn!("no --domain given; routing on the last two host labels, set --domain for suffixes like co.uk");
    }

    let mut server = TunnelServer::new(options);
    match init_metrics() {
        Ok(handle) => server = server.with_metrics(handle),
        Err(e) => warn!("metrics disabled: {}", e),
    }

    let listener = TcpListener::bind((args.address, args.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", args.address, args.port))?;
    info!("server listening on {}", listener.local_addr()?);

    tokio::select! {
        res = server.serve(listener) => res.context("public listener failed")?,
        _ = shutdown_signal() => info!("shutting down"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
