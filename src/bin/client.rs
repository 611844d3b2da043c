use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use tunnel_relay::client::{Args, TunnelOptions, TunnelSession};
use tunnel_relay::common::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let session = TunnelSession::open(TunnelOptions::from(&args))
        .await
        .context("failed to open tunnel")?;
    info!("your url is: {}", session.url());

    let mut errors = session.errors();
    let mut requests = session.requests();

    loop {
        tokio::select! {
            err = errors.recv() => match err {
                Ok(e) => error!("{}", e),
                Err(RecvError::Lagged(skipped)) => warn!("{} tunnel errors dropped", skipped),
                Err(RecvError::Closed) => break,
            },
            req = requests.recv(), if args.print_requests => match req {
                Ok(line) => info!("{} {} {}", chrono::Local::now().format("%H:%M:%S"), line.method, line.path),
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    warn!("failed to listen for ctrl-c: {}", e);
                }
                info!("closing tunnel");
                session.close();
                break;
            }
        }
    }
    Ok(())
}
