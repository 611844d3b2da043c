use std::net::IpAddr;
use std::time::Duration;

use clap::Parser;

use crate::server::registry::RegistryOptions;
use crate::server::session::DEFAULT_GRACE_PERIOD;
use crate::server::socket_pool::DEFAULT_MAX_SOCKETS;

/// Command-line arguments for the tunnel relay server
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Port the public HTTP listener binds to
    #[arg(long, default_value_t = 80)]
    pub port: u16,

    /// Address the public listener and the link listeners bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub address: IpAddr,

    /// Base domain tunnels are served under, e.g. `tunnel.example.com`.
    /// Without it the last two host labels are the base domain, so
    /// suffixes like `example.co.uk` require this flag
    #[arg(long)]
    pub domain: Option<String>,

    /// Hand out `https://` tunnel URLs (TLS is terminated in front of the server)
    #[arg(long, default_value_t = false)]
    pub secure: bool,

    /// Links each client may hold open at once
    #[arg(long = "max-sockets", default_value_t = DEFAULT_MAX_SOCKETS)]
    pub max_sockets: usize,

    /// Milliseconds a client may stay without links before its tunnel is removed
    #[arg(long = "grace-ms", default_value_t = DEFAULT_GRACE_PERIOD.as_millis() as u64)]
    pub grace_ms: u64,

    /// Enable debug logging (ignored when RUST_LOG is set)
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

/// Settings the running server needs, independent of how they were supplied.
#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub domain: Option<String>,
    pub secure: bool,
    pub registry: RegistryOptions,
}

impl From<&Args> for ServerOptions {
    fn from(args: &Args) -> Self {
        Self {
            domain: args.domain.clone(),
            secure: args.secure,
            registry: RegistryOptions {
                max_sockets: args.max_sockets.max(1),
                grace_period: Duration::from_millis(args.grace_ms),
                bind_addr: args.address,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_registry_defaults() {
        let args = Args::parse_from(["tunnel-server"]);
        assert_eq!(args.port, 80);
        assert_eq!(args.max_sockets, DEFAULT_MAX_SOCKETS);

        let options = ServerOptions::from(&args);
        assert_eq!(options.registry.grace_period, DEFAULT_GRACE_PERIOD);
        assert!(!options.secure);
        assert!(options.domain.is_none());
    }

    #[test]
    fn zero_max_sockets_is_clamped() {
        let args = Args::parse_from(["tunnel-server", "--max-sockets", "0", "--domain", "example.com"]);
        let options = ServerOptions::from(&args);
        assert_eq!(options.registry.max_sockets, 1);
        assert_eq!(options.domain.as_deref(), Some("example.com"));
    }
}
