use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_SERVER: &str = "http://localhost:80";
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);

/// 명령어 인자 정의 구조체
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// 로컬에서 서비스 되는 포트
    #[arg(long, short = 'p', env = "TUNNEL_PORT")]
    pub port: u16,

    /// Relay server providing forwarding
    #[arg(long, short = 'H', env = "TUNNEL_HOST", default_value = DEFAULT_SERVER)]
    pub host: String,

    /// Request this subdomain
    #[arg(long, short = 's', env = "TUNNEL_SUBDOMAIN")]
    pub subdomain: Option<String>,

    /// Tunnel traffic to this host instead of localhost and rewrite the Host header to it
    #[arg(long = "local-host", short = 'l', env = "TUNNEL_LOCAL_HOST")]
    pub local_host: Option<String>,

    /// Dial the local target over HTTPS
    #[arg(long = "local-https", env = "TUNNEL_LOCAL_HTTPS", default_value_t = false)]
    pub local_https: bool,

    /// PEM certificate presented to the local HTTPS target
    #[arg(long = "local-cert", env = "TUNNEL_LOCAL_CERT")]
    pub local_cert: Option<PathBuf>,

    /// PEM private key for --local-cert
    #[arg(long = "local-key", env = "TUNNEL_LOCAL_KEY")]
    pub local_key: Option<PathBuf>,

    /// Extra PEM CA used to verify the local HTTPS target
    #[arg(long = "local-ca", env = "TUNNEL_LOCAL_CA")]
    pub local_ca: Option<PathBuf>,

    /// Skip verification of the local HTTPS target's certificate
    #[arg(long = "allow-invalid-cert", env = "TUNNEL_ALLOW_INVALID_CERT", default_value_t = false)]
    pub allow_invalid_cert: bool,

    /// Print basic request info
    #[arg(long = "print-requests", env = "TUNNEL_PRINT_REQUESTS", default_value_t = false)]
    pub print_requests: bool,

    /// 재연결 시도 인터벌 (밀리초)
    #[arg(long = "retry-delay-ms", env = "TUNNEL_RETRY_DELAY_MS", default_value_t = 1000)]
    pub retry_delay_ms: u64,

    /// 재연결 시도 횟수 제한, 없으면 무제한
    #[arg(long = "max-retries", env = "TUNNEL_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// Print more verbose logs (ignored when RUST_LOG is set)
    #[arg(long, short = 'd', env = "TUNNEL_DEBUG", default_value_t = false)]
    pub debug: bool,
}

/// How often and how long to retry registration and local dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delay: DEFAULT_RETRY_DELAY,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may follow `failures` consecutive failures.
    pub fn allows(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }
}

/// TLS settings for dialing the local target.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTls {
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub allow_invalid_cert: bool,
}

/// What a tunnel needs to register and serve, independent of the CLI.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Base URL of the relay's management API.
    pub host: String,
    pub subdomain: Option<String>,
    pub local_port: u16,
    /// Also the value the `Host` header is rewritten to.
    pub local_host: Option<String>,
    pub local_tls: Option<LocalTls>,
    pub retry: RetryPolicy,
}

impl TunnelOptions {
    pub fn new(host: impl Into<String>, local_port: u16) -> Self {
        Self {
            host: host.into(),
            subdomain: None,
            local_port,
            local_host: None,
            local_tls: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Args> for TunnelOptions {
    fn from(args: &Args) -> Self {
        let local_tls = args.local_https.then(|| LocalTls {
            cert: args.local_cert.clone(),
            key: args.local_key.clone(),
            ca: args.local_ca.clone(),
            allow_invalid_cert: args.allow_invalid_cert,
        });
        Self {
            host: args.host.clone(),
            subdomain: args.subdomain.clone(),
            local_port: args.port,
            local_host: args.local_host.clone(),
            local_tls,
            retry: RetryPolicy {
                delay: Duration::from_millis(args.retry_delay_ms),
                max_attempts: args.max_retries,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_retry_by_default() {
        let args = Args::parse_from(["tunnel-client", "--port", "3000"]);
        let options = TunnelOptions::from(&args);
        assert_eq!(options.retry, RetryPolicy::default());
        assert!(options.retry.allows(u32::MAX - 1));
        assert!(options.local_tls.is_none());
        assert_eq!(options.host, DEFAULT_SERVER);
    }

    #[test]
    fn bounded_retry_stops_after_max() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(10),
            max_attempts: Some(2),
        };
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn local_tls_only_with_local_https() {
        let args = Args::parse_from([
            "tunnel-client",
            "--port",
            "8443",
            "--local-ca",
            "ca.pem",
            "--local-https",
            "--allow-invalid-cert",
        ]);
        let tls = TunnelOptions::from(&args).local_tls.unwrap();
        assert!(tls.allow_invalid_cert);
        assert_eq!(tls.ca, Some(PathBuf::from("ca.pem")));
    }
}
