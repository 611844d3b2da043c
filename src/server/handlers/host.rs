use std::net::IpAddr;

use http::HeaderMap;

/// The host a request was addressed to, preferring a fronting proxy's
/// `X-Forwarded-Host` over `Host`.
pub fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(http::header::HOST))
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
}

/// Resolves the tunnel id a public hostname points at.
#[derive(Debug, Clone, Default)]
pub struct HostRouter {
    domain: Option<String>,
}

impl HostRouter {
    /// `domain` is the base domain tunnels live under, e.g. `tunnel.example.com`
    /// for `my-app.tunnel.example.com`. Without it, the last two labels are
    /// taken as the base domain, which misroutes multi-label public suffixes
    /// such as `example.co.uk`; those need an explicit domain.
    pub fn new(domain: Option<String>) -> Self {
        Self {
            domain: domain
                .map(|d| d.trim().trim_end_matches('.').to_ascii_lowercase())
                .filter(|d| !d.is_empty()),
        }
    }

    pub fn client_id(&self, host: &str) -> Option<String> {
        let hostname = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
        if hostname.is_empty() || hostname.parse::<IpAddr>().is_ok() {
            return None;
        }

        let subdomain = match &self.domain {
            Some(domain) => hostname.strip_suffix(domain.as_str())?.strip_suffix('.')?,
            None => {
                let labels: Vec<&str> = hostname.split('.').collect();
                let base_labels = if labels.last() == Some(&"localhost") { 1 } else { 2 };
                if labels.len() <= base_labels {
                    return None;
                }
                let cut = labels[..labels.len() - base_labels].iter().map(|l| l.len() + 1).sum::<usize>();
                &hostname[..cut - 1]
            }
        };

        (!subdomain.is_empty()).then(|| subdomain.to_string())
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn subdomain_under_configured_domain() {
        let router = HostRouter::new(Some("tunnel.example.com".into()));
        assert_eq!(router.client_id("abc123.tunnel.example.com").as_deref(), Some("abc123"));
        assert_eq!(router.client_id("ABC123.tunnel.example.com:443").as_deref(), Some("abc123"));
        assert_eq!(router.client_id("tunnel.example.com"), None);
        assert_eq!(router.client_id("other.org"), None);
        assert_eq!(router.client_id("xtunnel.example.com"), None);
    }

    #[test]
    fn multi_label_suffix_needs_a_configured_domain() {
        let router = HostRouter::new(Some("example.co.uk".into()));
        assert_eq!(router.client_id("abc.example.co.uk").as_deref(), Some("abc"));
        assert_eq!(router.client_id("example.co.uk"), None);

        let guessed = HostRouter::new(None);
        assert_eq!(guessed.client_id("abc.example.co.uk").as_deref(), Some("abc.example"));
    }

    #[test]
    fn subdomain_without_configured_domain() {
        let router = HostRouter::new(None);
        assert_eq!(router.client_id("abc123.example.com").as_deref(), Some("abc123"));
        assert_eq!(router.client_id("a.b.example.com").as_deref(), Some("a.b"));
        assert_eq!(router.client_id("example.com:8080"), None);
        assert_eq!(router.client_id("my-app.localhost:3000").as_deref(), Some("my-app"));
        assert_eq!(router.client_id("127.0.0.1:8080"), None);
        assert_eq!(router.client_id("[::1]:8080"), None);
    }

    #[test]
    fn forwarded_host_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("10.0.0.1:80"));
        assert_eq!(request_host(&headers), Some("10.0.0.1:80"));

        headers.insert("x-forwarded-host", HeaderValue::from_static("abc.example.com"));
        assert_eq!(request_host(&headers), Some("abc.example.com"));
    }
}
