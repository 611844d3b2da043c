use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    #[error("registration request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server rejected the registration. Never retried.
    #[error("{0}")]
    BadRequest(String),

    #[error("invalid response from tunnel server: {0}")]
    InvalidResponse(String),

    #[error("{link_id} connection refused: {addr} (check your firewall settings)")]
    RemoteRefused { link_id: String, addr: String },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<TunnelError>,
    },
}

impl TunnelError {
    /// Failures that a later attempt could plausibly get past.
    pub fn is_retryable(&self) -> bool {
        match self {
            TunnelError::Io(_) => true,
            TunnelError::Http(e) => !e.status().is_some_and(|s| s.is_client_error()),
            _ => false,
        }
    }
}

pub type TunnelResult<T> = std::result::Result<T, TunnelError>;
