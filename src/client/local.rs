//! Dialing the local target, over plain TCP or TLS.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::client::config::LocalTls;
use crate::client::errors::{TunnelError, TunnelResult};

pub const DEFAULT_LOCAL_HOST: &str = "localhost";

/// Where a link's local half connects to.
#[derive(Clone)]
pub struct LocalTarget {
    host: String,
    port: u16,
    tls: Option<(TlsConnector, ServerName<'static>)>,
}

impl std::fmt::Debug for LocalTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl LocalTarget {
    pub fn plain(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
        }
    }

    pub fn new(host: Option<&str>, port: u16, tls: Option<&LocalTls>) -> TunnelResult<Self> {
        let host = host.unwrap_or(DEFAULT_LOCAL_HOST).to_string();
        let tls = match tls {
            Some(settings) => {
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|e| TunnelError::Config(format!("invalid local host '{}': {}", host, e)))?;
                let connector = TlsConnector::from(Arc::new(client_config(settings)?));
                Some((connector, server_name))
            }
            None => None,
        };
        Ok(Self { host, port, tls })
    }

    pub fn scheme(&self) -> &'static str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Connects to the target. A refused TCP connect comes back as
    /// `ConnectionRefused` so callers can retry it; TLS failures come back
    /// as other error kinds.
    pub async fn connect(&self) -> io::Result<LocalStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on local stream: {}", e);
        }
        match &self.tls {
            Some((connector, name)) => {
                let tls = connector.connect(name.clone(), stream).await?;
                Ok(LocalStream::Tls(Box::new(tls)))
            }
            None => Ok(LocalStream::Plain(stream)),
        }
    }
}

/// The local half of a link.
#[derive(Debug)]
pub enum LocalStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for LocalStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LocalStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_flush(cx),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            LocalStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            LocalStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn tls_error(e: impl std::fmt::Display) -> TunnelError {
    TunnelError::Tls(e.to_string())
}

fn client_config(settings: &LocalTls) -> TunnelResult<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let builder = if settings.allow_invalid_cert {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca) = &settings.ca {
            for cert in load_certs(ca)? {
                roots.add(cert).map_err(tls_error)?;
            }
        }
        builder.with_root_certificates(roots)
    };

    match (&settings.cert, &settings.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(tls_error),
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TunnelError::Config(
            "--local-cert and --local-key must be given together".into(),
        )),
    }
}

fn load_certs(path: &Path) -> TunnelResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TunnelError::Config(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> TunnelResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| TunnelError::Config(format!("no private key in {}", path.display())))
}

/// Verifier for `--allow-invalid-cert`: any certificate is accepted, but
/// handshake signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_target_defaults_to_localhost() {
        let target = LocalTarget::new(None, 3000, None).unwrap();
        assert_eq!(target.host(), DEFAULT_LOCAL_HOST);
        assert_eq!(target.scheme(), "http");
    }

    #[test]
    fn tls_target_without_verification() {
        let tls = LocalTls {
            allow_invalid_cert: true,
            ..Default::default()
        };
        let target = LocalTarget::new(Some("dev.internal"), 8443, Some(&tls)).unwrap();
        assert_eq!(target.scheme(), "https");
    }

    #[test]
    fn client_cert_needs_a_key() {
        let tls = LocalTls {
            cert: Some("client.pem".into()),
            ..Default::default()
        };
        let err = LocalTarget::new(None, 8443, Some(&tls)).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[tokio::test]
    async fn refused_connect_is_reported_as_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let target = LocalTarget::plain("127.0.0.1", port);
        let err = target.connect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
