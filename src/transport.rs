//! Raw byte streams to the server.


use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme};
use tokio_rustls::rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::{debug, warn};

use crate::config::{PoolConfig, Scheme};


pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected stream with its concrete type erased.
pub type BoxedStream = Box<dyn AsyncReadWrite>;


/// Opens connections to a server.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}


/// Runs `future`, failing with [`io::ErrorKind::TimedOut`] if `limit` elapses first.
pub(crate) async fn with_timeout<F, T>(limit: Option<Duration>, future: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, future).await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("operation timed out after {:?}", limit)))?,
        None => future.await,
    }
}


/// Plain TCP.
#[derive(Clone, Debug, Default)]
pub struct TcpTransport {
    connect_timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self { connect_timeout }
    }

    async fn connect_tcp(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = with_timeout(self.connect_timeout, TcpStream::connect((host, port))).await?;
        stream.set_nodelay(true)?;
        debug!(host, port, "TCP connection established");
        Ok(stream)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        Ok(Box::new(self.connect_tcp(host, port).await?))
    }
}


/// Accepts every server certificate.
#[derive(Debug)]
struct AcceptAnyCertificate {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// TLS over TCP, validating certificates against the webpki root store unless told otherwise.
#[derive(Clone)]
pub struct TlsTransport {
    tcp: TcpTransport,
    connector: TlsConnector,
}

impl TlsTransport {
    /// Builds the TLS client configuration on its own `ring` provider; the process-wide rustls
    /// default is left untouched.
    pub fn new(connect_timeout: Option<Duration>, accept_invalid_certs: bool) -> io::Result<Self> {
        let provider = Arc::new(ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let config = if accept_invalid_certs {
            warn!("TLS certificate validation disabled");
            let schemes = provider.signature_verification_algorithms.supported_schemes();
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { schemes }))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Ok(Self {
            tcp: TcpTransport::new(connect_timeout),
            connector: TlsConnector::from(Arc::new(config)),
        })
    }
}


#[async_trait]
impl Transport for TlsTransport {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let tcp = self.tcp.connect_tcp(host, port).await?;
        let tls = with_timeout(self.tcp.connect_timeout, self.connector.connect(server_name, tcp)).await?;
        debug!(host, port, "TLS handshake completed");
        Ok(Box::new(tls))
    }
}


/// The transport matching a pool's configured scheme.
#[derive(Clone)]
pub enum NetTransport {
    Plain(TcpTransport),
    Tls(TlsTransport),
}

impl NetTransport {
    pub fn from_config(config: &PoolConfig) -> io::Result<Self> {
        Ok(match config.scheme {
            Scheme::Http => Self::Plain(TcpTransport::new(config.connect_timeout)),
            Scheme::Https => Self::Tls(TlsTransport::new(config.connect_timeout, config.danger_accept_invalid_certs)?),
        })
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        match self {
            Self::Plain(tcp) => tcp.connect(host, port).await,
            Self::Tls(tls) => tls.connect(host, port).await,
        }
    }
}
