//! Listener construction.
//!
//! The API server may be served in plaintext or over TLS. TLS material is provided as in-memory
//! PEM buffers (typically read from a Kubernetes `Secret`), so the server configuration is built
//! directly from bytes; nothing is written to the filesystem.

use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    server::ServerConfig,
    sign::CertifiedKey,
};
use std::{
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
    time,
};
use tokio_rustls::{server::TlsStream, TlsAcceptor};
use tracing::debug;

/// Accepted connections probe their peers at this interval so that dead peers are reclaimed.
pub const TCP_KEEPALIVE: time::Duration = time::Duration::from_secs(3 * 60);

/// Bounds the time a client may take to complete a TLS handshake.
const HANDSHAKE_TIMEOUT: time::Duration = time::Duration::from_secs(10);

const ALPN_HTTP1: &[u8] = b"http/1.1";

/// A PEM-encoded certificate chain and private key.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    cert: Vec<u8>,
    key: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid TLS certificate material: {0}")]
    InvalidCertificate(String),

    #[error("TLS requires both a certificate and a private key")]
    PartialCertificate,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// A bound TCP listener, optionally terminating TLS.
pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    local_addr: SocketAddr,
}

/// An accepted connection that has not yet completed its TLS handshake (if any).
pub struct Connecting {
    tcp: TcpStream,
    tls: Option<TlsAcceptor>,
}

/// An established server-side connection.
pub enum Io {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

// === impl CertificateMaterial ===

impl CertificateMaterial {
    pub fn new(cert: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cert: cert.into(),
            key: key.into(),
        }
    }

    /// Builds material from optional parts. Both or neither must be set.
    pub fn from_parts(
        cert: Option<Vec<u8>>,
        key: Option<Vec<u8>>,
    ) -> Result<Option<Self>, TransportError> {
        match (cert, key) {
            (Some(cert), Some(key)) => Ok(Some(Self::new(cert, key))),
            (None, None) => Ok(None),
            _ => Err(TransportError::PartialCertificate),
        }
    }

    /// Builds a TLS server configuration, verifying that the private key matches the leaf
    /// certificate.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TransportError> {
        let certs = CertificateDer::pem_slice_iter(&self.cert)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| invalid(format!("failed to parse certificate: {e}")))?;
        if certs.is_empty() {
            return Err(invalid("no certificates found"));
        }

        let key = PrivateKeyDer::from_pem_slice(&self.key)
            .map_err(|e| invalid(format!("failed to parse private key: {e}")))?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let signing_key = provider
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(|e| invalid(format!("unsupported private key: {e}")))?;
        CertifiedKey::new(certs.clone(), signing_key)
            .keys_match()
            .map_err(|e| invalid(format!("private key does not match certificate: {e}")))?;

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| invalid(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| invalid(e.to_string()))?;
        config.alpn_protocols = vec![ALPN_HTTP1.to_vec()];
        Ok(Arc::new(config))
    }
}

/// Never prints key material.
impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("cert", &format_args!("{} bytes", self.cert.len()))
            .field("key", &format_args!("<redacted>"))
            .finish()
    }
}

fn invalid(msg: impl Into<String>) -> TransportError {
    TransportError::InvalidCertificate(msg.into())
}

// === impl Listener ===

impl Listener {
    /// Binds a listener on `addr`.
    ///
    /// When TLS material is provided, it is validated before the port is bound.
    pub async fn bind(
        addr: SocketAddr,
        tls: Option<&CertificateMaterial>,
    ) -> Result<Self, TransportError> {
        let tls = tls
            .map(|material| material.server_config().map(TlsAcceptor::from))
            .transpose()?;

        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = tcp
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        Ok(Self {
            tcp,
            tls,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Accepts a TCP connection and enables keep-alive probing on it.
    ///
    /// The TLS handshake, if any, is deferred to [`Connecting::handshake`] so that it does not
    /// block the accept loop.
    pub async fn accept(&self) -> io::Result<(Connecting, SocketAddr)> {
        let (tcp, peer) = self.tcp.accept().await?;
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(TCP_KEEPALIVE)
            .with_interval(TCP_KEEPALIVE);
        if let Err(error) = socket2::SockRef::from(&tcp).set_tcp_keepalive(&keepalive) {
            debug!(%peer, %error, "Failed to enable TCP keep-alive");
        }
        let conn = Connecting {
            tcp,
            tls: self.tls.clone(),
        };
        Ok((conn, peer))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("tls", &self.is_tls())
            .finish()
    }
}

// === impl Connecting ===

impl Connecting {
    pub async fn handshake(self) -> io::Result<Io> {
        let Some(acceptor) = self.tls else {
            return Ok(Io::Plain(self.tcp));
        };
        match time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(self.tcp)).await {
            Ok(res) => res.map(|tls| Io::Tls(Box::new(tls))),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "TLS handshake timed out",
            )),
        }
    }
}

// === impl Io ===

impl Io {
    /// Returns the negotiated ALPN protocol, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            Self::Plain(_) => None,
            Self::Tls(tls) => tls.get_ref().1.alpn_protocol(),
        }
    }
}

impl AsyncRead for Io {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_read(cx, buf),
            Self::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_write(cx, buf),
            Self::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_flush(cx),
            Self::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(io) => Pin::new(io).poll_shutdown(cx),
            Self::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}
