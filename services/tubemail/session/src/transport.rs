//! Mutually authenticated TLS transport.
//!
//! Both sides present a certificate signed by the shared mesh CA. Servers
//! require a client certificate; clients verify the server chain against the
//! CA but ignore the server name, since peers are dialled by IP address.

use crate::x509::CertError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// ALPN protocol identifier
pub const ALPN_TUBEMAIL: &[u8] = b"tubemail/1";

/// TLS setup errors
#[derive(Error, Debug)]
pub enum TlsError {
    /// Certificate material could not be read
    #[error(transparent)]
    Cert(#[from] CertError),

    /// Key material could not be read
    #[error("no private key found")]
    MissingKey,

    /// Verifier could not be built from the CA
    #[error("failed to build certificate verifier: {0}")]
    Verifier(String),

    /// rustls rejected the configuration
    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Unified stream type for both ends of a TLS connection
pub enum IoStream {
    /// Accepted connection
    Server(tokio_rustls::server::TlsStream<TcpStream>),
    /// Dialled connection
    Client(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            IoStream::Server(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Client(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match self.get_mut() {
            IoStream::Server(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Client(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Server(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Client(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        match self.get_mut() {
            IoStream::Server(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Client(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Get the peer address of the underlying stream
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            IoStream::Server(stream) => stream.get_ref().0.peer_addr(),
            IoStream::Client(stream) => stream.get_ref().0.peer_addr(),
        }
    }

    /// End-entity certificate the peer presented
    pub fn peer_certificate(&self) -> Option<CertificateDer<'static>> {
        let certs = match self {
            IoStream::Server(stream) => stream.get_ref().1.peer_certificates(),
            IoStream::Client(stream) => stream.get_ref().1.peer_certificates(),
        };
        certs.and_then(|certs| certs.first()).cloned()
    }
}

fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, CertError> {
    let certs = rustls_pemfile::certs(&mut &pem[..]).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(CertError::Missing);
    }
    Ok(certs)
}

fn load_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(CertError::Pem)?
        .ok_or(TlsError::MissingKey)
}

fn load_roots(ca_pem: &[u8]) -> Result<Arc<RootCertStore>, TlsError> {
    let mut roots = RootCertStore::empty();
    for ca in load_certs(ca_pem)? {
        roots.add(ca)?;
    }
    Ok(Arc::new(roots))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Create a TLS server configuration that requires client certificates
/// signed by the mesh CA
pub fn make_server_config(
    key_pem: &[u8],
    cert_pem: &[u8],
    ca_pem: &[u8],
) -> Result<ServerConfig, TlsError> {
    let provider = provider();
    let roots = load_roots(ca_pem)?;
    let client_verifier = WebPkiClientVerifier::builder_with_provider(roots, provider.clone())
        .build()
        .map_err(|e| TlsError::Verifier(e.to_string()))?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(client_verifier)
        .with_single_cert(load_certs(cert_pem)?, load_key(key_pem)?)?;
    config.alpn_protocols = vec![ALPN_TUBEMAIL.to_vec()];

    debug!("TLS server configuration created");
    Ok(config)
}

/// Create a TLS client configuration presenting our certificate and checking
/// the server chain against the mesh CA
pub fn make_client_config(
    key_pem: &[u8],
    cert_pem: &[u8],
    ca_pem: &[u8],
) -> Result<ClientConfig, TlsError> {
    let provider = provider();
    let verifier = MeshServerVerifier {
        roots: load_roots(ca_pem)?,
        provider: provider.clone(),
    };

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(load_certs(cert_pem)?, load_key(key_pem)?)?;
    config.alpn_protocols = vec![ALPN_TUBEMAIL.to_vec()];

    debug!("TLS client configuration created");
    Ok(config)
}

/// Server acceptor and client connector sharing one identity
#[derive(Clone)]
pub struct TlsIdentity {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
}

impl TlsIdentity {
    /// Build both TLS sides from PEM key material
    pub fn new(key_pem: &[u8], cert_pem: &[u8], ca_pem: &[u8]) -> Result<Self, TlsError> {
        let server = make_server_config(key_pem, cert_pem, ca_pem)?;
        let client = make_client_config(key_pem, cert_pem, ca_pem)?;
        info!("TLS identity loaded");
        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
        })
    }

    /// Run the server side of the TLS handshake
    pub async fn accept(&self, tcp_stream: TcpStream) -> io::Result<IoStream> {
        let tls_stream = self.acceptor.accept(tcp_stream).await?;
        Ok(IoStream::Server(tls_stream))
    }

    /// Run the client side of the TLS handshake
    pub async fn connect(&self, tcp_stream: TcpStream) -> io::Result<IoStream> {
        let peer_addr = tcp_stream.peer_addr()?;
        let server_name = ServerName::IpAddress(peer_addr.ip().into());
        let tls_stream = self.connector.connect(server_name, tcp_stream).await?;
        Ok(IoStream::Client(tls_stream))
    }
}

/// Accepts any server certificate chaining up to the mesh CA, whatever name
/// it was issued for
#[derive(Debug)]
struct MeshServerVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for MeshServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
