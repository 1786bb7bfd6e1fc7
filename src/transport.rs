//! Shared transport and TLS helpers
//!
//! Provides the byte stream used by both the SMTP and the IMAP
//! drivers: [`open()`] dials a plain or implicit-TLS connection and
//! [`upgrade()`] performs the TLS handshake of a STARTTLS exchange on
//! an already-open plain connection.

use crate::config::{Endpoint, TrustPolicy};
use crate::error::{Error, Result, Stage};
use rustls::pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, warn};

/// A connection to a mail server, plaintext or TLS-wrapped.
#[derive(Debug)]
pub enum MailStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl MailStream {
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

/// Open a connection to `endpoint`.
///
/// With `implicit_tls` the TLS handshake completes before this returns,
/// so the first protocol bytes read are already encrypted.
pub async fn open(
    endpoint: &Endpoint,
    implicit_tls: bool,
    trust: TrustPolicy,
    stage: Stage,
) -> Result<MailStream> {
    debug!("Connecting to {} (implicit TLS: {})", endpoint, implicit_tls);

    let tcp_stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| Error::transport(stage, endpoint, e))?;

    if implicit_tls {
        let tls_stream = handshake(tcp_stream, endpoint, trust, stage).await?;
        return Ok(MailStream::Tls(Box::new(tls_stream)));
    }
    Ok(MailStream::Plain(tcp_stream))
}

/// Wrap an open plaintext connection in TLS.
///
/// The caller must already have completed the protocol-level STARTTLS
/// exchange. Upgrading a stream that is already TLS is an error.
pub async fn upgrade(
    stream: MailStream,
    endpoint: &Endpoint,
    trust: TrustPolicy,
    stage: Stage,
) -> Result<MailStream> {
    match stream {
        MailStream::Plain(tcp_stream) => {
            let tls_stream = handshake(tcp_stream, endpoint, trust, stage).await?;
            Ok(MailStream::Tls(Box::new(tls_stream)))
        }
        MailStream::Tls(_) => Err(Error::transport(
            stage,
            endpoint,
            "connection is already encrypted",
        )),
    }
}

async fn handshake(
    tcp_stream: TcpStream,
    endpoint: &Endpoint,
    trust: TrustPolicy,
    stage: Stage,
) -> Result<TlsStream<TcpStream>> {
    let connector = tls_connector(trust).map_err(|e| Error::transport(stage, endpoint, e))?;
    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|e| Error::transport(stage, endpoint, format!("Invalid server name: {e}")))?;

    let tls_stream = connector
        .connect(server_name, tcp_stream)
        .await
        .map_err(|e| Error::transport(stage, endpoint, format!("TLS handshake failed: {e}")))?;

    debug!("TLS established with {}", endpoint);
    Ok(tls_stream)
}

/// Build a TLS connector for the given trust policy.
///
/// The ring provider is passed explicitly, so this works whether or not
/// the embedding program installed a process-wide default.
///
/// [`TrustPolicy::AcceptInvalidCerts`] skips verification entirely:
/// monitored servers commonly use self-signed certificates and the
/// probe carries no secrets beyond the test account credentials.
fn tls_connector(trust: TrustPolicy) -> std::result::Result<TlsConnector, String> {
    let builder =
        rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| format!("TLS configuration failed: {e}"))?;

    let config = match trust {
        TrustPolicy::AcceptInvalidCerts => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(DangerousVerifier))
            .with_no_client_auth(),
        TrustPolicy::SystemRoots => {
            let mut root_store = rustls::RootCertStore::empty();
            let rustls_native_certs::CertificateResult { certs, errors, .. } =
                rustls_native_certs::load_native_certs();
            for err in errors {
                warn!("Skipping unreadable native certificate: {}", err);
            }
            let (added, _ignored) = root_store.add_parsable_certificates(certs);
            if added == 0 {
                return Err("no usable system root certificates found".to_string());
            }
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

impl AsyncRead for MailStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MailStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Certificate verifier that accepts all certificates.
#[derive(Debug)]
struct DangerousVerifier;

impl rustls::client::danger::ServerCertVerifier for DangerousVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
