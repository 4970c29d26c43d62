//! Server-side TLS negotiation policy
//!
//! The proxy terminates the client's TLS at the transport layer, so the only
//! TLS spoken here is toward the *real* server: the proxy sends the
//! protocol's SSL probe, reads the server's answer, and then applies the
//! configured [`SslMode`] policy to decide whether (and how strictly) to
//! wrap the connection.
//!
//! Uses rustls (pure Rust TLS implementation); TLS 1.2 minimum.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use crate::error::{ProxyError, Result};

/// SSL mode policy toward the real server, mirroring libpq's sslmode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Cleartext only. A server that offers TLS is treated as a
    /// misconfigured target and refused.
    Disable,
    /// TLS when the server offers it (certificate not validated),
    /// cleartext when it does not. A handshake failure after the server
    /// offered TLS is a hard failure, never a downgrade.
    #[default]
    Prefer,
    /// TLS mandatory, certificate not validated.
    Require,
    /// TLS mandatory, certificate chain and server name validated.
    VerifyFull,
}

impl SslMode {
    /// Parse a sslmode string from connection parameters.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "disable" => Ok(Self::Disable),
            "prefer" | "" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(ProxyError::Config(format!("unknown sslmode: {other}"))),
        }
    }

    /// Decide whether to negotiate TLS given the server's probe answer.
    ///
    /// Returns `Ok(true)` to wrap the connection, `Ok(false)` to continue
    /// in cleartext, or a [`ProxyError::Handshake`] when the policy and the
    /// server's capabilities are irreconcilable.
    pub fn accepts(&self, server_supports_tls: bool) -> Result<bool> {
        match (self, server_supports_tls) {
            (Self::Disable, true) => Err(ProxyError::Handshake(
                "sslmode=disable but server supports TLS".into(),
            )),
            (Self::Disable, false) => Ok(false),
            (Self::Prefer, supported) => Ok(supported),
            (Self::Require | Self::VerifyFull, false) => Err(ProxyError::Handshake(
                "server does not support TLS".into(),
            )),
            (Self::Require | Self::VerifyFull, true) => Ok(true),
        }
    }

    fn verifies_certificates(&self) -> bool {
        matches!(self, Self::VerifyFull)
    }
}

/// Stream to the real server: plain TCP or TLS-wrapped mid-stream.
///
/// The TLS variant is boxed to reduce the size difference between variants.
pub enum ServerStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl ServerStream {
    /// Check if this stream is TLS-encrypted
    pub fn is_encrypted(&self) -> bool {
        matches!(self, ServerStream::Tls(_))
    }
}

/// Wrap an established TCP connection according to the SSL mode policy.
///
/// `server_supports_tls` is the server's one-byte answer to the protocol's
/// SSL probe, already read by the caller. `server_name` is used for SNI and
/// (under `verify-full`) certificate validation; `root_cert` optionally
/// points at a CA bundle for `verify-full`.
pub async fn negotiate(
    stream: TcpStream,
    mode: SslMode,
    server_supports_tls: bool,
    server_name: &str,
    root_cert: Option<&Path>,
) -> Result<ServerStream> {
    if !mode.accepts(server_supports_tls)? {
        return Ok(ServerStream::Tcp(stream));
    }

    let connector = build_connector(mode, root_cert)?;
    let name = ServerName::try_from(server_name.to_string())
        .map_err(|_| ProxyError::Handshake(format!("invalid server name: {server_name}")))?;
    let tls_stream = connector
        .connect(name, stream)
        .await
        .map_err(|e| ProxyError::Handshake(format!("TLS handshake failed: {e}")))?;
    Ok(ServerStream::Tls(Box::new(tls_stream)))
}

fn build_connector(mode: SslMode, root_cert: Option<&Path>) -> Result<tokio_rustls::TlsConnector> {
    let provider = rustls::crypto::ring::default_provider();
    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Config(format!("failed to set protocol versions: {e}")))?;

    let client_config = if mode.verifies_certificates() {
        builder
            .with_root_certificates(build_root_store(root_cert)?)
            .with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth()
    };

    Ok(tokio_rustls::TlsConnector::from(Arc::new(client_config)))
}

fn build_root_store(root_cert: Option<&Path>) -> Result<RootCertStore> {
    let mut root_store = RootCertStore::empty();
    match root_cert {
        Some(path) => {
            for cert in load_certificates(path)? {
                root_store.add(cert).map_err(|e| {
                    ProxyError::Config(format!("failed adding CA from {path:?}: {e}"))
                })?;
            }
        }
        None => {
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(root_store)
}

/// Load certificates from a PEM file, supporting certificate chains.
fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .map_err(|e| ProxyError::Config(format!("failed reading CA file {path:?}: {e}")))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("failed parsing CA file {path:?}: {e}")))
}

/// Certificate verifier that accepts any certificate.
///
/// Used for `prefer` and `require`, which encrypt the link without
/// authenticating the peer.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
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

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ServerStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ServerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ServerStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ServerStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ServerStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ServerStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ServerStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!(SslMode::parse("disable").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("prefer").unwrap(), SslMode::Prefer);
        assert_eq!(SslMode::parse("").unwrap(), SslMode::Prefer);
        assert_eq!(SslMode::parse("require").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("verify-full").unwrap(), SslMode::VerifyFull);
        assert!(SslMode::parse("allow").is_err());
    }

    #[test]
    fn test_ssl_mode_deserialize() {
        let mode: SslMode = serde_yaml::from_str("verify-full").unwrap();
        assert_eq!(mode, SslMode::VerifyFull);
        let mode: SslMode = serde_yaml::from_str("disable").unwrap();
        assert_eq!(mode, SslMode::Disable);
    }

    #[test]
    fn test_policy_disable() {
        assert!(!SslMode::Disable.accepts(false).unwrap());
        assert!(SslMode::Disable.accepts(true).is_err());
    }

    #[test]
    fn test_policy_prefer_follows_server() {
        assert!(SslMode::Prefer.accepts(true).unwrap());
        assert!(!SslMode::Prefer.accepts(false).unwrap());
    }

    #[test]
    fn test_policy_require_hard_fails_without_tls() {
        assert!(SslMode::Require.accepts(true).unwrap());
        let err = SslMode::Require.accepts(false).unwrap_err();
        assert!(matches!(err, ProxyError::Handshake(_)));

        assert!(SslMode::VerifyFull.accepts(true).unwrap());
        assert!(SslMode::VerifyFull.accepts(false).is_err());
    }

    #[test]
    fn test_build_connector_insecure_modes() {
        assert!(build_connector(SslMode::Prefer, None).is_ok());
        assert!(build_connector(SslMode::Require, None).is_ok());
    }

    #[test]
    fn test_build_connector_verify_full_with_webpki_roots() {
        assert!(build_connector(SslMode::VerifyFull, None).is_ok());
    }

    #[test]
    fn test_build_connector_missing_ca_file() {
        let result = build_connector(
            SslMode::VerifyFull,
            Some(Path::new("/nonexistent/ca.crt")),
        );
        assert!(result.is_err());
    }
}
