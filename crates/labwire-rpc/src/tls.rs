//! Mutual TLS with a pinned peer certificate.
//!
//! Each side presents its own certificate and accepts the other side only if
//! the presented end-entity certificate is byte-identical to the configured
//! peer certificate. Host names are not checked, so one client certificate
//! can be shared by any number of clients. Handshake signatures are still
//! verified with the `ring` provider.

use crate::error::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{CertificateError, DigitallySignedStruct, DistinguishedName, SignatureScheme};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Certificate material for one side of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SslConfig {
    /// PEM certificate (chain) presented to the peer
    pub local_cert: PathBuf,
    /// PEM private key for `local_cert`
    pub local_key: PathBuf,
    /// PEM certificate the peer must present
    pub peer_cert: PathBuf,
}

impl SslConfig {
    /// Create a configuration from three PEM paths.
    pub fn new(
        local_cert: impl Into<PathBuf>,
        local_key: impl Into<PathBuf>,
        peer_cert: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local_cert: local_cert.into(),
            local_key: local_key.into(),
            peer_cert: peer_cert.into(),
        }
    }

    /// Server-side rustls configuration requiring the pinned client certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if a PEM file is missing or invalid.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let (chain, key, peer) = self.load()?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = PinnedPeer::new(peer, &provider);
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(Arc::new(verifier))
            .with_single_cert(chain, key)?;
        Ok(Arc::new(config))
    }

    /// Client-side rustls configuration accepting only the pinned server certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Tls`] if a PEM file is missing or invalid.
    pub fn client_config(&self) -> Result<Arc<rustls::ClientConfig>> {
        let (chain, key, peer) = self.load()?;
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let verifier = PinnedPeer::new(peer, &provider);
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_client_auth_cert(chain, key)?;
        Ok(Arc::new(config))
    }

    /// Acceptor for the async listener.
    ///
    /// # Errors
    ///
    /// See [`SslConfig::server_config`].
    pub fn acceptor(&self) -> Result<tokio_rustls::TlsAcceptor> {
        Ok(tokio_rustls::TlsAcceptor::from(self.server_config()?))
    }

    /// Connector for async clients.
    ///
    /// # Errors
    ///
    /// See [`SslConfig::client_config`].
    pub fn connector(&self) -> Result<tokio_rustls::TlsConnector> {
        Ok(tokio_rustls::TlsConnector::from(self.client_config()?))
    }

    /// SNI name for `host`. The name is never verified.
    #[must_use]
    pub fn server_name(host: &str) -> ServerName<'static> {
        ServerName::try_from(host.to_string())
            .unwrap_or_else(|_| ServerName::from(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }

    fn load(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>, CertificateDer<'static>)> {
        let chain = read_certs(&self.local_cert)?;
        if chain.is_empty() {
            return Err(Error::Tls(format!(
                "no certificate in {}",
                self.local_cert.display()
            )));
        }
        let key = rustls_pemfile::private_key(&mut open(&self.local_key)?)
            .map_err(|e| Error::Tls(format!("{}: {e}", self.local_key.display())))?
            .ok_or_else(|| Error::Tls(format!("no private key in {}", self.local_key.display())))?;
        let peer = read_certs(&self.peer_cert)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Tls(format!("no certificate in {}", self.peer_cert.display())))?;
        Ok((chain, key, peer))
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Tls(format!("{}: {e}", path.display())))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {e}", path.display())))
}

/// Accepts exactly one end-entity certificate.
#[derive(Debug)]
struct PinnedPeer {
    expected: CertificateDer<'static>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedPeer {
    fn new(expected: CertificateDer<'static>, provider: &CryptoProvider) -> Self {
        Self {
            expected,
            algorithms: provider.signature_verification_algorithms,
        }
    }

    fn check(&self, presented: &CertificateDer<'_>) -> std::result::Result<(), rustls::Error> {
        if presented.as_ref() == self.expected.as_ref() {
            Ok(())
        } else {
            tracing::warn!("Peer presented a certificate other than the pinned one");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }
}

impl ServerCertVerifier for PinnedPeer {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        self.check(end_entity).map(|()| ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

impl ClientCertVerifier for PinnedPeer {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        self.check(end_entity).map(|()| ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_pair(dir: &Path, name: &str) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let cert_path = dir.join(format!("{name}.pem"));
        let key_path = dir.join(format!("{name}.key"));
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn builds_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let (server_cert, server_key) = write_pair(dir.path(), "server");
        let (client_cert, client_key) = write_pair(dir.path(), "client");

        let server = SslConfig::new(&server_cert, &server_key, &client_cert);
        let client = SslConfig::new(&client_cert, &client_key, &server_cert);
        assert!(server.server_config().is_ok());
        assert!(client.client_config().is_ok());
    }

    #[test]
    fn missing_key_is_tls_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = write_pair(dir.path(), "server");
        let config = SslConfig::new(&cert, dir.path().join("absent.key"), &cert);
        assert!(matches!(config.server_config(), Err(Error::Tls(_))));
        // A certificate file holds no private key.
        let config = SslConfig::new(&cert, &cert, &cert);
        assert!(matches!(config.client_config(), Err(Error::Tls(_))));
    }

    #[test]
    fn pinning_compares_bytes() {
        let a = rcgen::generate_simple_self_signed(vec!["a".to_string()]).unwrap();
        let b = rcgen::generate_simple_self_signed(vec!["a".to_string()]).unwrap();
        let provider = rustls::crypto::ring::default_provider();
        let pinned = PinnedPeer::new(a.cert.der().clone(), &provider);
        assert!(pinned.check(a.cert.der()).is_ok());
        assert!(pinned.check(b.cert.der()).is_err());
    }
}
