//! TLS configuration for both ends of the stream.
//!
//! Both roles load a PEM certificate and key. The sensor side does not
//! verify the receiver's certificate chain (deployments routinely use
//! self-signed certificates); the connection is still TLS with the
//! provider's default protocol versions.

use std::io::BufReader;
use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};

use crate::StreamError;

pub fn server_config(cert_file: &str, key_file: &str) -> Result<Arc<ServerConfig>, StreamError> {
    let (certs, key) = load_key_pair(cert_file, key_file)?;
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| StreamError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| StreamError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

pub fn client_config(cert_file: &str, key_file: &str) -> Result<Arc<ClientConfig>, StreamError> {
    let (certs, key) = load_key_pair(cert_file, key_file)?;
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| StreamError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_client_auth_cert(certs, key)
        .map_err(|e| StreamError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn load_key_pair(
    cert_file: &str,
    key_file: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>), StreamError> {
    if cert_file.is_empty() {
        return Err(StreamError::Tls("no cert file provided".to_string()));
    }
    if key_file.is_empty() {
        return Err(StreamError::Tls("no key file provided".to_string()));
    }

    let cert_fd = std::fs::File::open(cert_file)
        .map_err(|e| StreamError::Tls(format!("could not open {}: {}", cert_file, e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_fd))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StreamError::Tls(format!("could not read certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(StreamError::Tls(format!(
            "no certificates found in {}",
            cert_file
        )));
    }

    let key_fd = std::fs::File::open(key_file)
        .map_err(|e| StreamError::Tls(format!("could not open {}: {}", key_file, e)))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_fd))
        .map_err(|e| StreamError::Tls(format!("could not read private key: {}", e)))?
        .ok_or_else(|| StreamError::Tls(format!("no private key found in {}", key_file)))?;

    Ok((certs, key))
}

/// Certificate verifier that trusts any presented server certificate while
/// still validating handshake signatures.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(
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
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(
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
