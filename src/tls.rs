//! Self-signed loopback certificates for encrypted backends

use rcgen::{generate_simple_self_signed, CertifiedKey};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// A TLS acceptor together with the certificate clients must trust
pub struct SelfSigned {
    pub acceptor: TlsAcceptor,
    pub certificate: CertificateDer<'static>,
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(ring::default_provider())
}

fn generate_self_signed_cert() -> anyhow::Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let subject_alt_names = vec!["localhost".to_string(), "127.0.0.1".to_string()];

    let CertifiedKey { cert, key_pair } = generate_simple_self_signed(subject_alt_names)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok((cert_der, key_der))
}

/// Build an acceptor for a loopback backend with a fresh self-signed certificate
pub fn self_signed_acceptor() -> anyhow::Result<SelfSigned> {
    let (certificate, key) = generate_self_signed_cert()?;

    let config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![certificate.clone()], key)
        .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

    Ok(SelfSigned {
        acceptor: TlsAcceptor::from(Arc::new(config)),
        certificate,
    })
}

/// Client configuration trusting exactly `roots`
pub fn client_config(roots: &[CertificateDer<'static>]) -> anyhow::Result<rustls::ClientConfig> {
    let mut store = RootCertStore::empty();
    for cert in roots {
        store
            .add(cert.clone())
            .map_err(|e| anyhow::anyhow!("Invalid root certificate: {}", e))?;
    }

    Ok(rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(store)
        .with_no_client_auth())
}
