use crate::store::SnapshotStore;
use std::io::BufReader;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::rustls::crypto::ring::{self, sign::any_supported_type};
use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// Builds the acceptor used by the TLS listener.
///
/// The certificate is chosen per handshake from the snapshot current at that
/// moment, so certificates rotate together with the routing table.
pub fn create_acceptor(store: Arc<SnapshotStore>) -> Result<TlsAcceptor, rustls::Error> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(CertificateResolver { store }));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Parses a PEM certificate chain and private key into a key usable by the
/// TLS listener. PKCS#8, PKCS#1 and SEC1 keys are accepted.
pub fn load_certified_key(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, CertificateError> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem))
        .collect::<Result<Vec<_>, _>>()
        .map_err(CertificateError::InvalidPem)?;
    if certs.is_empty() {
        return Err(CertificateError::NoCertificate);
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem))
        .map_err(CertificateError::InvalidPem)?
        .ok_or(CertificateError::NoPrivateKey)?;

    let signing_key = any_supported_type(&key).map_err(CertificateError::UnsupportedKey)?;

    Ok(CertifiedKey::new(certs, signing_key))
}

#[derive(Debug)]
struct CertificateResolver {
    store: Arc<SnapshotStore>,
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = match hello.server_name() {
            Some(name) => name,
            None => {
                info!("Rejecting TLS handshake without SNI.");
                return None;
            }
        };

        let certificate = self.store.current().certificate(server_name);
        if certificate.is_none() {
            info!("No certificate configured for `{}`, rejecting handshake.", server_name);
        }

        certificate
    }
}

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("The PEM data could not be read: {0}")]
    InvalidPem(std::io::Error),
    #[error("The certificate chain is empty.")]
    NoCertificate,
    #[error("No private key was found.")]
    NoPrivateKey,
    #[error("The private key type is not supported: {0}")]
    UnsupportedKey(rustls::Error),
}
