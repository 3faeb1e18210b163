// Client TLS configuration built from in-memory PEM credentials.
use std::fmt;
use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::{Result, TransportError};

/// Client identity presented to the gateway.
///
/// `certificate_pem` may carry the private key as well; a separate
/// `private_key_pem` takes precedence when both are present.
#[derive(Clone, Default)]
pub struct Credentials {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Option<Vec<u8>>,
    pub passphrase: Option<String>,
    /// Extra trust anchors. When unset the public web PKI roots are used.
    pub trust_anchors_pem: Option<Vec<u8>>,
}

impl Credentials {
    pub fn new(certificate_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            certificate_pem: certificate_pem.into(),
            ..Self::default()
        }
    }

    pub fn with_private_key(mut self, private_key_pem: impl Into<Vec<u8>>) -> Self {
        self.private_key_pem = Some(private_key_pem.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    pub fn with_trust_anchors(mut self, trust_anchors_pem: impl Into<Vec<u8>>) -> Self {
        self.trust_anchors_pem = Some(trust_anchors_pem.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.certificate_pem.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("certificate_pem", &format_args!("<{} bytes>", self.certificate_pem.len()))
            .field("private_key_pem", &self.private_key_pem.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .field("trust_anchors_pem", &self.trust_anchors_pem.as_ref().map(Vec::len))
            .finish()
    }
}

/// Build a rustls client config that authenticates with `credentials`.
pub fn client_config(credentials: &Credentials) -> Result<Arc<rustls::ClientConfig>> {
    let certs = parse_certificates(&credentials.certificate_pem)?;
    if certs.is_empty() {
        return Err(TransportError::Credentials(
            "no certificate found in certificate PEM".to_string(),
        ));
    }
    let key_pem = credentials
        .private_key_pem
        .as_deref()
        .unwrap_or(credentials.certificate_pem.as_slice());
    let key = parse_private_key(key_pem, credentials.passphrase.is_some())?;

    let mut roots = RootCertStore::empty();
    match credentials.trust_anchors_pem.as_deref() {
        Some(pem) => {
            for cert in parse_certificates(pem)? {
                roots
                    .add(cert)
                    .map_err(|err| TransportError::Credentials(format!("trust anchor: {err}")))?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|err| TransportError::Credentials(err.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|err| TransportError::Credentials(err.to_string()))?;
    Ok(Arc::new(config))
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| TransportError::Credentials(format!("certificate PEM: {err}")))
}

fn parse_private_key(pem: &[u8], has_passphrase: bool) -> Result<PrivateKeyDer<'static>> {
    // Encrypted keys need a decryption step rustls does not provide.
    if is_encrypted(pem) {
        let hint = if has_passphrase {
            "decrypt it before loading"
        } else {
            "no passphrase was supplied"
        };
        return Err(TransportError::Credentials(format!(
            "encrypted private keys are not supported; {hint}"
        )));
    }
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|err| TransportError::Credentials(format!("private key PEM: {err}")))?
        .ok_or_else(|| TransportError::Credentials("no private key found".to_string()))
}

fn is_encrypted(pem: &[u8]) -> bool {
    const MARKERS: [&[u8]; 2] = [b"ENCRYPTED PRIVATE KEY", b"Proc-Type: 4,ENCRYPTED"];
    MARKERS
        .iter()
        .any(|marker| pem.windows(marker.len()).any(|window| window == *marker))
}
