//! PKCS#12 (A1 certificate) handling.
//!
//! The same extraction feeds two consumers: the mutual-TLS identity used to
//! talk to the national API and the client certificate handed to the portal
//! fallback renderer.

use std::fmt;
use std::sync::OnceLock;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use openssl::error::ErrorStack;
use openssl::pkcs12::Pkcs12;
use openssl::provider::Provider;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use x509_parser::prelude::*;

/// Errors raised while opening a tenant certificate.
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate file is corrupted or not a PKCS#12 bundle: {0}")]
    Corrupted(String),
    #[error("certificate password is wrong")]
    WrongPassword,
    #[error("certificate bundle does not contain a certificate and private key pair")]
    MissingKeyPair,
    #[error("private key does not belong to the certificate in the bundle")]
    KeyMismatch,
    #[error("certificate expired on {0}")]
    Expired(DateTime<Utc>),
    #[error("stored credential could not be decrypted; check the vault key")]
    Undecryptable,
    #[error("company has no certificate registered")]
    NotRegistered,
}

/// Extracted signing material, scoped to a single operation.
///
/// The private key never appears in `Debug` output.
pub struct Credentials {
    certificate_pem: String,
    certificate_der: Vec<u8>,
    private_key_pem: SecretString,
}

impl Credentials {
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    pub fn private_key_pem(&self) -> &SecretString {
        &self.private_key_pem
    }

    /// Private key followed by the certificate, the layout
    /// `reqwest::Identity::from_pem` expects.
    pub fn pem_bundle(&self) -> Vec<u8> {
        let key = self.private_key_pem.expose_secret();
        let mut bundle = Vec::with_capacity(key.len() + self.certificate_pem.len() + 1);
        bundle.extend_from_slice(key.as_bytes());
        if !key.ends_with('\n') {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(self.certificate_pem.as_bytes());
        bundle
    }

    /// Subject, issuer and validity of the signing certificate.
    pub fn summary(&self) -> Result<CertificateSummary, CertificateError> {
        CertificateSummary::from_der(&self.certificate_der)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("certificate_bytes", &self.certificate_der.len())
            .finish_non_exhaustive()
    }
}

/// Human readable facts about a certificate.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CertificateSummary {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl CertificateSummary {
    pub fn from_der(der: &[u8]) -> Result<Self, CertificateError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| CertificateError::Corrupted(e.to_string()))?;
        let validity = cert.validity();

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial_number: cert.tbs_certificate.serial.to_str_radix(16),
            not_before: timestamp(validity.not_before.timestamp())?,
            not_after: timestamp(validity.not_after.timestamp())?,
        })
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, CertificateError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CertificateError::Corrupted(format!("invalid validity timestamp {secs}")))
}

/// Opens a base64 PKCS#12 bundle and returns its certificate and key.
///
/// OpenSSL walks the safe contents looking for a PKCS#8 shrouded key bag
/// first and a plain key bag second, so both encodings found in A1
/// certificates are accepted.
pub fn extract(pfx_base64: &str, password: &str) -> Result<Credentials, CertificateError> {
    ensure_legacy_algorithms();

    let cleaned: String = pfx_base64.chars().filter(|c| !c.is_whitespace()).collect();
    let der = BASE64
        .decode(cleaned)
        .map_err(|e| CertificateError::Corrupted(format!("invalid base64: {e}")))?;

    let pkcs12 = Pkcs12::from_der(&der)
        .map_err(|e| CertificateError::Corrupted(format!("not a PKCS#12 container: {e}")))?;
    let parsed = pkcs12.parse2(password).map_err(classify_parse_error)?;

    let (Some(pkey), Some(cert)) = (parsed.pkey, parsed.cert) else {
        return Err(CertificateError::MissingKeyPair);
    };

    let public = cert.public_key().map_err(corrupted)?;
    if !public.public_eq(&pkey) {
        return Err(CertificateError::KeyMismatch);
    }

    let private_key_pem = pkey.private_key_to_pem_pkcs8().map_err(corrupted)?;
    let private_key_pem =
        String::from_utf8(private_key_pem).map_err(|e| CertificateError::Corrupted(e.to_string()))?;
    let certificate_pem = cert.to_pem().map_err(corrupted)?;

    Ok(Credentials {
        certificate_pem: String::from_utf8_lossy(&certificate_pem).into_owned(),
        certificate_der: cert.to_der().map_err(corrupted)?,
        private_key_pem: SecretString::from(private_key_pem),
    })
}

fn classify_parse_error(error: ErrorStack) -> CertificateError {
    let mac_failure = error.errors().iter().any(|e| {
        e.reason()
            .is_some_and(|reason| reason.contains("mac verify failure"))
    });
    if mac_failure {
        CertificateError::WrongPassword
    } else {
        debug!("PKCS#12 parse failure: {error}");
        CertificateError::Corrupted(error.to_string())
    }
}

fn corrupted(error: ErrorStack) -> CertificateError {
    CertificateError::Corrupted(error.to_string())
}

/// Older A1 bundles are encrypted with RC2/3DES, which OpenSSL 3 only ships
/// in the legacy provider.
fn ensure_legacy_algorithms() {
    static LEGACY: OnceLock<Option<Provider>> = OnceLock::new();
    LEGACY.get_or_init(|| match Provider::try_load(None, "legacy", true) {
        Ok(provider) => Some(provider),
        Err(e) => {
            debug!("OpenSSL legacy provider unavailable: {e}");
            None
        }
    });
}
