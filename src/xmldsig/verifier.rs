use std::fmt;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use quick_xml::de::from_str as xml_from_str;
use serde::Serialize;
use tracing::debug;

use crate::crypto::{HashAlg, rsa, rsa::RsaPublicKey};
use crate::xmldsig::*;

/// Outcome of re-checking a persisted signed document.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub valid: bool,
    pub digest_match: bool,
    pub diagnostics: Vec<Diagnosis>,
}

/// What went wrong, or what had to be repaired, while verifying.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnosis {
    /// The signed block was stored without its inherited namespace.
    NamespaceReinjected { element: String },
    /// The content changed after signing.
    CorruptedPayload { expected: String, computed: String },
    /// The digest holds but the signature does not match the embedded
    /// certificate.
    SignatureMismatch,
    CorruptedCertificate { detail: String },
    UnsupportedAlgorithm { uri: String },
    MalformedDocument { detail: String },
}

impl fmt::Display for Diagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NamespaceReinjected { element } => {
                write!(f, "namespace reinjected on <{element}> before canonicalization")
            }
            Self::CorruptedPayload { expected, computed } => write!(
                f,
                "payload corrupted: digest {computed} does not match signed digest {expected}"
            ),
            Self::SignatureMismatch => write!(
                f,
                "signature does not match the embedded certificate (wrong certificate/key pair)"
            ),
            Self::CorruptedCertificate { detail } => {
                write!(f, "embedded certificate is corrupted: {detail}")
            }
            Self::UnsupportedAlgorithm { uri } => write!(f, "unsupported algorithm {uri}"),
            Self::MalformedDocument { detail } => write!(f, "malformed document: {detail}"),
        }
    }
}

impl VerificationReport {
    fn malformed(detail: impl Into<String>) -> Self {
        Self {
            valid: false,
            digest_match: false,
            diagnostics: vec![Diagnosis::MalformedDocument {
                detail: detail.into(),
            }],
        }
    }
}

/// Verify an enveloped signature produced by [`XmlSigner`].
///
/// Never fails: every problem is reported as a [`Diagnosis`].
pub fn verify(xml: &str) -> VerificationReport {
    let signature_xml = match utils::extract_element(xml, "Signature") {
        Ok(s) => s,
        Err(e) => return VerificationReport::malformed(e.to_string()),
    };
    let signature: Signature = match xml_from_str(&signature_xml) {
        Ok(s) => s,
        Err(e) => return VerificationReport::malformed(format!("Signature: {e}")),
    };

    let mut diagnostics = Vec::new();
    for uri in [
        &signature.signed_info.canon_method.algorithm,
        &signature.signed_info.signature_method.algorithm,
        &signature.signed_info.reference.digest_method.algorithm,
    ] {
        if ![algorithms::C14N, algorithms::RSA_SHA1, algorithms::SHA1].contains(&uri.as_str()) {
            diagnostics.push(Diagnosis::UnsupportedAlgorithm { uri: uri.clone() });
        }
    }
    if !diagnostics.is_empty() {
        return VerificationReport {
            valid: false,
            digest_match: false,
            diagnostics,
        };
    }

    let digest_match = match check_digest(xml, &signature.signed_info.reference, &mut diagnostics)
    {
        Ok(matched) => matched,
        Err(e) => return VerificationReport::malformed(e.to_string()),
    };

    let signature_ok = match check_signature(&signature_xml, &signature) {
        Ok(ok) => ok,
        Err(diagnosis) => {
            diagnostics.push(diagnosis);
            return VerificationReport {
                valid: false,
                digest_match,
                diagnostics,
            };
        }
    };
    if !signature_ok {
        diagnostics.push(Diagnosis::SignatureMismatch);
    }

    debug!(digest_match, signature_ok, "Signature verified");
    VerificationReport {
        valid: digest_match && signature_ok,
        digest_match,
        diagnostics,
    }
}

fn check_digest(
    xml: &str,
    reference: &Reference,
    diagnostics: &mut Vec<Diagnosis>,
) -> Result<bool> {
    let id = reference
        .uri
        .strip_prefix('#')
        .ok_or_else(|| Error::Invalid(format!("Invalid reference URI: {}", reference.uri)))?;

    let element = utils::extract_element_by_id(xml, id)?;
    let reinjected = utils::reinject_namespace(&element, ns::NFSE)?;
    if reinjected != element {
        diagnostics.push(Diagnosis::NamespaceReinjected {
            element: root_name(&element),
        });
    }

    let transformed = apply_transforms(&reinjected, &reference.transforms)?;
    let computed = BASE64.encode(HashAlg::Sha1.hash(transformed.as_bytes())?);
    let expected = strip_whitespace(&reference.digest_value);

    if computed == expected {
        Ok(true)
    } else {
        diagnostics.push(Diagnosis::CorruptedPayload { expected, computed });
        Ok(false)
    }
}

/// Applies the reference transforms; the node-set result is always
/// serialized with Canonical XML.
fn apply_transforms(data: &str, transforms: &Transforms) -> Result<String> {
    let mut result = data.to_string();
    for transform in &transforms.transform {
        result = match transform.algorithm.as_str() {
            algorithms::ENVELOPED_SIGNATURE => utils::strip_element(&result, "Signature")?,
            algorithms::C14N => c14n::canonicalize(&result)?,
            alg => return Err(Error::Invalid(format!("Unsupported transform: {alg}"))),
        };
    }
    c14n::canonicalize(&result)
}

fn check_signature(
    signature_xml: &str,
    signature: &Signature,
) -> std::result::Result<bool, Diagnosis> {
    let malformed = |e: Error| Diagnosis::MalformedDocument {
        detail: e.to_string(),
    };

    let certificate = BASE64
        .decode(strip_whitespace(&signature.key_info.x509_data.certificate))
        .map_err(|e| Diagnosis::CorruptedCertificate {
            detail: e.to_string(),
        })?;
    let public_key =
        RsaPublicKey::from_certificate_der(&certificate).map_err(|e| {
            Diagnosis::CorruptedCertificate {
                detail: e.to_string(),
            }
        })?;

    let signed_info = utils::extract_element(signature_xml, "SignedInfo").map_err(malformed)?;
    let signed_info = utils::reinject_namespace(&signed_info, ns::DS).map_err(malformed)?;
    let signed_info_c14n = c14n::canonicalize(&signed_info).map_err(malformed)?;

    let signature_bytes = BASE64
        .decode(strip_whitespace(&signature.signature_value))
        .map_err(|e| Diagnosis::MalformedDocument {
            detail: format!("SignatureValue: {e}"),
        })?;

    rsa::verify(
        &public_key,
        signed_info_c14n.as_bytes(),
        &signature_bytes,
        HashAlg::Sha1,
    )
    .map_err(|e| malformed(e.into()))
}

fn strip_whitespace(value: &str) -> String {
    value.chars().filter(|c| !c.is_whitespace()).collect()
}

fn root_name(element: &str) -> String {
    element
        .trim_start_matches('<')
        .split(|c: char| c.is_whitespace() || c == '>')
        .next()
        .unwrap_or_default()
        .to_string()
}
