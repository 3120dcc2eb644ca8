//! Enveloped XML-DSig signatures for NFS-e documents.
//!
//! Profile used by the national NFS-e layout: Canonical XML 1.0, SHA-1
//! digest, RSA-SHA1 signature and the signing certificate embedded as
//! `X509Certificate`.

mod c14n;
mod error;
mod signer;
#[cfg(test)]
mod tests;
mod utils;
mod verifier;

pub use c14n::canonicalize;
pub use error::Error;
pub use signer::{Signable, XmlSigner};
pub use utils::{element_text, reinject_namespace};
pub use verifier::{Diagnosis, VerificationReport, verify};

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

pub mod algorithms {
    pub const C14N: &str = "http://www.w3.org/TR/2001/REC-xml-c14n-20010315";
    pub const SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
    pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
    pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
}

pub mod ns {
    pub const NFSE: &str = "http://www.sped.fazenda.gov.br/nfse";
    pub const DS: &str = "http://www.w3.org/2000/09/xmldsig#";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signature {
    #[serde(rename = "SignedInfo")]
    pub signed_info: SignedInfo,

    #[serde(rename = "SignatureValue")]
    pub signature_value: String,

    #[serde(rename = "KeyInfo")]
    pub key_info: KeyInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedInfo {
    #[serde(rename = "@xmlns", default, skip_serializing_if = "String::is_empty")]
    pub xmlns: String,

    #[serde(rename = "CanonicalizationMethod")]
    pub canon_method: Algorithm,

    #[serde(rename = "SignatureMethod")]
    pub signature_method: Algorithm,

    #[serde(rename = "Reference")]
    pub reference: Reference,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Algorithm {
    #[serde(rename = "@Algorithm")]
    pub algorithm: String,
}

impl Algorithm {
    fn new(uri: &str) -> Self {
        Self {
            algorithm: uri.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    #[serde(rename = "@URI")]
    pub uri: String,

    #[serde(rename = "Transforms", default)]
    pub transforms: Transforms,

    #[serde(rename = "DigestMethod")]
    pub digest_method: Algorithm,

    #[serde(rename = "DigestValue")]
    pub digest_value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transforms {
    #[serde(rename = "Transform", default)]
    pub transform: Vec<Algorithm>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    #[serde(rename = "X509Data")]
    pub x509_data: X509Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X509Data {
    #[serde(rename = "X509Certificate")]
    pub certificate: String,
}
