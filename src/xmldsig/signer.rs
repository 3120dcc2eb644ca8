use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use openssl::x509::X509;
use quick_xml::se::to_string_with_root as xml_to_string;
use tracing::debug;

use crate::crypto::{HashAlg, rsa, rsa::RsaPrivateKey};
use crate::xmldsig::*;

/// A document that carries one signed content block.
///
/// The signed output is
/// `<{root} xmlns=NFSE versao={version}>{content}<Signature/></{root}>`
/// where `content` is the canonical form of [`content_xml`](Self::content_xml)
/// and carries the `Id` named by [`reference_id`](Self::reference_id).
pub trait Signable {
    fn root_element(&self) -> &'static str;
    fn version(&self) -> &str;
    fn reference_id(&self) -> &str;
    fn content_xml(&self) -> Result<String>;
}

/// Signs documents with one tenant certificate.
pub struct XmlSigner {
    private_key: RsaPrivateKey,
    certificate_b64: String,
}

impl XmlSigner {
    pub fn new(certificate_pem: &str, private_key_pem: &str) -> Result<Self> {
        let certificate = X509::from_pem(certificate_pem.as_bytes())
            .map_err(|e| Error::Invalid(format!("certificate PEM: {e}")))?;
        let certificate_der = certificate
            .to_der()
            .map_err(|e| Error::Invalid(format!("certificate DER: {e}")))?;
        let private_key = RsaPrivateKey::from_pem(private_key_pem)?;

        Ok(Self {
            private_key,
            certificate_b64: BASE64.encode(certificate_der),
        })
    }

    /// Produces the complete signed document.
    pub fn sign(&self, document: &impl Signable) -> Result<String> {
        let reference_id = document.reference_id();

        let content = utils::reinject_namespace(&document.content_xml()?, ns::NFSE)?;
        let content_c14n = c14n::canonicalize(&content)?;
        if utils::extract_element_by_id(&content_c14n, reference_id).is_err() {
            return Err(Error::Invalid(format!(
                "content block does not carry Id '{reference_id}'"
            )));
        }

        let digest = HashAlg::Sha1.hash(content_c14n.as_bytes())?;

        let signed_info = SignedInfo {
            xmlns: ns::DS.to_string(),
            canon_method: Algorithm::new(algorithms::C14N),
            signature_method: Algorithm::new(algorithms::RSA_SHA1),
            reference: Reference {
                uri: format!("#{reference_id}"),
                transforms: Transforms {
                    transform: vec![
                        Algorithm::new(algorithms::ENVELOPED_SIGNATURE),
                        Algorithm::new(algorithms::C14N),
                    ],
                },
                digest_method: Algorithm::new(algorithms::SHA1),
                digest_value: BASE64.encode(&digest),
            },
        };

        let signed_info_xml = xml_to_string("SignedInfo", &signed_info)?;
        let signed_info_c14n = c14n::canonicalize(&signed_info_xml)?;

        let signature = rsa::sign(
            &self.private_key,
            signed_info_c14n.as_bytes(),
            HashAlg::Sha1,
        )?;
        debug!(reference = %reference_id, "Signed {}", document.root_element());

        let root = document.root_element();
        Ok(format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<{root} xmlns="{nfse}" versao="{version}">{content}"#,
                r#"<Signature xmlns="{ds}">{signed_info}"#,
                "<SignatureValue>{signature}</SignatureValue>",
                "<KeyInfo><X509Data><X509Certificate>{certificate}</X509Certificate></X509Data></KeyInfo>",
                "</Signature></{root}>"
            ),
            root = root,
            nfse = ns::NFSE,
            version = quick_xml::escape::escape(document.version()),
            content = content_c14n,
            ds = ns::DS,
            signed_info = signed_info_c14n,
            signature = BASE64.encode(signature),
            certificate = self.certificate_b64,
        ))
    }
}
