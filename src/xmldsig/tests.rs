use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::Serialize;

use crate::crypto::HashAlg;
use crate::pki::test_certs::generate_test_identity;
use crate::xmldsig::*;

#[derive(Debug, Serialize)]
struct InfTest {
    #[serde(rename = "@Id")]
    id: String,
    #[serde(rename = "vServ")]
    value: String,
    #[serde(rename = "xDescServ")]
    description: String,
}

struct TestDocument {
    inf: InfTest,
}

impl Signable for TestDocument {
    fn root_element(&self) -> &'static str {
        "DPS"
    }

    fn version(&self) -> &str {
        "1.00"
    }

    fn reference_id(&self) -> &str {
        &self.inf.id
    }

    fn content_xml(&self) -> Result<String> {
        Ok(quick_xml::se::to_string_with_root("infDPS", &self.inf)?)
    }
}

fn document() -> TestDocument {
    TestDocument {
        inf: InfTest {
            id: "DPS355030811234567800019500001000000000000001".into(),
            value: "1200.00".into(),
            description: "Consultoria & suporte <mensal>".into(),
        },
    }
}

fn signer() -> XmlSigner {
    let id = generate_test_identity("EMPRESA TESTE", "1234").unwrap();
    XmlSigner::new(&id.certificate_pem, &id.private_key_pem).unwrap()
}

#[test]
fn test_signed_document_structure() {
    let signed = signer().sign(&document()).unwrap();

    assert!(signed.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?><DPS xmlns="http://www.sped.fazenda.gov.br/nfse" versao="1.00">"#));
    assert!(signed.contains(r#"<infDPS xmlns="http://www.sped.fazenda.gov.br/nfse" Id="DPS355030811234567800019500001000000000000001">"#));
    assert!(signed.contains(r#"<Signature xmlns="http://www.w3.org/2000/09/xmldsig#">"#));
    assert!(signed.contains(r##"<Reference URI="#DPS355030811234567800019500001000000000000001">"##));
    assert!(signed.contains(algorithms::C14N));
    assert!(signed.contains(algorithms::RSA_SHA1));
    assert!(signed.contains(algorithms::SHA1));
    assert!(signed.contains(algorithms::ENVELOPED_SIGNATURE));
    assert!(signed.contains("<X509Certificate>"));
    assert!(signed.ends_with("</Signature></DPS>"));
}

#[test]
fn test_digest_recomputation_matches() {
    let signed = signer().sign(&document()).unwrap();

    let content = utils::extract_element(&signed, "infDPS").unwrap();
    let digest = BASE64.encode(
        HashAlg::Sha1
            .hash(canonicalize(&content).unwrap().as_bytes())
            .unwrap(),
    );
    let stored = element_text(&signed, "DigestValue").unwrap().unwrap();
    assert_eq!(digest, stored);

    let report = verify(&signed);
    assert!(report.digest_match);
    assert!(report.valid, "{:?}", report.diagnostics);
    assert!(report.diagnostics.is_empty());
}

#[test]
fn test_corrupted_payload_detected() {
    let signed = signer().sign(&document()).unwrap();
    let tampered = signed.replace("1200.00", "1300.00");

    let report = verify(&tampered);
    assert!(!report.valid);
    assert!(!report.digest_match);
    assert!(matches!(
        report.diagnostics.as_slice(),
        [Diagnosis::CorruptedPayload { .. }]
    ));
}

#[test]
fn test_wrong_certificate_detected() {
    let signed = signer().sign(&document()).unwrap();
    let other = generate_test_identity("OUTRA EMPRESA", "1234").unwrap();
    let other_der = openssl::x509::X509::from_pem(other.certificate_pem.as_bytes())
        .unwrap()
        .to_der()
        .unwrap();

    let original = element_text(&signed, "X509Certificate").unwrap().unwrap();
    let swapped = signed.replace(&original, &BASE64.encode(other_der));

    let report = verify(&swapped);
    assert!(!report.valid);
    assert!(report.digest_match);
    assert_eq!(report.diagnostics, vec![Diagnosis::SignatureMismatch]);
}

#[test]
fn test_corrupted_certificate_detected() {
    let signed = signer().sign(&document()).unwrap();
    let original = element_text(&signed, "X509Certificate").unwrap().unwrap();
    let broken = signed.replace(&original, "AAAA");

    let report = verify(&broken);
    assert!(!report.valid);
    assert!(matches!(
        report.diagnostics.last(),
        Some(Diagnosis::CorruptedCertificate { .. })
    ));
}

#[test]
fn test_legacy_row_without_inline_namespace() {
    let signed = signer().sign(&document()).unwrap();
    // Older rows stored infDPS relying on the namespace of DPS
    let legacy = signed.replacen(
        r#"<infDPS xmlns="http://www.sped.fazenda.gov.br/nfse" Id="#,
        r#"<infDPS Id="#,
        1,
    );
    assert_ne!(legacy, signed);

    let report = verify(&legacy);
    assert!(report.valid, "{:?}", report.diagnostics);
    assert_eq!(
        report.diagnostics,
        vec![Diagnosis::NamespaceReinjected {
            element: "infDPS".into()
        }]
    );
}

#[test]
fn test_malformed_document() {
    let report = verify("<DPS><infDPS>sem assinatura</infDPS></DPS>");
    assert!(!report.valid);
    assert!(matches!(
        report.diagnostics.as_slice(),
        [Diagnosis::MalformedDocument { .. }]
    ));
}

#[test]
fn test_signer_rejects_missing_reference() {
    struct NoId;
    impl Signable for NoId {
        fn root_element(&self) -> &'static str {
            "DPS"
        }
        fn version(&self) -> &str {
            "1.00"
        }
        fn reference_id(&self) -> &str {
            "DPS1"
        }
        fn content_xml(&self) -> Result<String> {
            Ok("<infDPS><a>1</a></infDPS>".into())
        }
    }

    assert!(matches!(signer().sign(&NoId), Err(Error::Invalid(_))));
}

#[test]
fn test_signer_rejects_bad_key() {
    let id = generate_test_identity("X", "1").unwrap();
    assert!(XmlSigner::new(&id.certificate_pem, "not a key").is_err());
    assert!(XmlSigner::new("not a cert", &id.private_key_pem).is_err());
}
