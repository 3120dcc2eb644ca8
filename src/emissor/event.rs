use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::xmldsig::{self, Signable};

/// Event code of a cancellation request.
pub const CANCELLATION_EVENT: &str = "101101";

const EVENT_DESCRIPTION: &str = "Cancelamento de NFS-e";
/// cMotivo 1: erro na emissão. Justification goes in xMotivo.
const REASON_CODE: u8 = 1;

/// `pedRegEvento` asking the authority to cancel an NFS-e.
#[derive(Debug, Clone)]
pub struct CancellationEvent {
    version: String,
    inf: InfPedReg,
}

#[derive(Debug, Clone, Serialize)]
struct InfPedReg {
    #[serde(rename = "@Id")]
    id: String,
    #[serde(rename = "tpAmb")]
    tp_amb: u8,
    #[serde(rename = "verAplic")]
    ver_aplic: String,
    #[serde(rename = "dhEvento")]
    dh_evento: String,
    #[serde(rename = "CNPJAutor")]
    cnpj_autor: String,
    #[serde(rename = "chNFSe")]
    ch_nfse: String,
    #[serde(rename = "nPedRegEvento")]
    n_ped_reg_evento: u16,
    e101101: Cancelamento,
}

#[derive(Debug, Clone, Serialize)]
struct Cancelamento {
    #[serde(rename = "xDesc")]
    x_desc: &'static str,
    #[serde(rename = "cMotivo")]
    c_motivo: u8,
    #[serde(rename = "xMotivo")]
    x_motivo: String,
}

impl CancellationEvent {
    /// First cancellation request (`nPedRegEvento` 1) for `access_key`.
    pub fn new(
        version: &str,
        tp_amb: u8,
        author_cnpj: &str,
        access_key: &str,
        justification: &str,
        issued_at: DateTime<FixedOffset>,
    ) -> Self {
        let sequence = 1;
        Self {
            version: version.to_string(),
            inf: InfPedReg {
                id: format!("PRE{access_key}{CANCELLATION_EVENT}{sequence:03}"),
                tp_amb,
                ver_aplic: concat!("nfse-server-", env!("CARGO_PKG_VERSION")).to_string(),
                dh_evento: issued_at.format("%Y-%m-%dT%H:%M:%S%:z").to_string(),
                cnpj_autor: author_cnpj.to_string(),
                ch_nfse: access_key.to_string(),
                n_ped_reg_evento: sequence,
                e101101: Cancelamento {
                    x_desc: EVENT_DESCRIPTION,
                    c_motivo: REASON_CODE,
                    x_motivo: justification.to_string(),
                },
            },
        }
    }

    pub fn id(&self) -> &str {
        &self.inf.id
    }
}

impl Signable for CancellationEvent {
    fn root_element(&self) -> &'static str {
        "pedRegEvento"
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn reference_id(&self) -> &str {
        &self.inf.id
    }

    fn content_xml(&self) -> xmldsig::Result<String> {
        Ok(quick_xml::se::to_string_with_root("infPedReg", &self.inf)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::pki::test_certs::generate_test_identity;
    use crate::xmldsig::{XmlSigner, verify};

    const KEY: &str = "35503082211222333000181000000000000125030000000001";

    fn event() -> CancellationEvent {
        let brt = FixedOffset::west_opt(3 * 3600).unwrap();
        CancellationEvent::new(
            "1.00",
            2,
            "11222333000181",
            KEY,
            "Valor informado incorretamente",
            brt.with_ymd_and_hms(2025, 3, 11, 9, 0, 0).unwrap(),
        )
    }

    #[test]
    fn test_event_identifier() {
        let event = event();
        assert_eq!(event.id(), format!("PRE{KEY}101101001"));
    }

    #[test]
    fn test_content_block() {
        let xml = event().content_xml().unwrap();
        assert!(xml.starts_with(&format!("<infPedReg Id=\"PRE{KEY}101101001\">")));
        assert!(xml.contains("<dhEvento>2025-03-11T09:00:00-03:00</dhEvento>"));
        assert!(xml.contains("<e101101><xDesc>Cancelamento de NFS-e</xDesc><cMotivo>1</cMotivo>"));
    }

    #[test]
    fn test_signed_event_verifies() {
        let identity = generate_test_identity("ACME", "pw").unwrap();
        let signer = XmlSigner::new(&identity.certificate_pem, &identity.private_key_pem).unwrap();

        let signed = signer.sign(&event()).unwrap();
        assert!(signed.contains("<pedRegEvento xmlns=\"http://www.sped.fazenda.gov.br/nfse\" versao=\"1.00\">"));
        let report = verify(&signed);
        assert!(report.valid, "{:?}", report.diagnostics);
    }
}
