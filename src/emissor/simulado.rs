use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rand::Rng;
use tracing::info;

use super::{CancelOutcome, ConsultOutcome, EmitOutcome, Emissor, Situation, TransmissionError};
use crate::domain::dps::brasilia;
use crate::domain::models::Company;
use crate::pki::Credentials;
use crate::xmldsig::{self, element_text, ns};

/// Ambiente gerador of the simulated authority.
const SIMULATED_GENERATOR: u8 = 2;

#[derive(Debug, Clone)]
struct SimulatedNfse {
    number: u64,
    protocol: String,
    xml: String,
    cancelled: bool,
}

/// In-process authority for sandbox companies.
///
/// Checks the signature like the real service does, numbers authorized
/// invoices sequentially and remembers them for consult and cancel.
#[derive(Debug, Default)]
pub struct SimuladoEmissor {
    invoices: DashMap<String, SimulatedNfse>,
    dps_seen: DashMap<String, String>,
    sequence: AtomicU64,
}

impl SimuladoEmissor {
    pub fn new() -> Self {
        Self::default()
    }

    fn rendered_artifact(access_key: &str, nfse: &SimulatedNfse) -> Vec<u8> {
        format!(
            "%PDF-1.4\n% DANFSe simulado\n% chave {access_key}\n% numero {}\n%%EOF\n",
            nfse.number
        )
        .into_bytes()
    }
}

/// 50 digit access key: cLocEmi(7) ambGer(1) tpInsc(1) inscFed(14)
/// nNFSe(13) AAMM(4) cNum(9) DV(1).
fn access_key(municipality: &str, cnpj: &str, number: u64) -> String {
    let period = Utc::now().with_timezone(&brasilia()).format("%y%m");
    let random: u32 = rand::rng().random_range(0..1_000_000_000);
    let body = format!(
        "{municipality:0>7}{SIMULATED_GENERATOR}2{cnpj:0>14}{number:013}{period}{random:09}"
    );
    format!("{body}{}", check_digit(&body))
}

/// Modulo 11 with weights 2..9 from the right.
fn check_digit(digits: &str) -> u32 {
    let sum: u32 = digits
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| d * (2 + (i as u32 % 8)))
        .sum();
    match 11 - sum % 11 {
        10 | 11 => 0,
        dv => dv,
    }
}

fn read(xml: &str, name: &str) -> Option<String> {
    element_text(xml, name).ok().flatten()
}

#[async_trait]
impl Emissor for SimuladoEmissor {
    async fn emit(
        &self,
        signed_xml: &str,
        company: &Company,
        _credentials: &Credentials,
    ) -> Result<EmitOutcome, TransmissionError> {
        let report = xmldsig::verify(signed_xml);
        if !report.valid {
            let reasons: Vec<String> = report.diagnostics.iter().map(ToString::to_string).collect();
            return Ok(EmitOutcome::rejected(
                format!("E0714: assinatura inválida ({})", reasons.join("; ")),
                None,
            ));
        }

        let (Some(municipality), Some(serie), Some(n_dps)) = (
            read(signed_xml, "cLocEmi"),
            read(signed_xml, "serie"),
            read(signed_xml, "nDPS"),
        ) else {
            return Ok(EmitOutcome::rejected("E0001: DPS incompleta", None));
        };

        let dps_key = format!("{}:{serie}:{n_dps}", company.cnpj);
        let (number, key) = match self.dps_seen.entry(dps_key) {
            Entry::Occupied(existing) => {
                return Ok(EmitOutcome::rejected(
                    format!("E0014: DPS já utilizada pela NFS-e {}", existing.get()),
                    None,
                ));
            }
            Entry::Vacant(slot) => {
                let number = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
                let key = access_key(&municipality, &company.cnpj, number);
                slot.insert(key.clone());
                (number, key)
            }
        };

        let protocol = format!("{number:015}");
        let dps = signed_xml
            .split_once("?>")
            .map_or(signed_xml, |(_, rest)| rest);
        let xml = format!(
            concat!(
                r#"<NFSe xmlns="{ns}" versao="{version}"><infNFSe Id="NFS{key}">"#,
                "<nNFSe>{number}</nNFSe><nDFSe>{protocol}</nDFSe><chNFSe>{key}</chNFSe>",
                "{dps}</infNFSe></NFSe>"
            ),
            ns = ns::NFSE,
            version = quick_xml::escape::escape(&company.api_version),
            key = key,
            number = number,
            protocol = protocol,
            dps = dps,
        );

        self.invoices.insert(
            key.clone(),
            SimulatedNfse {
                number,
                protocol: protocol.clone(),
                xml: xml.clone(),
                cancelled: false,
            },
        );
        info!(access_key = %key, number, "Simulated authorization");

        Ok(EmitOutcome {
            success: true,
            access_key: Some(key),
            protocol: Some(protocol),
            nfse_number: Some(number.to_string()),
            distribution_xml: Some(xml),
            rejection_reason: None,
            raw_response: None,
        })
    }

    async fn consult(
        &self,
        access_key: &str,
        _company: &Company,
        _credentials: &Credentials,
    ) -> Result<ConsultOutcome, TransmissionError> {
        let Some(nfse) = self.invoices.get(access_key) else {
            return Ok(ConsultOutcome::situation(Situation::Processando));
        };

        let situation = if nfse.cancelled {
            Situation::Cancelada
        } else {
            Situation::Autorizada
        };
        Ok(ConsultOutcome {
            success: true,
            situation,
            protocol: Some(nfse.protocol.clone()),
            distribution_xml: Some(nfse.xml.clone()),
            rendered_artifact: Some(Self::rendered_artifact(access_key, &nfse)),
            assigned_number: Some(nfse.number.to_string()),
            reason: None,
        })
    }

    async fn cancel(
        &self,
        access_key: &str,
        _protocol: &str,
        _justification: &str,
        _company: &Company,
        _credentials: &Credentials,
    ) -> Result<CancelOutcome, TransmissionError> {
        let refused = |reason: &str| CancelOutcome {
            success: false,
            reason: Some(reason.to_string()),
            raw_response: None,
        };

        let Some(mut nfse) = self.invoices.get_mut(access_key) else {
            return Ok(refused("E1220: NFS-e não encontrada"));
        };
        if nfse.cancelled {
            return Ok(refused("E1235: NFS-e já cancelada"));
        }
        nfse.cancelled = true;
        info!(access_key, "Simulated cancellation");

        Ok(CancelOutcome {
            success: true,
            reason: None,
            raw_response: None,
        })
    }
}
