use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::event::{CANCELLATION_EVENT, CancellationEvent};
use super::transport::{HttpReply, HttpTransport, TransportSettings};
use super::{CancelOutcome, ConsultOutcome, EmitOutcome, Emissor, Situation, TransmissionError};
use crate::artifact;
use crate::domain::dps::brasilia;
use crate::domain::models::Company;
use crate::pki::Credentials;
use crate::xmldsig::{XmlSigner, element_text};

/// Base URLs of the national API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NacionalEndpoints {
    /// SEFIN Nacional: emission, consult and events
    pub sefin: String,
    /// ADN: DANFSe rendering
    pub adn: String,
}

impl NacionalEndpoints {
    pub fn new(sefin: impl Into<String>, adn: impl Into<String>) -> Self {
        Self {
            sefin: sefin.into().trim_end_matches('/').to_string(),
            adn: adn.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn production() -> Self {
        Self::new(
            "https://sefin.nfse.gov.br/SefinNacional",
            "https://adn.nfse.gov.br",
        )
    }

    pub fn restricted() -> Self {
        Self::new(
            "https://sefin.producaorestrita.nfse.gov.br/SefinNacional",
            "https://adn.producaorestrita.nfse.gov.br",
        )
    }
}

/// Body of a successful emission or consult.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NfseResponse {
    chave_acesso: Option<String>,
    #[serde(rename = "nfseXmlGZipB64")]
    nfse_xml_g_zip_b64: Option<String>,
    protocolo: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default, alias = "Erros")]
    erros: Vec<RemoteError>,
    #[serde(default, alias = "Mensagem", alias = "message")]
    mensagem: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    #[serde(default, alias = "Codigo")]
    codigo: Option<String>,
    #[serde(default, alias = "Descricao")]
    descricao: Option<String>,
    #[serde(default, alias = "Complemento")]
    complemento: Option<String>,
}

/// Human readable reason out of an error body.
fn rejection_reason(reply: &HttpReply) -> String {
    let parsed: ErrorResponse = serde_json::from_slice(&reply.body).unwrap_or_default();
    let reasons: Vec<String> = parsed
        .erros
        .iter()
        .map(|e| {
            let mut reason = match (&e.codigo, &e.descricao) {
                (Some(code), Some(text)) => format!("{code}: {text}"),
                (Some(code), None) => code.clone(),
                (None, Some(text)) => text.clone(),
                (None, None) => String::new(),
            };
            if let Some(extra) = &e.complemento {
                reason.push_str(&format!(" ({extra})"));
            }
            reason
        })
        .filter(|r| !r.is_empty())
        .collect();

    if !reasons.is_empty() {
        reasons.join("; ")
    } else if let Some(message) = parsed.mensagem {
        message
    } else {
        format!("HTTP {}: {}", reply.status.as_u16(), reply.text())
    }
}

fn unexpected(reply: &HttpReply) -> TransmissionError {
    TransmissionError::Status {
        status: reply.status.as_u16(),
        body: reply.text(),
    }
}

/// Consult answers that carry no NFS-e body.
///
/// An authentication failure says nothing about the document and must not
/// read as a rejection.
fn consult_without_document(
    reply: &HttpReply,
) -> Result<Option<ConsultOutcome>, TransmissionError> {
    match reply.status {
        StatusCode::NOT_FOUND => Ok(Some(ConsultOutcome::situation(Situation::Processando))),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(unexpected(reply)),
        status if status.is_client_error() => {
            let mut outcome = ConsultOutcome::situation(Situation::Rejeitada);
            outcome.reason = Some(rejection_reason(reply));
            Ok(Some(outcome))
        }
        status if !status.is_success() => Err(unexpected(reply)),
        _ => Ok(None),
    }
}

fn parse_nfse(reply: &HttpReply) -> Result<NfseResponse, TransmissionError> {
    serde_json::from_slice(&reply.body)
        .map_err(|e| TransmissionError::InvalidResponse(e.to_string()))
}

/// Unpacks the authorized document and reads the numbers it carries.
struct AuthorizedNfse {
    xml: Option<String>,
    number: Option<String>,
    dfe_number: Option<String>,
}

impl AuthorizedNfse {
    fn from_packed(packed: Option<&str>) -> Result<Self, TransmissionError> {
        let Some(packed) = packed else {
            return Ok(Self {
                xml: None,
                number: None,
                dfe_number: None,
            });
        };
        let xml = artifact::unpack_text(packed)
            .map_err(|e| TransmissionError::InvalidResponse(e.to_string()))?;
        let read = |name: &str| element_text(&xml, name).ok().flatten();
        Ok(Self {
            number: read("nNFSe"),
            dfe_number: read("nDFSe"),
            xml: Some(xml),
        })
    }
}

/// Client of the national API (SEFIN Nacional and ADN).
#[derive(Debug, Clone)]
pub struct NacionalEmissor {
    endpoints: NacionalEndpoints,
    settings: TransportSettings,
}

impl NacionalEmissor {
    pub fn new(endpoints: NacionalEndpoints, settings: TransportSettings) -> Self {
        Self {
            endpoints,
            settings,
        }
    }

    pub fn endpoints(&self) -> &NacionalEndpoints {
        &self.endpoints
    }

    fn transport(&self, credentials: &Credentials) -> Result<HttpTransport, TransmissionError> {
        HttpTransport::new(&self.settings, Some(credentials))
    }

    async fn has_cancellation_event(
        &self,
        transport: &HttpTransport,
        access_key: &str,
    ) -> Result<bool, TransmissionError> {
        let url = format!(
            "{}/nfse/{access_key}/eventos/{CANCELLATION_EVENT}/1",
            self.endpoints.sefin
        );
        let reply = transport.get(&url).await?;
        match reply.status {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(unexpected(&reply)),
        }
    }

    /// DANFSe rendering; missing or failing renderings are not fatal.
    async fn rendered_artifact(
        &self,
        transport: &HttpTransport,
        access_key: &str,
    ) -> Option<Vec<u8>> {
        let url = format!("{}/danfse/{access_key}", self.endpoints.adn);
        match transport.get(&url).await {
            Ok(reply) if reply.status.is_success() && !reply.body.is_empty() => Some(reply.body),
            Ok(reply) => {
                debug!(status = %reply.status, "DANFSe not available");
                None
            }
            Err(e) => {
                warn!(error = %e, "DANFSe download failed");
                None
            }
        }
    }
}

#[async_trait]
impl Emissor for NacionalEmissor {
    #[instrument(skip_all, fields(company_id = %company.id))]
    async fn emit(
        &self,
        signed_xml: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<EmitOutcome, TransmissionError> {
        let transport = self.transport(credentials)?;
        let packed =
            artifact::pack(signed_xml).map_err(|e| TransmissionError::Request(e.to_string()))?;

        let reply = transport
            .post_json(
                &format!("{}/nfse", self.endpoints.sefin),
                &json!({ "dpsXmlGZipB64": packed }),
            )
            .await?;

        if reply.status.is_client_error() {
            let reason = rejection_reason(&reply);
            info!(%reason, "DPS rejected");
            return Ok(EmitOutcome::rejected(reason, Some(reply.text())));
        }
        if !reply.status.is_success() {
            return Err(unexpected(&reply));
        }

        let body = parse_nfse(&reply)?;
        let nfse = AuthorizedNfse::from_packed(body.nfse_xml_g_zip_b64.as_deref())?;
        let Some(access_key) = body.chave_acesso else {
            return Err(TransmissionError::InvalidResponse(
                "authorization without chaveAcesso".into(),
            ));
        };
        info!(%access_key, "NFS-e authorized");

        Ok(EmitOutcome {
            success: true,
            access_key: Some(access_key),
            protocol: body.protocolo.or(nfse.dfe_number),
            nfse_number: nfse.number,
            distribution_xml: nfse.xml,
            rejection_reason: None,
            raw_response: Some(reply.text()),
        })
    }

    #[instrument(skip_all, fields(company_id = %company.id, access_key = %access_key))]
    async fn consult(
        &self,
        access_key: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<ConsultOutcome, TransmissionError> {
        let transport = self.transport(credentials)?;
        let reply = transport
            .get(&format!("{}/nfse/{access_key}", self.endpoints.sefin))
            .await?;

        if let Some(outcome) = consult_without_document(&reply)? {
            return Ok(outcome);
        }

        let body = parse_nfse(&reply)?;
        let nfse = AuthorizedNfse::from_packed(body.nfse_xml_g_zip_b64.as_deref())?;
        let situation = if self.has_cancellation_event(&transport, access_key).await? {
            Situation::Cancelada
        } else {
            Situation::Autorizada
        };
        debug!(?situation, "Remote situation");

        Ok(ConsultOutcome {
            success: true,
            situation,
            protocol: body.protocolo.or(nfse.dfe_number),
            distribution_xml: nfse.xml,
            rendered_artifact: self.rendered_artifact(&transport, access_key).await,
            assigned_number: nfse.number,
            reason: None,
        })
    }

    #[instrument(skip_all, fields(company_id = %company.id, access_key = %access_key))]
    async fn cancel(
        &self,
        access_key: &str,
        protocol: &str,
        justification: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<CancelOutcome, TransmissionError> {
        let event = CancellationEvent::new(
            &company.api_version,
            company.environment.tp_amb(),
            &company.cnpj,
            access_key,
            justification,
            Utc::now().with_timezone(&brasilia()),
        );
        let signer = XmlSigner::new(
            credentials.certificate_pem(),
            credentials.private_key_pem().expose_secret(),
        )
        .map_err(|e| TransmissionError::Request(e.to_string()))?;
        let signed = signer
            .sign(&event)
            .map_err(|e| TransmissionError::Request(e.to_string()))?;
        let packed =
            artifact::pack(&signed).map_err(|e| TransmissionError::Request(e.to_string()))?;

        debug!(protocol, event_id = event.id(), "Sending cancellation event");
        let transport = self.transport(credentials)?;
        let reply = transport
            .post_json(
                &format!("{}/nfse/{access_key}/eventos", self.endpoints.sefin),
                &json!({ "pedidoRegistroEventoXmlGZipB64": packed }),
            )
            .await?;

        if reply.status.is_success() {
            info!("Cancellation registered");
            return Ok(CancelOutcome {
                success: true,
                reason: None,
                raw_response: Some(reply.text()),
            });
        }
        if reply.status.is_client_error() {
            return Ok(CancelOutcome {
                success: false,
                reason: Some(rejection_reason(&reply)),
                raw_response: Some(reply.text()),
            });
        }
        Err(unexpected(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: u16, body: &str) -> HttpReply {
        HttpReply {
            status: StatusCode::from_u16(status).unwrap(),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_endpoints_trim_trailing_slash() {
        let endpoints = NacionalEndpoints::new("https://sefin.local/", "https://adn.local//");
        assert_eq!(endpoints.sefin, "https://sefin.local");
        assert_eq!(endpoints.adn, "https://adn.local");
    }

    #[test]
    fn test_rejection_reason_from_error_list() {
        let body = r#"{"erros":[{"Codigo":"E0014","Descricao":"DPS já utilizada"},
                                {"codigo":"E0312","descricao":"CEP inválido","complemento":"tomador"}]}"#;
        assert_eq!(
            rejection_reason(&reply(400, body)),
            "E0014: DPS já utilizada; E0312: CEP inválido (tomador)"
        );
    }

    #[test]
    fn test_rejection_reason_fallbacks() {
        assert_eq!(
            rejection_reason(&reply(400, r#"{"mensagem":"Certificado não autorizado"}"#)),
            "Certificado não autorizado"
        );
        assert_eq!(rejection_reason(&reply(403, "forbidden")), "HTTP 403: forbidden");
    }

    #[test]
    fn test_consult_status_mapping() {
        let pending = consult_without_document(&reply(404, "")).unwrap().unwrap();
        assert_eq!(pending.situation, Situation::Processando);

        let rejected = consult_without_document(&reply(400, r#"{"mensagem":"Chave inválida"}"#))
            .unwrap()
            .unwrap();
        assert_eq!(rejected.situation, Situation::Rejeitada);
        assert_eq!(rejected.reason.as_deref(), Some("Chave inválida"));

        for status in [401, 403, 500] {
            let err = consult_without_document(&reply(status, "denied")).unwrap_err();
            assert!(matches!(err, TransmissionError::Status { status: s, .. } if s == status));
        }

        assert!(consult_without_document(&reply(200, "{}")).unwrap().is_none());
    }

    #[test]
    fn test_authorized_nfse_numbers() {
        let xml = concat!(
            r#"<NFSe xmlns="http://www.sped.fazenda.gov.br/nfse"><infNFSe Id="NFS1">"#,
            "<nNFSe>125</nNFSe><nDFSe>998877</nDFSe></infNFSe></NFSe>"
        );
        let packed = artifact::pack(xml).unwrap();

        let nfse = AuthorizedNfse::from_packed(Some(&packed)).unwrap();
        assert_eq!(nfse.number.as_deref(), Some("125"));
        assert_eq!(nfse.dfe_number.as_deref(), Some("998877"));
        assert_eq!(nfse.xml.as_deref(), Some(xml));
    }

    #[test]
    fn test_emission_body_field_names() {
        let body: NfseResponse = serde_json::from_str(
            r#"{"chaveAcesso":"KEY","nfseXmlGZipB64":"H4sI","idDps":"DPS1"}"#,
        )
        .unwrap();
        assert_eq!(body.chave_acesso.as_deref(), Some("KEY"));
        assert_eq!(body.nfse_xml_g_zip_b64.as_deref(), Some("H4sI"));
        assert!(body.protocolo.is_none());
    }
}
