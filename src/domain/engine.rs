//! Sale and invoice lifecycle.
//!
//! ```text
//! Invoice  RASCUNHO -> PROCESSANDO -> AUTORIZADA | ERRO      AUTORIZADA -> CANCELADA
//! Sale     PENDENTE -> PROCESSANDO -> AUTORIZADA | ERRO_EMISSAO -> CANCELADA
//! ```
//!
//! Every emission attempt is a new invoice. Nothing is retried behind the
//! operator's back: the only automatic repair is the consult that precedes
//! each cancellation.


use std::sync::Arc;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{DisabledPortal, NoopHooks, UnlimitedPlan};
use crate::artifact;
use crate::domain::dps::DocumentBuilder;
use crate::domain::errors::{NfseError, ReconciliationError, ValidationError};
use crate::domain::models::{
    Client, Company, Invoice, InvoiceStatus, NewLogEntry, SIGNED_XML_DETAIL, Sale,
    SaleCorrections, SaleStatus, StoredCertificate, actions,
};
use crate::domain::ports::{
    LifecycleHooks, LimitDecision, LogSink, PlanAction, PlanOracle, PortalRenderer, TaxLookup,
};
use crate::emissor::{ConsultOutcome, EmissorFactory, Situation};
use crate::pki::{self, CertificateError, CertificateSummary, Credentials};
use crate::store::Store;
use crate::vault::CredentialVault;
use crate::xmldsig::{self, VerificationReport, XmlSigner};

const JUSTIFICATION_CHARS: std::ops::RangeInclusive<usize> = 15..=255;

/// Result of an operator-invoked consult.
#[derive(Debug, Clone, Serialize)]
pub struct ConsultReport {
    pub situation: Situation,
    pub invoice: Invoice,
}

/// Where a verified payload came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    Invoice,
    Log,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignatureDiagnosis {
    pub source: PayloadSource,
    pub invoice_id: Option<Uuid>,
    pub report: VerificationReport,
}

/// Everything needed to transmit one attempt.
struct PreparedAttempt {
    invoice: Invoice,
    signed_xml: String,
    credentials: Credentials,
}

/// Drives sales through emission, consult and cancellation.
#[derive(Clone)]
pub struct ReconciliationEngine {
    vault: Arc<CredentialVault>,
    store: Arc<dyn Store>,
    logs: Arc<dyn LogSink>,
    builder: DocumentBuilder,
    emissors: Arc<dyn EmissorFactory>,
    plan: Arc<dyn PlanOracle>,
    portal: Arc<dyn PortalRenderer>,
    hooks: Arc<dyn LifecycleHooks>,
}

impl ReconciliationEngine {
    /// Engine with an unlimited plan, no portal fallback and no hooks.
    pub fn new(
        vault: Arc<CredentialVault>,
        store: Arc<dyn Store>,
        logs: Arc<dyn LogSink>,
        tax: Arc<dyn TaxLookup>,
        emissors: Arc<dyn EmissorFactory>,
    ) -> Self {
        Self {
            vault,
            store,
            logs,
            builder: DocumentBuilder::new(tax),
            emissors,
            plan: Arc::new(UnlimitedPlan),
            portal: Arc::new(DisabledPortal),
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_plan(mut self, plan: Arc<dyn PlanOracle>) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_portal(mut self, portal: Arc<dyn PortalRenderer>) -> Self {
        self.portal = portal;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// First emission of a pending sale.
    ///
    /// Returns the attempt invoice, authorized or in error. Failures before
    /// transmission leave the sale pending and create no invoice.
    #[instrument(skip(self), fields(sale_id = %sale_id))]
    pub async fn emit(&self, user_id: &str, sale_id: Uuid) -> Result<Invoice, NfseError> {
        let mut sale = self.sale(sale_id).await?;
        let company = self.owned_company(user_id, sale.company_id).await?;
        expect_status(&sale, SaleStatus::Pendente, "PENDENTE")?;
        let decision = self.check_plan(user_id, PlanAction::Emitir).await?;
        let client = self.client(sale.client_id).await?;

        let prepared = match self.prepare_attempt(&sale, &company, &client).await {
            Ok(prepared) => prepared,
            Err(e) => {
                self.log_pre_transmission_failure(&sale, actions::EMISSAO, &e)
                    .await?;
                return Err(e);
            }
        };

        self.transmit(&mut sale, &company, prepared, &decision, actions::EMISSAO)
            .await
    }

    /// New attempt for a sale whose last emission failed.
    #[instrument(skip(self, corrections), fields(sale_id = %sale_id))]
    pub async fn retry(
        &self,
        user_id: &str,
        sale_id: Uuid,
        corrections: Option<SaleCorrections>,
    ) -> Result<Invoice, NfseError> {
        let mut sale = self.sale(sale_id).await?;
        let company = self.owned_company(user_id, sale.company_id).await?;
        expect_status(&sale, SaleStatus::ErroEmissao, "ERRO_EMISSAO")?;
        let decision = self.check_plan(user_id, PlanAction::Emitir).await?;
        let client = self.client(sale.client_id).await?;

        if let Some(corrections) = corrections.filter(|c| !c.is_empty()) {
            corrections.apply(&mut sale);
        }
        self.logs
            .append(
                NewLogEntry::info(actions::REENVIO_MANUAL, "Manual re-submission requested")
                    .for_sale(&sale),
            )
            .await?;
        sale.set_status(SaleStatus::Processando);
        self.store.save_sale(&sale).await?;

        let prepared = match self.prepare_attempt(&sale, &company, &client).await {
            Ok(prepared) => prepared,
            Err(e) => {
                sale.set_status(SaleStatus::ErroEmissao);
                self.store.save_sale(&sale).await?;
                self.log_pre_transmission_failure(&sale, actions::REENVIO_MANUAL, &e)
                    .await?;
                return Err(e);
            }
        };

        self.transmit(&mut sale, &company, prepared, &decision, actions::REENVIO_MANUAL)
            .await
    }

    /// Applies corrections to a failed sale and puts it back to pending.
    /// Existing invoices are left as they are.
    #[instrument(skip(self, corrections), fields(sale_id = %sale_id))]
    pub async fn correct_and_resubmit(
        &self,
        user_id: &str,
        sale_id: Uuid,
        corrections: SaleCorrections,
    ) -> Result<Sale, NfseError> {
        let mut sale = self.sale(sale_id).await?;
        self.owned_company(user_id, sale.company_id).await?;
        expect_status(&sale, SaleStatus::ErroEmissao, "ERRO_EMISSAO")?;

        let mut errors = ValidationError::new();
        if corrections.amount.is_some_and(|a| a <= rust_decimal::Decimal::ZERO) {
            errors.push("valor", "must be greater than zero");
        }
        if corrections
            .description
            .as_deref()
            .is_some_and(|d| d.trim().is_empty())
        {
            errors.push("descricao", "is required");
        }
        errors.into_result()?;

        corrections.apply(&mut sale);
        sale.set_status(SaleStatus::Pendente);
        self.store.save_sale(&sale).await?;
        self.logs
            .append(
                NewLogEntry::info(actions::CORRECAO, "Sale corrected and back to pending")
                    .for_sale(&sale)
                    .details(json!({ "corrections": corrections })),
            )
            .await?;
        Ok(sale)
    }

    /// Mirrors the authority's view of the latest keyed invoice.
    #[instrument(skip(self), fields(sale_id = %sale_id))]
    pub async fn consult(&self, user_id: &str, sale_id: Uuid) -> Result<ConsultReport, NfseError> {
        let mut sale = self.sale(sale_id).await?;
        let company = self.owned_company(user_id, sale.company_id).await?;
        self.check_plan(user_id, PlanAction::Visualizar).await?;
        let mut invoice = self.keyed_invoice(sale.id).await?;
        let access_key = keyed(&invoice)?;

        let credentials = self.credentials(&company)?;
        let emissor = self.emissors.for_company(&company);
        let outcome = emissor.consult(&access_key, &company, &credentials).await?;

        self.mirror(&mut sale, &mut invoice, &outcome).await?;
        self.logs
            .append(
                NewLogEntry::info(
                    actions::CONSULTA,
                    format!("Authority reports {:?}", outcome.situation),
                )
                .for_sale(&sale)
                .details(json!({ "access_key": access_key, "outcome": outcome })),
            )
            .await?;

        Ok(ConsultReport {
            situation: outcome.situation,
            invoice,
        })
    }

    /// Cancels the authorized invoice of a sale.
    ///
    /// The authority is consulted exactly once first: an invoice already
    /// cancelled there is mirrored without a second request, and a protocol
    /// missing locally is recovered and stored before cancelling.
    #[instrument(skip(self, justification), fields(sale_id = %sale_id))]
    pub async fn cancel(
        &self,
        user_id: &str,
        sale_id: Uuid,
        justification: &str,
    ) -> Result<Invoice, NfseError> {
        let mut sale = self.sale(sale_id).await?;
        let company = self.owned_company(user_id, sale.company_id).await?;
        self.check_plan(user_id, PlanAction::Visualizar).await?;

        let justification = justification.trim();
        if !JUSTIFICATION_CHARS.contains(&justification.chars().count()) {
            return Err(ValidationError::single(
                "justificativa",
                "must have between 15 and 255 characters",
            )
            .into());
        }
        expect_status(&sale, SaleStatus::Autorizada, "AUTORIZADA")?;
        let mut invoice = self.keyed_invoice(sale.id).await?;
        let access_key = keyed(&invoice)?;

        let credentials = self.credentials(&company)?;
        let emissor = self.emissors.for_company(&company);
        let remote = emissor.consult(&access_key, &company, &credentials).await?;

        match remote.situation {
            Situation::Cancelada => {
                info!(%access_key, "Already cancelled at the authority, mirroring");
                self.mark_cancelled(&mut sale, &mut invoice).await?;
                self.logs
                    .append(
                        NewLogEntry::warn(
                            actions::CANCELAMENTO,
                            "Invoice was already cancelled at the authority",
                        )
                        .for_sale(&sale)
                        .details(json!({ "access_key": access_key })),
                    )
                    .await?;
                return Ok(invoice);
            }
            Situation::Rejeitada => {
                return Err(ReconciliationError::RemoteRejected {
                    reason: remote.reason.unwrap_or_else(|| "no reason given".into()),
                }
                .into());
            }
            Situation::Processando => return Err(ReconciliationError::NotYetAuthorized.into()),
            Situation::Autorizada => {}
        }

        let protocol = match (invoice.protocol.clone(), remote.protocol) {
            (Some(local), _) => local,
            (None, Some(recovered)) => {
                warn!(%access_key, protocol = %recovered, "Protocol recovered from the authority");
                invoice.protocol = Some(recovered.clone());
                invoice.updated_at = Utc::now();
                self.store.save_invoice(&invoice).await?;
                self.logs
                    .append(
                        NewLogEntry::warn(
                            actions::CANCELAMENTO,
                            "Protocol recovered from the authority",
                        )
                        .for_sale(&sale)
                        .details(json!({ "protocol": recovered })),
                    )
                    .await?;
                recovered
            }
            (None, None) => {
                self.logs
                    .append(
                        NewLogEntry::error(
                            actions::CANCELAMENTO,
                            "No protocol recorded locally or at the authority",
                        )
                        .for_sale(&sale),
                    )
                    .await?;
                return Err(ReconciliationError::MissingProtocol.into());
            }
        };

        let outcome = match emissor
            .cancel(&access_key, &protocol, justification, &company, &credentials)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                self.logs
                    .append(
                        NewLogEntry::error(actions::CANCELAMENTO, e.to_string())
                            .for_sale(&sale)
                            .details(json!({ "access_key": access_key })),
                    )
                    .await?;
                return Err(e.into());
            }
        };

        if !outcome.success {
            let reason = outcome.reason.unwrap_or_else(|| "no reason given".into());
            self.logs
                .append(
                    NewLogEntry::error(
                        actions::CANCELAMENTO,
                        format!("Cancellation refused: {reason}"),
                    )
                    .for_sale(&sale)
                    .details(json!({ "response": outcome.raw_response })),
                )
                .await?;
            return Err(NfseError::CancellationRefused { reason });
        }

        self.mark_cancelled(&mut sale, &mut invoice).await?;
        self.logs
            .append(
                NewLogEntry::info(actions::CANCELAMENTO, "Invoice cancelled")
                    .for_sale(&sale)
                    .details(json!({ "access_key": access_key, "justification": justification })),
            )
            .await?;
        Ok(invoice)
    }

    /// Verifies the payload sent for the sale's latest attempt.
    ///
    /// Uses the invoice's signed XML, or the newest log entry that carries
    /// one for rows older than that field.
    #[instrument(skip(self), fields(sale_id = %sale_id))]
    pub async fn diagnose_signature(
        &self,
        user_id: &str,
        sale_id: Uuid,
    ) -> Result<SignatureDiagnosis, NfseError> {
        let sale = self.sale(sale_id).await?;
        self.owned_company(user_id, sale.company_id).await?;

        let invoices = self.store.invoices_for_sale(sale_id).await?;
        if let Some(invoice) = invoices.iter().rev().find(|i| i.signed_xml.is_some()) {
            let xml = artifact::unpack_text(invoice.signed_xml.as_deref().unwrap_or_default())?;
            return Ok(SignatureDiagnosis {
                source: PayloadSource::Invoice,
                invoice_id: Some(invoice.id),
                report: xmldsig::verify(&xml),
            });
        }

        let entries = self.logs.entries_for_sale(sale_id).await?;
        let payload = entries
            .iter()
            .rev()
            .find_map(|entry| entry.details.get(SIGNED_XML_DETAIL)?.as_str());
        let Some(payload) = payload else {
            return Err(NfseError::not_found("signed document for sale", sale_id));
        };

        let xml = artifact::unpack_text(payload)?;
        Ok(SignatureDiagnosis {
            source: PayloadSource::Log,
            invoice_id: None,
            report: xmldsig::verify(&xml),
        })
    }

    /// The rendered DANFSe of an invoice.
    ///
    /// Stored copy first, then the authority, then the portal fallback.
    /// Whatever is fetched is stored for the next call.
    #[instrument(skip(self), fields(invoice_id = %invoice_id))]
    pub async fn download_artifact(
        &self,
        user_id: &str,
        invoice_id: Uuid,
    ) -> Result<Vec<u8>, NfseError> {
        let mut invoice = self
            .store
            .invoice(invoice_id)
            .await?
            .ok_or_else(|| NfseError::not_found("invoice", invoice_id))?;
        let company = self.owned_company(user_id, invoice.company_id).await?;
        self.check_plan(user_id, PlanAction::Visualizar).await?;

        if let Some(stored) = &invoice.rendered_artifact {
            return Ok(artifact::unpack(stored)?);
        }
        let access_key = keyed(&invoice)?;

        let (pfx, password) = self.decrypt_certificate(&company)?;
        let credentials = pki::extract(pfx.expose_secret(), password.expose_secret())?;
        let emissor = self.emissors.for_company(&company);

        let from_authority = match emissor.consult(&access_key, &company, &credentials).await {
            Ok(outcome) => outcome.rendered_artifact,
            Err(e) => {
                warn!(error = %e, "Consult for the rendered document failed, trying the portal");
                None
            }
        };

        let (document, source) = match from_authority {
            Some(document) => (document, "authority"),
            None => (
                self.portal
                    .download_official_artifact(&access_key, &pfx, &password)
                    .await?,
                "portal",
            ),
        };

        invoice.rendered_artifact = Some(artifact::pack(&document)?);
        invoice.updated_at = Utc::now();
        self.store.save_invoice(&invoice).await?;
        self.logs
            .append(
                NewLogEntry::info(actions::DOWNLOAD, format!("DANFSe fetched from the {source}"))
                    .for_company(company.id)
                    .details(json!({ "invoice_id": invoice.id, "access_key": access_key })),
            )
            .await?;
        Ok(document)
    }

    /// Validates and stores a company certificate, encrypted.
    #[instrument(skip(self, pfx_base64, password), fields(company_id = %company_id))]
    pub async fn register_certificate(
        &self,
        user_id: &str,
        company_id: Uuid,
        pfx_base64: &SecretString,
        password: &SecretString,
    ) -> Result<CertificateSummary, NfseError> {
        let mut company = self.owned_company(user_id, company_id).await?;

        let credentials = pki::extract(pfx_base64.expose_secret(), password.expose_secret())?;
        let summary = credentials.summary()?;
        if summary.is_expired_at(Utc::now()) {
            return Err(CertificateError::Expired(summary.not_after).into());
        }

        company.certificate = Some(StoredCertificate {
            pfx: self.vault.encrypt(pfx_base64.expose_secret())?,
            password: self.vault.encrypt(password.expose_secret())?,
            subject: summary.subject.clone(),
            not_after: summary.not_after,
        });
        self.store.save_company(&company).await?;
        self.logs
            .append(
                NewLogEntry::info(actions::CERTIFICADO, "Certificate registered")
                    .for_company(company.id)
                    .details(json!({ "subject": summary.subject, "not_after": summary.not_after })),
            )
            .await?;
        info!(subject = %summary.subject, "Certificate registered");
        Ok(summary)
    }

    /// Build, number and sign. Nothing is persisted if this fails.
    async fn prepare_attempt(
        &self,
        sale: &Sale,
        company: &Company,
        client: &Client,
    ) -> Result<PreparedAttempt, NfseError> {
        let draft = self.builder.prepare(sale, company, client).await?;
        let credentials = self.credentials(company)?;
        let signer = XmlSigner::new(
            credentials.certificate_pem(),
            credentials.private_key_pem().expose_secret(),
        )?;

        let serie = draft.serie().to_string();
        let number = self.store.next_dps_number(company.id, &serie).await?;
        let dps = draft.into_dps(number, Utc::now());
        let signed_xml = signer.sign(&dps)?;

        let mut invoice = Invoice::draft(sale, dps.inf.id.clone(), serie, number);
        invoice.signed_xml = Some(artifact::pack(&signed_xml)?);
        Ok(PreparedAttempt {
            invoice,
            signed_xml,
            credentials,
        })
    }

    async fn transmit(
        &self,
        sale: &mut Sale,
        company: &Company,
        prepared: PreparedAttempt,
        decision: &LimitDecision,
        action: &str,
    ) -> Result<Invoice, NfseError> {
        let PreparedAttempt {
            mut invoice,
            signed_xml,
            credentials,
        } = prepared;

        invoice.set_status(InvoiceStatus::Processando);
        self.store.save_invoice(&invoice).await?;
        sale.set_status(SaleStatus::Processando);
        self.store.save_sale(sale).await?;

        let emissor = self.emissors.for_company(company);
        let outcome = match emissor.emit(&signed_xml, company, &credentials).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_attempt(sale, &mut invoice, action, &e.to_string(), None)
                    .await?;
                return Err(e.into());
            }
        };

        if !outcome.success {
            let reason = outcome
                .rejection_reason
                .clone()
                .unwrap_or_else(|| "rejected without a reason".into());
            self.fail_attempt(sale, &mut invoice, action, &reason, outcome.raw_response)
                .await?;
            return Ok(invoice);
        }

        let Some(access_key) = outcome.access_key.as_deref() else {
            let message = "authorization without an access key";
            self.fail_attempt(sale, &mut invoice, action, message, outcome.raw_response)
                .await?;
            return Err(crate::emissor::TransmissionError::InvalidResponse(message.into()).into());
        };
        invoice.assign_access_key(access_key)?;
        invoice.protocol = outcome.protocol.clone();
        invoice.nfse_number = outcome.nfse_number.clone();
        if let Some(xml) = &outcome.distribution_xml {
            invoice.distribution_xml = Some(artifact::pack(xml)?);
        }
        invoice.set_status(InvoiceStatus::Autorizada);
        self.store.save_invoice(&invoice).await?;
        sale.set_status(SaleStatus::Autorizada);
        self.store.save_sale(sale).await?;

        if let Some(history_id) = &decision.history_id {
            if let Err(e) = self.plan.increment_usage(history_id).await {
                warn!(error = %e, history_id, "Usage could not be recorded");
            }
        }

        self.logs
            .append(
                NewLogEntry::info(action, format!("NFS-e authorized with key {access_key}"))
                    .for_sale(sale)
                    .details(json!({
                        "invoice_id": invoice.id,
                        "access_key": access_key,
                        "protocol": invoice.protocol,
                        SIGNED_XML_DETAIL: invoice.signed_xml,
                    })),
            )
            .await?;
        info!(%access_key, "Sale authorized");
        self.hooks.on_authorized(sale, &invoice).await;
        Ok(invoice)
    }

    async fn fail_attempt(
        &self,
        sale: &mut Sale,
        invoice: &mut Invoice,
        action: &str,
        reason: &str,
        response: Option<String>,
    ) -> Result<(), NfseError> {
        warn!(dps_id = %invoice.dps_id, %reason, "Emission attempt failed");
        invoice.error_message = Some(reason.to_string());
        invoice.set_status(InvoiceStatus::Erro);
        self.store.save_invoice(invoice).await?;
        sale.set_status(SaleStatus::ErroEmissao);
        self.store.save_sale(sale).await?;

        self.logs
            .append(
                NewLogEntry::error(action, format!("Emission failed: {reason}"))
                    .for_sale(sale)
                    .details(json!({
                        "invoice_id": invoice.id,
                        "dps_id": invoice.dps_id,
                        "response": response,
                        SIGNED_XML_DETAIL: invoice.signed_xml,
                    })),
            )
            .await?;
        Ok(())
    }

    async fn log_pre_transmission_failure(
        &self,
        sale: &Sale,
        action: &str,
        error: &NfseError,
    ) -> Result<(), NfseError> {
        let details = match error {
            NfseError::Validation(v) => json!({ "fields": v.fields }),
            _ => serde_json::Value::Null,
        };
        self.logs
            .append(
                NewLogEntry::error(action, format!("Emission not attempted: {error}"))
                    .for_sale(sale)
                    .details(details),
            )
            .await?;
        Ok(())
    }

    /// Applies a consult to a keyed invoice.
    ///
    /// An access key is only assigned on authorization, so a remote
    /// rejection never demotes the invoice, and CANCELADA is never left.
    async fn mirror(
        &self,
        sale: &mut Sale,
        invoice: &mut Invoice,
        outcome: &ConsultOutcome,
    ) -> Result<(), NfseError> {
        match outcome.situation {
            Situation::Processando => return Ok(()),
            Situation::Cancelada => return self.mark_cancelled(sale, invoice).await,
            Situation::Rejeitada => {
                let reason = outcome
                    .reason
                    .clone()
                    .unwrap_or_else(|| "no reason given".into());
                warn!(
                    %reason,
                    status = ?invoice.status,
                    "Authority rejects an authorized invoice"
                );
                self.logs
                    .append(
                        NewLogEntry::warn(
                            actions::CONSULTA,
                            format!("Authority reports a rejection, local state kept: {reason}"),
                        )
                        .for_sale(sale)
                        .details(json!({ "invoice_id": invoice.id, "local": invoice.status })),
                    )
                    .await?;
                return Err(ReconciliationError::RemoteRejected { reason }.into());
            }
            Situation::Autorizada if invoice.status == InvoiceStatus::Cancelada => {
                warn!(
                    invoice_id = %invoice.id,
                    "Authority still reports a cancelled invoice as authorized"
                );
                self.logs
                    .append(
                        NewLogEntry::warn(
                            actions::CONSULTA,
                            "Authority reports AUTORIZADA for a cancelled invoice, kept",
                        )
                        .for_sale(sale)
                        .details(json!({ "invoice_id": invoice.id })),
                    )
                    .await?;
            }
            Situation::Autorizada => {
                if invoice.protocol.is_none() {
                    invoice.protocol = outcome.protocol.clone();
                }
                if let Some(number) = &outcome.assigned_number {
                    invoice.nfse_number = Some(number.clone());
                }
                invoice.set_status(InvoiceStatus::Autorizada);
                sale.set_status(SaleStatus::Autorizada);
            }
        }

        if let Some(xml) = &outcome.distribution_xml {
            invoice.distribution_xml = Some(artifact::pack(xml)?);
        }
        if let Some(document) = &outcome.rendered_artifact {
            invoice.rendered_artifact = Some(artifact::pack(document)?);
        }
        self.store.save_invoice(invoice).await?;
        self.store.save_sale(sale).await?;
        Ok(())
    }

    async fn mark_cancelled(
        &self,
        sale: &mut Sale,
        invoice: &mut Invoice,
    ) -> Result<(), NfseError> {
        let changed = invoice.status != InvoiceStatus::Cancelada;
        invoice.set_status(InvoiceStatus::Cancelada);
        self.store.save_invoice(invoice).await?;
        sale.set_status(SaleStatus::Cancelada);
        self.store.save_sale(sale).await?;
        if changed {
            self.hooks.on_cancelled(sale, invoice).await;
        }
        Ok(())
    }

    async fn check_plan(
        &self,
        user_id: &str,
        action: PlanAction,
    ) -> Result<LimitDecision, NfseError> {
        let decision = self.plan.check_limits(user_id, action).await?;
        if !decision.allowed {
            return Err(NfseError::PlanDenied {
                reason: decision
                    .reason
                    .unwrap_or_else(|| "plan does not allow this action".into()),
                status: decision.status.unwrap_or_else(|| "LIMIT_REACHED".into()),
            });
        }
        Ok(decision)
    }

    async fn sale(&self, id: Uuid) -> Result<Sale, NfseError> {
        self.store
            .sale(id)
            .await?
            .ok_or_else(|| NfseError::not_found("sale", id))
    }

    async fn client(&self, id: Uuid) -> Result<Client, NfseError> {
        self.store
            .client(id)
            .await?
            .ok_or_else(|| NfseError::not_found("client", id))
    }

    /// Companies of other users are reported as missing.
    async fn owned_company(&self, user_id: &str, id: Uuid) -> Result<Company, NfseError> {
        self.store
            .company(id)
            .await?
            .filter(|c| c.user_id == user_id)
            .ok_or_else(|| NfseError::not_found("company", id))
    }

    async fn keyed_invoice(&self, sale_id: Uuid) -> Result<Invoice, NfseError> {
        self.store
            .invoices_for_sale(sale_id)
            .await?
            .into_iter()
            .rev()
            .find(|i| i.access_key().is_some())
            .ok_or_else(|| ReconciliationError::NoAccessKey.into())
    }

    fn decrypt_certificate(
        &self,
        company: &Company,
    ) -> Result<(SecretString, SecretString), NfseError> {
        let stored = company
            .certificate
            .as_ref()
            .ok_or(CertificateError::NotRegistered)?;
        let pfx = self.vault.decrypt(&stored.pfx);
        let password = self.vault.decrypt(&stored.password);
        if CredentialVault::is_encrypted(&pfx) || CredentialVault::is_encrypted(&password) {
            return Err(CertificateError::Undecryptable.into());
        }
        Ok((SecretString::from(pfx), SecretString::from(password)))
    }

    fn credentials(&self, company: &Company) -> Result<Credentials, NfseError> {
        let (pfx, password) = self.decrypt_certificate(company)?;
        Ok(pki::extract(pfx.expose_secret(), password.expose_secret())?)
    }
}

fn expect_status(sale: &Sale, expected: SaleStatus, name: &'static str) -> Result<(), NfseError> {
    if sale.status != expected {
        return Err(ReconciliationError::InvalidSaleState {
            expected: name,
            actual: sale.status,
        }
        .into());
    }
    Ok(())
}

fn keyed(invoice: &Invoice) -> Result<String, NfseError> {
    invoice
        .access_key()
        .map(str::to_string)
        .ok_or_else(|| ReconciliationError::NoAccessKey.into())
}
