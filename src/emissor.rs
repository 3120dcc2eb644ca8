//! Talking to the tax authority.
//!
//! A company is served by exactly one [`EmissorStrategy`], resolved from its
//! environment by a [`StrategyFactory`]. Every strategy emits, consults and
//! cancels; the engine never knows which one it holds.

mod event;
mod nacional;
mod simulado;
mod transport;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use event::{CANCELLATION_EVENT, CancellationEvent};
pub use nacional::{NacionalEmissor, NacionalEndpoints};
pub use simulado::SimuladoEmissor;
pub use transport::{HttpTransport, TransportSettings};

use crate::domain::models::{Company, Environment};
use crate::pki::Credentials;

/// Failure to get an answer from the authority.
///
/// A rejection is an answer; it is reported through the outcomes, not here.
#[derive(Debug, thiserror::Error)]
pub enum TransmissionError {
    #[error("could not reach the authority after {attempts} attempt(s): {detail}")]
    Unreachable { attempts: u32, detail: String },
    #[error("authority answered HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("client certificate rejected by the TLS stack: {0}")]
    Identity(String),
    #[error("unexpected response from the authority: {0}")]
    InvalidResponse(String),
    #[error("could not prepare the request: {0}")]
    Request(String),
}

/// Result of sending a signed DPS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmitOutcome {
    pub success: bool,
    pub access_key: Option<String>,
    pub protocol: Option<String>,
    pub nfse_number: Option<String>,
    /// Authorized NFS-e document, plain XML
    pub distribution_xml: Option<String>,
    pub rejection_reason: Option<String>,
    /// Remote body kept for the log trail
    pub raw_response: Option<String>,
}

impl EmitOutcome {
    pub fn rejected(reason: impl Into<String>, raw_response: Option<String>) -> Self {
        Self {
            success: false,
            rejection_reason: Some(reason.into()),
            raw_response,
            ..Default::default()
        }
    }
}

/// Remote situation of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Situation {
    Autorizada,
    Cancelada,
    Processando,
    Rejeitada,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsultOutcome {
    pub success: bool,
    pub situation: Situation,
    pub protocol: Option<String>,
    pub distribution_xml: Option<String>,
    #[serde(skip)]
    pub rendered_artifact: Option<Vec<u8>>,
    pub assigned_number: Option<String>,
    pub reason: Option<String>,
}

impl ConsultOutcome {
    pub fn situation(situation: Situation) -> Self {
        Self {
            success: true,
            situation,
            protocol: None,
            distribution_xml: None,
            rendered_artifact: None,
            assigned_number: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub success: bool,
    pub reason: Option<String>,
    pub raw_response: Option<String>,
}

/// What the engine needs from the authority.
///
/// `credentials` are the decrypted company certificate, valid for the call
/// only.
#[async_trait]
pub trait Emissor: Send + Sync {
    async fn emit(
        &self,
        signed_xml: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<EmitOutcome, TransmissionError>;

    async fn consult(
        &self,
        access_key: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<ConsultOutcome, TransmissionError>;

    async fn cancel(
        &self,
        access_key: &str,
        protocol: &str,
        justification: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<CancelOutcome, TransmissionError>;
}

/// The closed set of authorities a company can be bound to.
#[derive(Clone)]
pub enum EmissorStrategy {
    Nacional(NacionalEmissor),
    Simulado(Arc<SimuladoEmissor>),
}

impl EmissorStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            EmissorStrategy::Nacional(_) => "nacional",
            EmissorStrategy::Simulado(_) => "simulado",
        }
    }
}

#[async_trait]
impl Emissor for EmissorStrategy {
    async fn emit(
        &self,
        signed_xml: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<EmitOutcome, TransmissionError> {
        match self {
            EmissorStrategy::Nacional(e) => e.emit(signed_xml, company, credentials).await,
            EmissorStrategy::Simulado(e) => e.emit(signed_xml, company, credentials).await,
        }
    }

    async fn consult(
        &self,
        access_key: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<ConsultOutcome, TransmissionError> {
        match self {
            EmissorStrategy::Nacional(e) => e.consult(access_key, company, credentials).await,
            EmissorStrategy::Simulado(e) => e.consult(access_key, company, credentials).await,
        }
    }

    async fn cancel(
        &self,
        access_key: &str,
        protocol: &str,
        justification: &str,
        company: &Company,
        credentials: &Credentials,
    ) -> Result<CancelOutcome, TransmissionError> {
        match self {
            EmissorStrategy::Nacional(e) => {
                e.cancel(access_key, protocol, justification, company, credentials)
                    .await
            }
            EmissorStrategy::Simulado(e) => {
                e.cancel(access_key, protocol, justification, company, credentials)
                    .await
            }
        }
    }
}

/// Resolves the emissor serving a company.
pub trait EmissorFactory: Send + Sync {
    fn for_company(&self, company: &Company) -> Arc<dyn Emissor>;
}

/// Builds [`EmissorStrategy`] values from configuration.
#[derive(Clone)]
pub struct StrategyFactory {
    production: NacionalEndpoints,
    restricted: NacionalEndpoints,
    transport: TransportSettings,
    simulator: Option<Arc<SimuladoEmissor>>,
}

impl StrategyFactory {
    pub fn new(
        production: NacionalEndpoints,
        restricted: NacionalEndpoints,
        transport: TransportSettings,
    ) -> Self {
        Self {
            production,
            restricted,
            transport,
            simulator: None,
        }
    }

    /// Serves sandbox companies from the in-process simulator.
    pub fn simulate_sandbox(mut self, simulator: Arc<SimuladoEmissor>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn strategy(&self, company: &Company) -> EmissorStrategy {
        match (company.environment, &self.simulator) {
            (Environment::Sandbox, Some(simulator)) => EmissorStrategy::Simulado(simulator.clone()),
            (Environment::Sandbox, None) => EmissorStrategy::Nacional(NacionalEmissor::new(
                self.restricted.clone(),
                self.transport.clone(),
            )),
            (Environment::Production, _) => EmissorStrategy::Nacional(NacionalEmissor::new(
                self.production.clone(),
                self.transport.clone(),
            )),
        }
    }
}

impl EmissorFactory for StrategyFactory {
    fn for_company(&self, company: &Company) -> Arc<dyn Emissor> {
        let strategy = self.strategy(company);
        tracing::debug!(company_id = %company.id, strategy = strategy.name(), "Emissor resolved");
        Arc::new(strategy)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn company(environment: Environment) -> Company {
        Company {
            id: Uuid::new_v4(),
            user_id: "user".into(),
            cnpj: "11222333000181".into(),
            legal_name: "ACME".into(),
            municipal_registration: None,
            municipality_code: "3550308".into(),
            certificate: None,
            environment,
            api_version: "1.00".into(),
            dps_template: None,
            simples_nacional: false,
        }
    }

    fn factory() -> StrategyFactory {
        StrategyFactory::new(
            NacionalEndpoints::production(),
            NacionalEndpoints::restricted(),
            TransportSettings::default(),
        )
    }

    #[test]
    fn test_strategy_follows_environment() {
        let factory = factory();
        assert_eq!(factory.strategy(&company(Environment::Production)).name(), "nacional");
        assert_eq!(factory.strategy(&company(Environment::Sandbox)).name(), "nacional");

        let factory = factory.simulate_sandbox(Arc::new(SimuladoEmissor::new()));
        assert_eq!(factory.strategy(&company(Environment::Sandbox)).name(), "simulado");
        assert_eq!(factory.strategy(&company(Environment::Production)).name(), "nacional");
    }

    #[test]
    fn test_sandbox_uses_restricted_endpoints() {
        let EmissorStrategy::Nacional(emissor) = factory().strategy(&company(Environment::Sandbox))
        else {
            panic!("expected the national emissor");
        };
        assert!(emissor.endpoints().sefin.contains("producaorestrita"));
    }
}
