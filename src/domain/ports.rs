//! Contracts of the collaborators the engine consumes.

use async_trait::async_trait;
use rust_decimal::Decimal;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::{Invoice, NewLogEntry, Sale, SystemLog};
use crate::store::StoreError;

/// Failure talking to an external collaborator.
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} unavailable: {detail}")]
    Unavailable {
        service: &'static str,
        detail: String,
    },
    #[error("{service} returned an invalid response: {detail}")]
    InvalidResponse {
        service: &'static str,
        detail: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanAction {
    Emitir,
    Visualizar,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDecision {
    pub allowed: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub history_id: Option<String>,
}

impl LimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            status: None,
            history_id: None,
        }
    }
}

/// Subscription limits, decided elsewhere.
#[async_trait]
pub trait PlanOracle: Send + Sync {
    async fn check_limits(
        &self,
        user_id: &str,
        action: PlanAction,
    ) -> Result<LimitDecision, CollaboratorError>;

    /// Records one consumed emission against the plan period.
    async fn increment_usage(&self, history_id: &str) -> Result<(), CollaboratorError>;
}

/// Append-only trail of what happened to each sale.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, entry: NewLogEntry) -> Result<SystemLog, StoreError>;

    /// Entries for the sale, oldest first.
    async fn entries_for_sale(&self, sale_id: Uuid) -> Result<Vec<SystemLog>, StoreError>;
}

/// Municipal taxation of a national service code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MunicipalTax {
    /// `cTribNac`, six digits
    pub national_code: String,
    /// `cTribMun`, when the municipality details the national code
    #[serde(default)]
    pub municipal_code: Option<String>,
    pub description: String,
    /// ISSQN rate in percent
    pub iss_rate: Decimal,
    #[serde(default)]
    pub nbs: Option<String>,
}

#[async_trait]
pub trait TaxLookup: Send + Sync {
    async fn resolve(
        &self,
        service_code: &str,
        municipality_code: &str,
    ) -> Result<Option<MunicipalTax>, CollaboratorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum PortalError {
    #[error("portal renderer is not configured")]
    Unavailable,
    #[error("portal renderer timed out after {0} seconds")]
    Timeout(u64),
    #[error("portal renderer failed: {0}")]
    Failed(String),
}

/// Fallback that logs into the government portal with the client
/// certificate and downloads the official rendering.
#[async_trait]
pub trait PortalRenderer: Send + Sync {
    async fn download_official_artifact(
        &self,
        access_key: &str,
        pfx_base64: &SecretString,
        password: &SecretString,
    ) -> Result<Vec<u8>, PortalError>;
}

/// Downstream reactions to terminal transitions.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn on_authorized(&self, sale: &Sale, invoice: &Invoice);
    async fn on_cancelled(&self, sale: &Sale, invoice: &Invoice);
}
