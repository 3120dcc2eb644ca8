use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::ReconciliationError;

/// Layout version used when a company has no explicit pin.
pub const DEFAULT_API_VERSION: &str = "1.00";

/// Environment a company issues invoices against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Sandbox,
    Production,
}

impl Environment {
    /// `tpAmb` code of the national layout.
    pub fn tp_amb(self) -> u8 {
        match self {
            Environment::Production => 1,
            Environment::Sandbox => 2,
        }
    }
}

/// Certificate bundle and password, both vault-encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCertificate {
    pub pfx: String,
    pub password: String,
    pub subject: String,
    pub not_after: DateTime<Utc>,
}

/// A tenant emitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub user_id: String,
    pub cnpj: String,
    pub legal_name: String,
    pub municipal_registration: Option<String>,
    pub municipality_code: String,
    pub certificate: Option<StoredCertificate>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Tenant DPS boilerplate, see [`DpsTemplate`](crate::domain::dps::DpsTemplate).
    #[serde(default)]
    pub dps_template: Option<serde_json::Value>,
    #[serde(default)]
    pub simples_nacional: bool,
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub number: String,
    #[serde(default)]
    pub complement: Option<String>,
    pub district: String,
    pub municipality_code: String,
    pub cep: String,
}

/// The service taker (tomador).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub company_id: Uuid,
    /// CPF (11 digits) or CNPJ (14 digits)
    pub document: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub address: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SaleStatus {
    Pendente,
    Processando,
    Autorizada,
    ErroEmissao,
    Cancelada,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub id: Uuid,
    pub company_id: Uuid,
    pub client_id: Uuid,
    pub amount: Decimal,
    pub description: String,
    pub service_code: String,
    pub status: SaleStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Sale {
    pub fn set_status(&mut self, status: SaleStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Fields an operator may fix before re-submitting a sale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleCorrections {
    pub amount: Option<Decimal>,
    pub description: Option<String>,
    pub service_code: Option<String>,
}

impl SaleCorrections {
    pub fn is_empty(&self) -> bool {
        self.amount.is_none() && self.description.is_none() && self.service_code.is_none()
    }

    pub fn apply(&self, sale: &mut Sale) {
        if let Some(amount) = self.amount {
            sale.amount = amount;
        }
        if let Some(description) = &self.description {
            sale.description = description.clone();
        }
        if let Some(service_code) = &self.service_code {
            sale.service_code = service_code.clone();
        }
        sale.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvoiceStatus {
    Rascunho,
    Processando,
    Autorizada,
    Erro,
    Cancelada,
}

/// One emission attempt for a sale.
///
/// XML payloads and the rendered artifact are stored packed
/// (see [`crate::artifact`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: Uuid,
    pub sale_id: Uuid,
    pub company_id: Uuid,
    pub dps_id: String,
    pub serie: String,
    pub number: u64,
    access_key: Option<String>,
    pub protocol: Option<String>,
    pub nfse_number: Option<String>,
    pub status: InvoiceStatus,
    pub error_message: Option<String>,
    pub signed_xml: Option<String>,
    pub distribution_xml: Option<String>,
    pub rendered_artifact: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub fn draft(sale: &Sale, dps_id: String, serie: String, number: u64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            sale_id: sale.id,
            company_id: sale.company_id,
            dps_id,
            serie,
            number,
            access_key: None,
            protocol: None,
            nfse_number: None,
            status: InvoiceStatus::Rascunho,
            error_message: None,
            signed_xml: None,
            distribution_xml: None,
            rendered_artifact: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn access_key(&self) -> Option<&str> {
        self.access_key.as_deref()
    }

    /// Assigns the access key. Once set it can only be re-assigned the same
    /// value.
    pub fn assign_access_key(&mut self, key: &str) -> Result<(), ReconciliationError> {
        match &self.access_key {
            Some(current) if current == key => Ok(()),
            Some(current) => Err(ReconciliationError::AccessKeyImmutable {
                current: current.clone(),
            }),
            None => {
                self.access_key = Some(key.to_string());
                self.touch();
                Ok(())
            }
        }
    }

    pub fn set_status(&mut self, status: InvoiceStatus) {
        self.status = status;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Actions recorded in the sale log trail.
pub mod actions {
    pub const EMISSAO: &str = "EMISSAO_NFSE";
    pub const REENVIO_MANUAL: &str = "REENVIO_MANUAL";
    pub const CORRECAO: &str = "CORRECAO_VENDA";
    pub const CONSULTA: &str = "CONSULTA_NFSE";
    pub const CANCELAMENTO: &str = "CANCELAMENTO_NFSE";
    pub const DOWNLOAD: &str = "DOWNLOAD_DANFSE";
    pub const CERTIFICADO: &str = "CERTIFICADO";
}

/// Details key holding a packed transmitted payload.
pub const SIGNED_XML_DETAIL: &str = "signed_xml";

/// Append-only log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemLog {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub action: String,
    pub message: String,
    pub company_id: Option<Uuid>,
    pub sale_id: Option<Uuid>,
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub level: LogLevel,
    pub action: String,
    pub message: String,
    pub company_id: Option<Uuid>,
    pub sale_id: Option<Uuid>,
    pub details: serde_json::Value,
}

impl NewLogEntry {
    pub fn new(level: LogLevel, action: &str, message: impl Into<String>) -> Self {
        Self {
            level,
            action: action.to_string(),
            message: message.into(),
            company_id: None,
            sale_id: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn info(action: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, action, message)
    }

    pub fn warn(action: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, action, message)
    }

    pub fn error(action: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, action, message)
    }

    pub fn for_sale(mut self, sale: &Sale) -> Self {
        self.company_id = Some(sale.company_id);
        self.sale_id = Some(sale.id);
        self
    }

    pub fn for_company(mut self, company_id: Uuid) -> Self {
        self.company_id = Some(company_id);
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn into_log(self) -> SystemLog {
        SystemLog {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level: self.level,
            action: self.action,
            message: self.message,
            company_id: self.company_id,
            sale_id: self.sale_id,
            details: self.details,
        }
    }
}
