use ::redis::RedisError;
use async_trait::async_trait;
use uuid::Uuid;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use crate::domain::models::{Client, Company, Invoice, Sale};

pub type Result<T> = std::result::Result<T, StoreError>;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored record could not be (de)serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Conflict(String),
}

impl From<RedisError> for StoreError {
    fn from(error: RedisError) -> Self {
        Self::Backend(error.to_string())
    }
}

/// Persistence of tenants, sales and invoices.
///
/// There is intentionally no way to delete an invoice: every emission
/// attempt stays on record.
#[async_trait]
pub trait Store: Send + Sync {
    async fn company(&self, id: Uuid) -> Result<Option<Company>>;

    async fn save_company(&self, company: &Company) -> Result<()>;

    async fn client(&self, id: Uuid) -> Result<Option<Client>>;

    /// Saves a client, merging it into the existing record when the company
    /// already has a client with the same document. Returns the stored
    /// record.
    async fn save_client(&self, client: &Client) -> Result<Client>;

    async fn sale(&self, id: Uuid) -> Result<Option<Sale>>;

    async fn save_sale(&self, sale: &Sale) -> Result<()>;

    async fn invoice(&self, id: Uuid) -> Result<Option<Invoice>>;

    /// Invoices of a sale, oldest first.
    async fn invoices_for_sale(&self, sale_id: Uuid) -> Result<Vec<Invoice>>;

    /// Inserts or updates an invoice. Fails with [`StoreError::Conflict`]
    /// when its access key already belongs to another invoice.
    async fn save_invoice(&self, invoice: &Invoice) -> Result<()>;

    /// Next DPS number of the company series, starting at 1.
    async fn next_dps_number(&self, company_id: Uuid, serie: &str) -> Result<u64>;
}

pub(crate) fn normalize_document(document: &str) -> String {
    document.chars().filter(char::is_ascii_digit).collect()
}

pub(crate) fn access_key_conflict(key: &str) -> StoreError {
    StoreError::Conflict(format!("access key {key} already belongs to another invoice"))
}
