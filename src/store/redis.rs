use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::domain::models::{Client, Company, Invoice, NewLogEntry, Sale, SystemLog};
use crate::domain::ports::LogSink;
use crate::store::{Result, Store, StoreError, access_key_conflict, normalize_document};

const PREFIX: &str = "nfse";

/// A Redis store. Records are JSON values under `nfse:` keys.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Creates a new Redis store from a connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await?;
        Ok(raw.map(|raw| serde_json::from_str(&raw)).transpose()?)
    }

    async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, serde_json::to_string(value)?).await?;
        Ok(())
    }

    /// Claims `key` for `owner`, returning whoever owns it afterwards.
    async fn claim(&self, key: &str, owner: Uuid) -> Result<Uuid> {
        let mut conn = self.conn.clone();
        let claimed: bool = conn.set_nx(key, owner.to_string()).await?;
        if claimed {
            return Ok(owner);
        }
        let current: String = conn.get(key).await?;
        Uuid::parse_str(&current)
            .map_err(|e| StoreError::Backend(format!("corrupted index {key}: {e}")))
    }
}

fn company_key(id: Uuid) -> String {
    format!("{PREFIX}:company:{id}")
}

fn client_key(id: Uuid) -> String {
    format!("{PREFIX}:client:{id}")
}

fn client_document_key(company_id: Uuid, document: &str) -> String {
    format!("{PREFIX}:company:{company_id}:client_doc:{document}")
}

fn sale_key(id: Uuid) -> String {
    format!("{PREFIX}:sale:{id}")
}

fn sale_invoices_key(sale_id: Uuid) -> String {
    format!("{PREFIX}:sale:{sale_id}:invoices")
}

fn sale_logs_key(sale_id: Uuid) -> String {
    format!("{PREFIX}:sale:{sale_id}:logs")
}

fn invoice_key(id: impl std::fmt::Display) -> String {
    format!("{PREFIX}:invoice:{id}")
}

fn access_key_index(key: &str) -> String {
    format!("{PREFIX}:access_key:{key}")
}

fn counter_key(company_id: Uuid, serie: &str) -> String {
    format!("{PREFIX}:company:{company_id}:dps_counter:{serie}")
}

const UNBOUND_LOGS_KEY: &str = "nfse:logs";

#[async_trait]
impl Store for RedisStore {
    async fn company(&self, id: Uuid) -> Result<Option<Company>> {
        self.load(&company_key(id)).await
    }

    async fn save_company(&self, company: &Company) -> Result<()> {
        self.put(&company_key(company.id), company).await
    }

    async fn client(&self, id: Uuid) -> Result<Option<Client>> {
        self.load(&client_key(id)).await
    }

    async fn save_client(&self, client: &Client) -> Result<Client> {
        let index = client_document_key(client.company_id, &normalize_document(&client.document));
        let id = self.claim(&index, client.id).await?;

        let stored = Client {
            id,
            ..client.clone()
        };
        self.put(&client_key(id), &stored).await?;
        Ok(stored)
    }

    async fn sale(&self, id: Uuid) -> Result<Option<Sale>> {
        self.load(&sale_key(id)).await
    }

    async fn save_sale(&self, sale: &Sale) -> Result<()> {
        self.put(&sale_key(sale.id), sale).await
    }

    async fn invoice(&self, id: Uuid) -> Result<Option<Invoice>> {
        self.load(&invoice_key(id)).await
    }

    async fn invoices_for_sale(&self, sale_id: Uuid) -> Result<Vec<Invoice>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.zrange(sale_invoices_key(sale_id), 0, -1).await?;

        let mut invoices = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.get(invoice_key(id)).await?;
            if let Some(raw) = raw {
                invoices.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(invoices)
    }

    async fn save_invoice(&self, invoice: &Invoice) -> Result<()> {
        if let Some(key) = invoice.access_key() {
            let owner = self.claim(&access_key_index(key), invoice.id).await?;
            if owner != invoice.id {
                return Err(access_key_conflict(key));
            }
        }

        self.put(&invoice_key(invoice.id), invoice).await?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(
                sale_invoices_key(invoice.sale_id),
                invoice.id.to_string(),
                invoice.created_at.timestamp_micros(),
            )
            .await?;
        Ok(())
    }

    async fn next_dps_number(&self, company_id: Uuid, serie: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let number: u64 = conn.incr(counter_key(company_id, serie), 1).await?;
        Ok(number)
    }
}

#[async_trait]
impl LogSink for RedisStore {
    async fn append(&self, entry: NewLogEntry) -> Result<SystemLog> {
        let log = entry.into_log();
        let key = log
            .sale_id
            .map(sale_logs_key)
            .unwrap_or_else(|| UNBOUND_LOGS_KEY.to_string());

        let mut conn = self.conn.clone();
        let _: () = conn.rpush(key, serde_json::to_string(&log)?).await?;
        Ok(log)
    }

    async fn entries_for_sale(&self, sale_id: Uuid) -> Result<Vec<SystemLog>> {
        let mut conn = self.conn.clone();
        let rows: Vec<String> = conn.lrange(sale_logs_key(sale_id), 0, -1).await?;
        let mut logs = Vec::with_capacity(rows.len());
        for row in rows {
            logs.push(serde_json::from_str(&row)?);
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        let id = Uuid::nil();
        assert_eq!(
            company_key(id),
            "nfse:company:00000000-0000-0000-0000-000000000000"
        );
        assert!(counter_key(id, "900").ends_with(":dps_counter:900"));
        assert_eq!(access_key_index("ABC"), "nfse:access_key:ABC");
        assert!(client_document_key(id, "52998224725").starts_with("nfse:company:"));
    }
}
