use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::models::{Client, Company, Invoice, NewLogEntry, Sale, SystemLog};
use crate::domain::ports::LogSink;
use crate::store::{Result, Store, access_key_conflict, normalize_document};

/// An in-memory store.
///
/// Useful for testing and development.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    companies: Arc<DashMap<Uuid, Company>>,
    clients: Arc<DashMap<Uuid, Client>>,
    client_documents: Arc<DashMap<(Uuid, String), Uuid>>,
    sales: Arc<DashMap<Uuid, Sale>>,
    invoices: Arc<DashMap<Uuid, Invoice>>,
    access_keys: Arc<DashMap<String, Uuid>>,
    counters: Arc<DashMap<(Uuid, String), u64>>,
    logs: Arc<DashMap<Option<Uuid>, Vec<SystemLog>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn company(&self, id: Uuid) -> Result<Option<Company>> {
        Ok(self.companies.get(&id).map(|c| c.value().clone()))
    }

    async fn save_company(&self, company: &Company) -> Result<()> {
        self.companies.insert(company.id, company.clone());
        Ok(())
    }

    async fn client(&self, id: Uuid) -> Result<Option<Client>> {
        Ok(self.clients.get(&id).map(|c| c.value().clone()))
    }

    async fn save_client(&self, client: &Client) -> Result<Client> {
        let key = (client.company_id, normalize_document(&client.document));
        let id = *self.client_documents.entry(key).or_insert(client.id);

        let stored = Client {
            id,
            ..client.clone()
        };
        self.clients.insert(id, stored.clone());
        Ok(stored)
    }

    async fn sale(&self, id: Uuid) -> Result<Option<Sale>> {
        Ok(self.sales.get(&id).map(|s| s.value().clone()))
    }

    async fn save_sale(&self, sale: &Sale) -> Result<()> {
        self.sales.insert(sale.id, sale.clone());
        Ok(())
    }

    async fn invoice(&self, id: Uuid) -> Result<Option<Invoice>> {
        Ok(self.invoices.get(&id).map(|i| i.value().clone()))
    }

    async fn invoices_for_sale(&self, sale_id: Uuid) -> Result<Vec<Invoice>> {
        let mut invoices: Vec<Invoice> = self
            .invoices
            .iter()
            .filter(|i| i.sale_id == sale_id)
            .map(|i| i.value().clone())
            .collect();
        invoices.sort_by_key(|i| (i.created_at, i.number));
        Ok(invoices)
    }

    async fn save_invoice(&self, invoice: &Invoice) -> Result<()> {
        if let Some(key) = invoice.access_key() {
            match self.access_keys.entry(key.to_string()) {
                Entry::Occupied(owner) if *owner.get() != invoice.id => {
                    return Err(access_key_conflict(key));
                }
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(invoice.id);
                }
            }
        }
        self.invoices.insert(invoice.id, invoice.clone());
        Ok(())
    }

    async fn next_dps_number(&self, company_id: Uuid, serie: &str) -> Result<u64> {
        let mut counter = self
            .counters
            .entry((company_id, serie.to_string()))
            .or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}

#[async_trait]
impl LogSink for MemoryStore {
    async fn append(&self, entry: NewLogEntry) -> Result<SystemLog> {
        let log = entry.into_log();
        self.logs.entry(log.sale_id).or_default().push(log.clone());
        Ok(log)
    }

    async fn entries_for_sale(&self, sale_id: Uuid) -> Result<Vec<SystemLog>> {
        Ok(self
            .logs
            .get(&Some(sale_id))
            .map(|logs| logs.value().clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::models::{Address, SaleStatus};
    use crate::store::StoreError;

    fn sale() -> Sale {
        Sale {
            id: Uuid::new_v4(),
            company_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            amount: Decimal::new(1000, 2),
            description: "x".into(),
            service_code: "010101".into(),
            status: SaleStatus::Pendente,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_invoices_are_kept_per_attempt() {
        let store = MemoryStore::new();
        let sale = sale();
        let first = Invoice::draft(&sale, "DPS1".into(), "1".into(), 1);
        let second = Invoice::draft(&sale, "DPS2".into(), "1".into(), 2);
        store.save_invoice(&first).await.unwrap();
        store.save_invoice(&second).await.unwrap();

        let invoices = store.invoices_for_sale(sale.id).await.unwrap();
        assert_eq!(invoices.len(), 2);
        assert_eq!(invoices[0].id, first.id);
        assert_eq!(invoices[1].id, second.id);
    }

    #[tokio::test]
    async fn test_access_key_is_unique() {
        let store = MemoryStore::new();
        let sale = sale();
        let mut first = Invoice::draft(&sale, "DPS1".into(), "1".into(), 1);
        let mut second = Invoice::draft(&sale, "DPS2".into(), "1".into(), 2);
        first.assign_access_key("KEY").unwrap();
        second.assign_access_key("KEY").unwrap();

        store.save_invoice(&first).await.unwrap();
        // Saving the owner again is fine
        store.save_invoice(&first).await.unwrap();
        let err = store.save_invoice(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_dps_numbers_are_monotonic_per_series() {
        let store = MemoryStore::new();
        let company = Uuid::new_v4();
        assert_eq!(store.next_dps_number(company, "1").await.unwrap(), 1);
        assert_eq!(store.next_dps_number(company, "1").await.unwrap(), 2);
        assert_eq!(store.next_dps_number(company, "900").await.unwrap(), 1);
        assert_eq!(store.next_dps_number(Uuid::new_v4(), "1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clients_deduplicated_by_document() {
        let store = MemoryStore::new();
        let company_id = Uuid::new_v4();
        let client = Client {
            id: Uuid::new_v4(),
            company_id,
            document: "529.982.247-25".into(),
            name: "Maria".into(),
            email: None,
            address: Address::default(),
        };
        let first = store.save_client(&client).await.unwrap();

        let duplicate = Client {
            id: Uuid::new_v4(),
            document: "52998224725".into(),
            name: "Maria Silva".into(),
            ..client.clone()
        };
        let merged = store.save_client(&duplicate).await.unwrap();

        assert_eq!(merged.id, first.id);
        assert_eq!(
            store.client(first.id).await.unwrap().unwrap().name,
            "Maria Silva"
        );
        assert!(store.client(duplicate.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_logs_in_order() {
        let store = MemoryStore::new();
        let sale = sale();
        store
            .append(NewLogEntry::info("A", "first").for_sale(&sale))
            .await
            .unwrap();
        store
            .append(NewLogEntry::warn("B", "second").for_sale(&sale))
            .await
            .unwrap();
        store.append(NewLogEntry::info("C", "other")).await.unwrap();

        let logs = store.entries_for_sale(sale.id).await.unwrap();
        let actions: Vec<_> = logs.iter().map(|l| l.action.as_str()).collect();
        assert_eq!(actions, ["A", "B"]);
    }
}
