#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use nfse_server::{
    adapters::StaticTaxLookup,
    domain::engine::ReconciliationEngine,
    domain::models::{Address, Client, Company, Environment, Sale, SaleStatus},
    emissor::{NacionalEndpoints, SimuladoEmissor, StrategyFactory, TransportSettings},
    server::{Server, ServerConfig},
    store::{MemoryStore, Store},
    vault::CredentialVault,
};
use rust_decimal::Decimal;
use uuid::Uuid;

pub const USER: &str = "user-1";
const VAULT_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

pub struct TestApp {
    pub addr: String,
    pub store: Arc<MemoryStore>,
}

// Helper function to spawn a test server on a random port, sandbox
// companies served by the simulator
pub async fn spawn_server() -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let emissors = StrategyFactory::new(
        NacionalEndpoints::production(),
        NacionalEndpoints::restricted(),
        TransportSettings::default(),
    )
    .simulate_sandbox(Arc::new(SimuladoEmissor::new()));

    let engine = ReconciliationEngine::new(
        Arc::new(CredentialVault::new(VAULT_KEY).unwrap()),
        store.clone(),
        store.clone(),
        Arc::new(StaticTaxLookup::with_defaults()),
        Arc::new(emissors),
    );

    let server_config = ServerConfig {
        host: "localhost",
        port: 0,
    };
    let server = Server::new(engine, server_config.clone()).await.unwrap();

    let port = server.port().unwrap();
    tokio::spawn(async move {
        server.run().await.expect("failed to run server");
    });

    TestApp {
        addr: format!("http://{}:{}", server_config.host, port),
        store,
    }
}

impl TestApp {
    /// Company, client and a pending sale of 1200.00 for [`USER`].
    pub async fn seed_sale(&self) -> (Company, Sale) {
        let company = Company {
            id: Uuid::new_v4(),
            user_id: USER.into(),
            cnpj: "11222333000181".into(),
            legal_name: "Empresa Teste LTDA".into(),
            municipal_registration: None,
            municipality_code: "3550308".into(),
            certificate: None,
            environment: Environment::Sandbox,
            api_version: "1.00".into(),
            dps_template: None,
            simples_nacional: true,
        };
        self.store.save_company(&company).await.unwrap();

        let client = self
            .store
            .save_client(&Client {
                id: Uuid::new_v4(),
                company_id: company.id,
                document: "529.982.247-25".into(),
                name: "Maria da Silva".into(),
                email: Some("maria@example.com".into()),
                address: Address {
                    street: "Praça da Sé".into(),
                    number: "1".into(),
                    complement: None,
                    district: "Sé".into(),
                    municipality_code: "3550308".into(),
                    cep: "01001-000".into(),
                },
            })
            .await
            .unwrap();

        let sale = Sale {
            id: Uuid::new_v4(),
            company_id: company.id,
            client_id: client.id,
            amount: Decimal::new(120000, 2),
            description: "Desenvolvimento de software sob encomenda".into(),
            service_code: "01.01.01".into(),
            status: SaleStatus::Pendente,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.store.save_sale(&sale).await.unwrap();
        (company, sale)
    }
}
