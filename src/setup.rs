use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{Context, eyre};
use secrecy::ExposeSecret;

use crate::adapters::{
    CommandPortalRenderer, DisabledPortal, HttpPlanOracle, StaticTaxLookup, UnlimitedPlan,
};
use crate::config::Config;
use crate::domain::engine::ReconciliationEngine;
use crate::domain::ports::{LogSink, PlanOracle, PortalRenderer, TaxLookup};
use crate::emissor::{SimuladoEmissor, StrategyFactory};
use crate::store::{MemoryStore, RedisStore, Store};
use crate::vault::CredentialVault;

/// Fixed key for local development only.
const DEVELOPMENT_VAULT_KEY: &str =
    "6e6673652d7365727665722d646576656c6f706d656e742d6b65792d30303031";

/// Wires the engine and its collaborators from configuration.
pub async fn setup(config: &Config) -> color_eyre::Result<ReconciliationEngine> {
    let (store, logs): (Arc<dyn Store>, Arc<dyn LogSink>) = if let Some(redis_config) =
        &config.redis
    {
        tracing::info!("Redis URI provided, using Redis for storage.");
        let redis_conn = redis_config
            .start()
            .await
            .wrap_err("Failed to start Redis")?;
        let store = Arc::new(RedisStore::new(redis_conn));
        (store.clone(), store)
    } else {
        tracing::info!("No Redis URI, using in-memory storage.");
        let store = Arc::new(MemoryStore::new());
        (store.clone(), store)
    };

    let vault = match &config.vault.key {
        Some(key) => CredentialVault::new(key.expose_secret()).wrap_err("Invalid vault key")?,
        None if config.is_production() => {
            return Err(eyre!("vault.key is required in production"));
        }
        None => {
            tracing::warn!(
                "!!! No vault.key configured: certificates are encrypted with the DEVELOPMENT key. \
                 Never use this setup with real certificates !!!"
            );
            CredentialVault::new(DEVELOPMENT_VAULT_KEY).wrap_err("Invalid development vault key")?
        }
    };

    let tax: Arc<dyn TaxLookup> = match &config.tax.table_path {
        Some(path) => {
            tracing::info!(path, "Loading municipal tax table");
            Arc::new(StaticTaxLookup::from_file(path).wrap_err("Failed to load tax table")?)
        }
        None => Arc::new(StaticTaxLookup::with_defaults()),
    };

    let plan: Arc<dyn PlanOracle> = match &config.plan {
        Some(plan) => Arc::new(
            HttpPlanOracle::new(&plan.url, Duration::from_secs(plan.timeout_secs))
                .wrap_err("Failed to build the plan client")?,
        ),
        None => {
            tracing::info!("No plan service configured, every action is allowed.");
            Arc::new(UnlimitedPlan)
        }
    };

    let portal: Arc<dyn PortalRenderer> = match &config.portal {
        Some(portal) => Arc::new(CommandPortalRenderer::new(
            &portal.command,
            portal.args.clone(),
            Duration::from_secs(portal.timeout_secs),
        )),
        None => Arc::new(DisabledPortal),
    };

    let mut emissors = StrategyFactory::new(
        config.nfse.production.endpoints(),
        config.nfse.restricted.endpoints(),
        config.nfse.transport(),
    );
    if config.nfse.simulate_sandbox {
        if config.is_production() {
            tracing::warn!("Sandbox companies are served by the simulator in production.");
        }
        emissors = emissors.simulate_sandbox(Arc::new(SimuladoEmissor::new()));
    }

    Ok(
        ReconciliationEngine::new(Arc::new(vault), store, logs, tax, Arc::new(emissors))
            .with_plan(plan)
            .with_portal(portal),
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[tokio::test]
    async fn test_production_requires_vault_key() {
        let mut vars = HashMap::new();
        vars.insert("app.environment".to_string(), "production".to_string());
        let config = Config::load_with_sources(Some(vars)).unwrap();

        let Err(err) = setup(&config).await else {
            panic!("setup must fail without a vault key in production");
        };
        assert!(err.to_string().contains("vault.key"));
    }

    #[tokio::test]
    async fn test_development_setup() {
        let config = Config::load_with_sources(Some(HashMap::new())).unwrap();
        assert!(setup(&config).await.is_ok());
    }

    #[test]
    fn test_development_key_is_valid() {
        assert!(CredentialVault::new(DEVELOPMENT_VAULT_KEY).is_ok());
    }
}
