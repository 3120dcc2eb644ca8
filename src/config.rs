use std::{collections::HashMap, time::Duration};

use config::{Config as ConfigLib, ConfigError, Environment, File};
use redis::{
    Client as RedisClient, RedisResult,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::emissor::{NacionalEndpoints, TransportSettings};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub vault: VaultConfig,
    pub nfse: NfseConfig,
    #[serde(default)]
    pub plan: Option<PlanConfig>,
    #[serde(default)]
    pub portal: Option<PortalConfig>,
    #[serde(default)]
    pub tax: TaxConfig,
    #[serde(default)]
    pub redis: Option<RedisConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    Development,
    Production,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub environment: RuntimeEnvironment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    /// 64 hex characters or 32 raw bytes
    #[serde(default)]
    pub key: Option<SecretString>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub sefin_url: String,
    pub adn_url: String,
}

impl EndpointConfig {
    pub fn endpoints(&self) -> NacionalEndpoints {
        NacionalEndpoints::new(&self.sefin_url, &self.adn_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NfseConfig {
    pub production: EndpointConfig,
    pub restricted: EndpointConfig,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// Serve sandbox companies from the in-process simulator
    pub simulate_sandbox: bool,
}

impl NfseConfig {
    pub fn transport(&self) -> TransportSettings {
        TransportSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanConfig {
    pub url: String,
    #[serde(default = "default_plan_timeout")]
    pub timeout_secs: u64,
}

fn default_plan_timeout() -> u64 {
    10
}

/// External command that renders the DANFSe through the government portal.
#[derive(Debug, Clone, Deserialize)]
pub struct PortalConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_portal_timeout")]
    pub timeout_secs: u64,
}

fn default_portal_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaxConfig {
    /// JSON table of municipal taxation; built-in defaults when absent
    #[serde(default)]
    pub table_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub uri: SecretString,
}

impl RedisConfig {
    /// Establishes a new Redis connection based on the provided URI.
    ///
    /// - To enable TLS, the URI must use the `rediss://` scheme.
    /// - To enable insecure TLS, the URI must use the `rediss://` scheme and end with `/#insecure`.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established.
    pub async fn start(&self) -> RedisResult<ConnectionManager> {
        let client = RedisClient::open(self.uri.expose_secret())?;
        let config = ConnectionManagerConfig::new().set_connection_timeout(Duration::from_secs(60));
        client.get_connection_manager_with_config(config).await
    }
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let production = NacionalEndpoints::production();
        let restricted = NacionalEndpoints::restricted();
        let transport = TransportSettings::default();

        let mut builder = ConfigLib::builder()
            .set_default("app.environment", "development")?
            .set_default("server.host", "localhost")?
            .set_default("server.port", 3000)?
            .set_default("nfse.production.sefin_url", production.sefin)?
            .set_default("nfse.production.adn_url", production.adn)?
            .set_default("nfse.restricted.sefin_url", restricted.sefin)?
            .set_default("nfse.restricted.adn_url", restricted.adn)?
            .set_default("nfse.timeout_secs", transport.timeout.as_secs() as i64)?
            .set_default("nfse.max_retries", i64::from(transport.max_retries))?
            .set_default("nfse.backoff_ms", transport.backoff.as_millis() as i64)?
            .set_default("nfse.simulate_sandbox", false)?
            .add_source(File::with_name("config/settings").required(false));

        // If env_vars is provided, we use it instead of system environment
        // This is to avoid systems variables pollution across tests
        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            // Use system environment variables
            // Should be in the format APP_NFSE__TIMEOUT_SECS or APP_VAULT__KEY
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder.build()?.try_deserialize()
    }

    pub fn is_production(&self) -> bool {
        self.app.environment == RuntimeEnvironment::Production
    }
}
