pub mod adapters;
pub mod artifact;
pub mod config;
pub mod crypto;
pub mod domain;
pub mod emissor;
pub mod pki;
pub mod server;
pub mod setup;
pub mod store;
pub mod telemetry;
pub mod vault;
pub mod xmldsig;
