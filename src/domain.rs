pub mod dps;
pub mod engine;
pub mod errors;
pub mod models;
pub mod ports;
