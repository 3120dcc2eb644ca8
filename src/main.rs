use nfse_server::{
    config::Config,
    server::{Server, ServerConfig},
    setup::setup,
    telemetry,
};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    // A missing .env file is fine
    let _ = dotenvy::dotenv();
    telemetry::init_tracing();

    let config = Config::load()?;
    tracing::info!(
        environment = ?config.app.environment,
        simulate_sandbox = config.nfse.simulate_sandbox,
        "Loaded configuration"
    );

    let engine = setup(&config).await?;

    let server_config = ServerConfig {
        host: &config.server.host,
        port: config.server.port,
    };
    let server = Server::new(engine, server_config).await?;
    server.run().await
}
