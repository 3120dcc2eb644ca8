pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use color_eyre::eyre::{Context, Result};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::domain::engine::ReconciliationEngine;
use handlers::{certificate, health, invoices, sales};

#[derive(Debug, Clone)]
pub struct ServerConfig<'a> {
    pub host: &'a str,
    pub port: u16,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
}

pub struct Server {
    router: Router,
    listener: TcpListener,
}

impl Server {
    /// Binds the listener and builds the router. Port 0 picks a free port.
    pub async fn new(engine: ReconciliationEngine, config: ServerConfig<'_>) -> Result<Self> {
        let trace_layer =
            TraceLayer::new_for_http().make_span_with(|request: &'_ axum::extract::Request<_>| {
                let uri = request.uri().to_string();
                tracing::info_span!("request", method = %request.method(), uri)
            });

        let cors_layer = CorsLayer::new()
            .allow_origin(Any)
            .allow_headers(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS]);

        let state = AppState {
            engine: Arc::new(engine),
        };

        let router = Router::new()
            .route("/health", get(health::health_check))
            .route(
                "/companies/{id}/certificate",
                post(certificate::register_certificate),
            )
            .route("/sales/{id}/emit", post(sales::emit))
            .route("/sales/{id}/retry", post(sales::retry))
            .route("/sales/{id}/resubmit", post(sales::resubmit))
            .route("/sales/{id}/consult", post(sales::consult))
            .route("/sales/{id}/cancel", post(sales::cancel))
            .route("/sales/{id}/signature", get(sales::signature))
            .route("/invoices/{id}/artifact", get(invoices::artifact))
            .layer(cors_layer)
            .layer(trace_layer)
            .with_state(state);

        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .wrap_err_with(|| format!("Failed to bind {addr}"))?;

        Ok(Self { router, listener })
    }

    pub fn port(&self) -> Result<u16> {
        Ok(self
            .listener
            .local_addr()
            .wrap_err("Failed to read the bound address")?
            .port())
    }

    pub async fn run(self) -> Result<()> {
        tracing::info!("Listening on {}", self.listener.local_addr()?);
        axum::serve(self.listener, self.router)
            .await
            .wrap_err("Server error")
    }
}
