//! compliance-gateway server entry point.
//!
//! Connects the channel broker (fatal on failure), starts the metrics
//! broadcaster, and serves the HTTP/WebSocket endpoints.

use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use compliance_gateway::api;
use compliance_gateway::app_state::AppState;
use compliance_gateway::auth::AuthenticationVerifier;
use compliance_gateway::config::GatewayConfig;
use compliance_gateway::domain::{ChannelBroker, ConnectionRegistry, InProcessTransport};
use compliance_gateway::service::{NullMetricsSource, PeriodicMetricsPublisher};
use compliance_gateway::ws::handler::ws_handler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = GatewayConfig::from_env().map_err(|err| anyhow::anyhow!(err.to_string()))?;
    tracing::info!(addr = %config.listen_addr, "starting compliance-gateway");

    // Process-wide broker: constructed once, injected everywhere. Failing
    // to connect the transport aborts startup.
    let transport = Arc::new(InProcessTransport::new());
    let broker = Arc::new(ChannelBroker::new(transport));
    broker
        .connect()
        .await
        .context("pub/sub transport connection failed")?;

    let registry = Arc::new(ConnectionRegistry::new());
    let verifier = Arc::new(AuthenticationVerifier::new(&config.jwt_secret));

    // TODO: replace NullMetricsSource with the store-backed aggregator once
    // the repository services expose their async count APIs.
    let metrics = Arc::new(PeriodicMetricsPublisher::new(
        Arc::clone(&broker),
        Arc::new(NullMetricsSource),
        config.metrics_interval(),
        config.metrics_freshness(),
    ));
    metrics.start();

    let app_state = AppState {
        broker: Arc::clone(&broker),
        registry,
        verifier,
        metrics: Arc::clone(&metrics),
        ws_outbound_queue: config.ws_outbound_queue,
    };

    // Build router
    let app = Router::new()
        .merge(api::build_router())
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    // Start server
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    axum::serve(listener, app).await?;

    metrics.stop().await;
    broker.disconnect().await;
    Ok(())
}
