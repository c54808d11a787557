//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::auth::AuthenticationVerifier;
use crate::domain::{ChannelBroker, ConnectionRegistry};
use crate::service::PeriodicMetricsPublisher;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Process-wide channel broker.
    pub broker: Arc<ChannelBroker>,
    /// Live connection and subscription bookkeeping.
    pub registry: Arc<ConnectionRegistry>,
    /// Bearer token verifier.
    pub verifier: Arc<AuthenticationVerifier>,
    /// Dashboard metrics broadcaster, also serving synchronous reads.
    pub metrics: Arc<PeriodicMetricsPublisher>,
    /// Capacity of each connection's bounded outbound queue.
    pub ws_outbound_queue: usize,
}
