//! Service layer: collaborator-facing publishers and the metrics
//! broadcaster.

pub mod metrics;
pub mod publisher;

pub use metrics::{MetricsSnapshot, MetricsSource, NullMetricsSource, PeriodicMetricsPublisher};
pub use publisher::EventPublisher;
