//! Periodic dashboard metrics broadcaster.
//!
//! A fixed-interval ticker recomputes an aggregate snapshot from read-only
//! collaborators and publishes it on `dashboard:metrics`. Synchronous
//! `get_metrics` reads serve the cached snapshot while fresh; stale or
//! forced reads recompute behind a single-flight gate so N concurrent
//! callers trigger exactly one computation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::domain::{ChannelBroker, EventDraft, channels};
use crate::error::RealtimeError;

/// Aggregate compliance metrics broadcast to dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// DSARs currently open.
    pub open_dsars: u64,
    /// Open DSARs past their statutory deadline.
    pub overdue_dsars: u64,
    /// Open DSARs due within the warning window.
    pub dsars_due_soon: u64,
    /// Active risk assessments.
    pub active_risks: u64,
    /// Active risks rated high or critical.
    pub high_severity_risks: u64,
    /// Policies in the published state.
    pub published_policies: u64,
    /// Policies past their review date.
    pub policies_due_review: u64,
    /// Overall compliance score, 0–100.
    pub compliance_score: f64,
    /// When this snapshot was computed.
    pub generated_at: DateTime<Utc>,
}

/// Read-only collaborator that aggregates counts from the CRUD stores.
///
/// The gateway never touches the stores directly; repositories implement
/// this trait and are injected at startup.
#[async_trait]
pub trait MetricsSource: Send + Sync + std::fmt::Debug {
    /// Computes a fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::Internal`] when the underlying stores
    /// cannot be read.
    async fn compute(&self) -> Result<MetricsSnapshot, RealtimeError>;
}

/// Stand-in source used until store-backed sources are wired in: reports
/// an empty platform with a full compliance score.
#[derive(Debug, Default)]
pub struct NullMetricsSource;

#[async_trait]
impl MetricsSource for NullMetricsSource {
    async fn compute(&self) -> Result<MetricsSnapshot, RealtimeError> {
        Ok(MetricsSnapshot {
            open_dsars: 0,
            overdue_dsars: 0,
            dsars_due_soon: 0,
            active_risks: 0,
            high_severity_risks: 0,
            published_policies: 0,
            policies_due_review: 0,
            compliance_score: 100.0,
            generated_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedSnapshot {
    snapshot: MetricsSnapshot,
    computed_at: Instant,
}

/// Background ticker plus cached, single-flight `get_metrics` reads.
pub struct PeriodicMetricsPublisher {
    broker: Arc<ChannelBroker>,
    source: Arc<dyn MetricsSource>,
    freshness: Duration,
    interval: Duration,
    cache: std::sync::Mutex<Option<CachedSnapshot>>,
    refresh_gate: tokio::sync::Mutex<()>,
    shutdown: watch::Sender<bool>,
    ticker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for PeriodicMetricsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicMetricsPublisher")
            .field("freshness", &self.freshness)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl PeriodicMetricsPublisher {
    /// Creates a publisher; call [`Self::start`] to begin broadcasting.
    #[must_use]
    pub fn new(
        broker: Arc<ChannelBroker>,
        source: Arc<dyn MetricsSource>,
        interval: Duration,
        freshness: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            source,
            freshness,
            interval,
            cache: std::sync::Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
            shutdown,
            ticker: std::sync::Mutex::new(None),
        }
    }

    /// Returns the current snapshot.
    ///
    /// Serves the cache when fresh (unless `force_refresh`); otherwise
    /// recomputes behind the single-flight gate. Callers that were waiting
    /// on the gate observe the flight's result instead of recomputing.
    ///
    /// # Errors
    ///
    /// Propagates the source's error when a recomputation fails.
    pub async fn get_metrics(&self, force_refresh: bool) -> Result<MetricsSnapshot, RealtimeError> {
        let entered = Instant::now();
        if !force_refresh && let Some(snapshot) = self.cached_if_fresh() {
            return Ok(snapshot);
        }

        let _flight = self.refresh_gate.lock().await;
        // Another flight may have refreshed the cache while we waited.
        if let Some(cached) = self.cached_since(entered) {
            return Ok(cached);
        }
        if !force_refresh && let Some(snapshot) = self.cached_if_fresh() {
            return Ok(snapshot);
        }

        let snapshot = self.source.compute().await?;
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *cache = Some(CachedSnapshot {
            snapshot: snapshot.clone(),
            computed_at: Instant::now(),
        });
        Ok(snapshot)
    }

    fn cached_if_fresh(&self) -> Option<MetricsSnapshot> {
        let cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache
            .as_ref()
            .filter(|cached| cached.computed_at.elapsed() < self.freshness)
            .map(|cached| cached.snapshot.clone())
    }

    fn cached_since(&self, entered: Instant) -> Option<MetricsSnapshot> {
        let cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        cache
            .as_ref()
            .filter(|cached| cached.computed_at >= entered)
            .map(|cached| cached.snapshot.clone())
    }

    /// Spawns the broadcast ticker. The first tick fires immediately.
    pub fn start(self: &Arc<Self>) {
        let publisher = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(publisher.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }
                // Runs outside the select so stop() never interrupts an
                // in-flight computation.
                publisher.tick().await;
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            tracing::debug!("metrics ticker stopped");
        });
        let mut slot = self
            .ticker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(task);
    }

    /// Cancels future ticks and waits for the ticker task to wind down.
    /// An in-flight computation is left to finish, never interrupted.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = {
            let mut slot = self
                .ticker
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn tick(&self) {
        match self.get_metrics(true).await {
            Ok(snapshot) => {
                let payload = match serde_json::to_value(&snapshot) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(error = %err, "metrics snapshot serialization failed");
                        return;
                    }
                };
                self.broker
                    .publish(
                        channels::DASHBOARD_METRICS,
                        EventDraft::new("metrics_updated", payload),
                    )
                    .await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "metrics recomputation failed, skipping broadcast");
            }
        }
    }
}
