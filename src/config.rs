//! Gateway configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`) with sensible defaults for local
//! development.

use std::net::SocketAddr;
use std::time::Duration;

/// Top-level gateway configuration.
///
/// Loaded once at startup via [`GatewayConfig::from_env`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Socket address to bind the HTTP server to (e.g. `0.0.0.0:3001`).
    pub listen_addr: SocketAddr,

    /// HMAC secret used to verify bearer tokens.
    pub jwt_secret: String,

    /// Seconds between dashboard metrics broadcasts.
    pub metrics_interval_secs: u64,

    /// Seconds a cached metrics snapshot stays fresh.
    pub metrics_freshness_secs: u64,

    /// Capacity of each connection's bounded outbound frame queue. A
    /// connection whose queue overflows is closed, never backpressured.
    pub ws_outbound_queue: usize,
}

impl GatewayConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to defaults when a variable is not set. Calls
    /// `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns an error if `LISTEN_ADDR` is set but cannot be parsed as
    /// a [`SocketAddr`].
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:3001".to_string())
            .parse()?;

        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "dev-secret-change-in-production".to_string());

        let metrics_interval_secs = parse_env("METRICS_INTERVAL_SECS", 30);
        let metrics_freshness_secs = parse_env("METRICS_FRESHNESS_SECS", 15);
        let ws_outbound_queue = parse_env("WS_OUTBOUND_QUEUE", 256);

        Ok(Self {
            listen_addr,
            jwt_secret,
            metrics_interval_secs,
            metrics_freshness_secs,
            ws_outbound_queue,
        })
    }

    /// Interval between metrics broadcasts as a [`Duration`].
    #[must_use]
    pub const fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Metrics cache freshness window as a [`Duration`].
    #[must_use]
    pub const fn metrics_freshness(&self) -> Duration {
        Duration::from_secs(self.metrics_freshness_secs)
    }
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
