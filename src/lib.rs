//! # compliance-gateway
//!
//! Real-time event distribution layer for the compliance platform (DSAR
//! tracking, risk assessment, policy lifecycle, GDPR records). The rest of
//! the platform publishes events through the channel broker; this service
//! fans them out to exactly the live, authorized WebSocket subscribers.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket)
//!     │
//!     ├── WS Gateway (ws/) — auth/subscription state machine
//!     │
//!     ├── ChannelBroker (domain/) — refcounted topic subscriptions
//!     ├── ConnectionRegistry (domain/) — dual-index bookkeeping
//!     ├── EventTransport (domain/) — pub/sub backend seam
//!     │
//!     ├── AuthenticationVerifier (auth)
//!     └── PeriodicMetricsPublisher (service/) — dashboard:metrics ticker
//! ```

pub mod api;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod ws;
