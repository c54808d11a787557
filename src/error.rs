//! Error taxonomy for the real-time event layer.
//!
//! [`RealtimeError`] covers every failure class this subsystem can produce.
//! Only one condition is fatal: failing to connect the pub/sub transport at
//! startup. Everything else is recovered locally — reported to the affected
//! WebSocket connection or written to the log stream.

/// Central error type for the event-distribution layer.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The pub/sub transport backend is unreachable. Fatal at startup,
    /// logged and swallowed on the publish path.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Bearer token verification failed (bad signature, expired, garbage).
    /// Reported to the single connection; non-fatal.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// An authenticated connection attempted to subscribe to a channel its
    /// identity does not permit.
    #[error("not authorized to subscribe to channel {channel}")]
    Authorization {
        /// The channel that was denied.
        channel: String,
    },

    /// An inbound frame was not valid JSON or had an unknown type. The
    /// connection stays open.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A dispatch callback panicked. Isolated and logged; never propagates
    /// to the broker loop or to sibling callbacks.
    #[error("subscriber callback failed on channel {0}")]
    Callback(String),

    /// An event failed validation before publish (empty channel or type).
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Catch-all for internal invariant violations.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RealtimeError {
    /// Returns `true` for errors that should be reported back to the client
    /// connection rather than only logged.
    #[must_use]
    pub const fn is_client_facing(&self) -> bool {
        matches!(
            self,
            Self::Authentication(_)
                | Self::Authorization { .. }
                | Self::MalformedMessage(_)
                | Self::InvalidEvent(_)
        )
    }
}
