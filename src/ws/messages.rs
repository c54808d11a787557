//! WebSocket control frames: one JSON object per text frame.

use serde::{Deserialize, Serialize};

use crate::auth::Identity;

/// Client → server control frames.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// Present a bearer token.
    Authenticate {
        /// Token payload.
        payload: AuthenticatePayload,
    },
    /// Join a channel.
    Subscribe {
        /// Channel payload.
        payload: ChannelRef,
    },
    /// Leave a channel.
    Unsubscribe {
        /// Channel payload.
        payload: ChannelRef,
    },
    /// Liveness probe; the reply echoes `requestId`.
    Ping {
        /// Correlation id echoed back in the pong.
        #[serde(rename = "requestId")]
        request_id: Option<String>,
    },
    /// Ask for the connection's current state.
    GetStatus {
        /// Correlation id echoed back in the status reply.
        #[serde(rename = "requestId")]
        request_id: Option<String>,
    },
}

/// Payload of an `authenticate` frame.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthenticatePayload {
    /// Opaque bearer token.
    pub token: String,
}

/// A `{ "channel": ... }` payload, used by several frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRef {
    /// Channel name.
    pub channel: String,
}

/// Server → client control frames. Event frames are serialized separately
/// from [`crate::domain::Event`], with the event type in the `type` slot.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Sent immediately on connect.
    Welcome,
    /// Token accepted; carries the verified identity.
    Authenticated {
        /// Identity payload.
        payload: AuthenticatedPayload,
    },
    /// Token rejected. The connection stays open.
    AuthError {
        /// Failure message.
        payload: MessagePayload,
    },
    /// Subscription confirmed.
    Subscribed {
        /// Channel payload.
        payload: ChannelRef,
    },
    /// Unsubscription confirmed.
    Unsubscribed {
        /// Channel payload.
        payload: ChannelRef,
    },
    /// Reply to `ping`.
    Pong {
        /// Correlation id from the ping, if one was supplied.
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    /// Reply to `get_status`.
    Status {
        /// Correlation id from the request, if one was supplied.
        #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        /// Current connection state.
        payload: StatusPayload,
    },
    /// Non-fatal error report (authorization denied, malformed frame, ...).
    Error {
        /// Failure message.
        payload: MessagePayload,
    },
}

/// A `{ "message": ... }` payload.
#[derive(Debug, Clone, Serialize)]
pub struct MessagePayload {
    /// Human-readable message.
    pub message: String,
}

/// Payload of an `authenticated` frame.
#[derive(Debug, Clone, Serialize)]
pub struct AuthenticatedPayload {
    /// The verified identity.
    pub user: Identity,
}

/// Payload of a `status` frame.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPayload {
    /// Always `true` for a live connection.
    pub connected: bool,
    /// Whether the connection has authenticated.
    pub authenticated: bool,
    /// Channels currently subscribed, sorted.
    pub subscriptions: Vec<String>,
}

impl OutboundFrame {
    /// Builds an `error` frame with the given message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            payload: MessagePayload {
                message: message.into(),
            },
        }
    }

    /// Builds an `auth_error` frame with the given message.
    #[must_use]
    pub fn auth_error(message: impl Into<String>) -> Self {
        Self::AuthError {
            payload: MessagePayload {
                message: message.into(),
            },
        }
    }

    /// Serializes the frame to its wire form.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","payload":{"message":"frame serialization failed"}}"#.to_string()
        })
    }
}
