//! Event model and well-known channel names.
//!
//! Business collaborators build an [`EventDraft`]; the broker stamps the
//! publish-time timestamp and turns it into an [`Event`]. Callers never
//! control `timestamp` — the field does not exist on the draft.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known channel names used by collaborators across the platform.
pub mod channels {
    /// DSAR lifecycle updates (status changes, assignments, deadlines).
    pub const DSAR_UPDATES: &str = "dsar:updates";
    /// Risk assessment alerts.
    pub const RISK_ALERTS: &str = "risk:alerts";
    /// GDPR record notifications.
    pub const GDPR_NOTIFICATIONS: &str = "gdpr:notifications";
    /// Policy lifecycle changes (draft, review, published, archived).
    pub const POLICY_CHANGES: &str = "policy:changes";
    /// Platform-wide system notifications.
    pub const SYSTEM_NOTIFICATIONS: &str = "system:notifications";
    /// Per-user activity feed.
    pub const USER_ACTIVITY: &str = "user:activity";
    /// Aggregate dashboard metrics broadcasts.
    pub const DASHBOARD_METRICS: &str = "dashboard:metrics";
    /// Compliance threshold alerts.
    pub const COMPLIANCE_ALERTS: &str = "compliance:alerts";

    /// Every well-known channel, in declaration order.
    pub const ALL: &[&str] = &[
        DSAR_UPDATES,
        RISK_ALERTS,
        GDPR_NOTIFICATIONS,
        POLICY_CHANGES,
        SYSTEM_NOTIFICATIONS,
        USER_ACTIVITY,
        DASHBOARD_METRICS,
        COMPLIANCE_ALERTS,
    ];
}

/// An event as published by a business collaborator, before the broker
/// assigns the timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    /// Event type discriminator (e.g. `dsar_status_changed`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Variant-specific payload.
    pub payload: serde_json::Value,
    /// User the event concerns, if any.
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Optional free-form metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl EventDraft {
    /// Creates a draft with just a type and payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            user_id: None,
            metadata: None,
        }
    }

    /// Attaches a user id to the draft.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attaches metadata to the draft.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A published event, timestamp assigned by the broker at publish time.
///
/// Serializes to the wire frame delivered to WebSocket clients:
/// `{"type": ..., "payload": ..., "userId"?: ..., "timestamp": ...,
/// "metadata"?: ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event type discriminator.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Variant-specific payload.
    pub payload: serde_json::Value,
    /// User the event concerns, if any.
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Publish-time timestamp, assigned by the broker.
    pub timestamp: DateTime<Utc>,
    /// Optional free-form metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Event {
    /// Stamps a draft with the current time, producing a publishable event.
    #[must_use]
    pub fn stamp(draft: EventDraft) -> Self {
        Self {
            event_type: draft.event_type,
            payload: draft.payload,
            user_id: draft.user_id,
            timestamp: Utc::now(),
            metadata: draft.metadata,
        }
    }
}
