//! Typed convenience publishers for the well-known channels.
//!
//! Thin argument-shaping layers over [`ChannelBroker::publish`]; every
//! method inherits the broker's fire-and-forget policy and never surfaces
//! transport failures to the business operation that triggered it.

use std::sync::Arc;

use serde_json::json;

use crate::domain::{ChannelBroker, EventDraft, channels};

/// Collaborator-facing publisher handed to the rest of the platform.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    broker: Arc<ChannelBroker>,
}

impl EventPublisher {
    /// Wraps the process-wide broker.
    #[must_use]
    pub fn new(broker: Arc<ChannelBroker>) -> Self {
        Self { broker }
    }

    /// Publishes an arbitrary draft on an arbitrary channel.
    pub async fn publish(&self, channel: &str, draft: EventDraft) {
        self.broker.publish(channel, draft).await;
    }

    /// A DSAR moved to a new status.
    pub async fn dsar_status_changed(&self, dsar_id: &str, status: &str, user_id: Option<&str>) {
        let mut draft = EventDraft::new(
            "dsar_status_changed",
            json!({ "dsarId": dsar_id, "status": status }),
        );
        if let Some(user_id) = user_id {
            draft = draft.with_user(user_id);
        }
        self.broker.publish(channels::DSAR_UPDATES, draft).await;
    }

    /// A risk assessment crossed an alerting threshold.
    pub async fn risk_alert(&self, risk_id: &str, severity: &str, title: &str) {
        self.broker
            .publish(
                channels::RISK_ALERTS,
                EventDraft::new(
                    "risk_alert",
                    json!({ "riskId": risk_id, "severity": severity, "title": title }),
                ),
            )
            .await;
    }

    /// A GDPR processing record changed.
    pub async fn gdpr_notification(&self, record_id: &str, action: &str) {
        self.broker
            .publish(
                channels::GDPR_NOTIFICATIONS,
                EventDraft::new(
                    "gdpr_record_changed",
                    json!({ "recordId": record_id, "action": action }),
                ),
            )
            .await;
    }

    /// A policy moved through its lifecycle.
    pub async fn policy_changed(&self, policy_id: &str, status: &str) {
        self.broker
            .publish(
                channels::POLICY_CHANGES,
                EventDraft::new(
                    "policy_changed",
                    json!({ "policyId": policy_id, "status": status }),
                ),
            )
            .await;
    }

    /// Platform-wide operator notification.
    pub async fn system_notification(&self, message: &str, level: &str) {
        self.broker
            .publish(
                channels::SYSTEM_NOTIFICATIONS,
                EventDraft::new(
                    "system_notification",
                    json!({ "message": message, "level": level }),
                ),
            )
            .await;
    }

    /// Activity on a user's own feed.
    pub async fn user_activity(&self, user_id: &str, action: &str) {
        self.broker
            .publish(
                channels::USER_ACTIVITY,
                EventDraft::new("user_activity", json!({ "action": action })).with_user(user_id),
            )
            .await;
    }

    /// Compliance threshold breached.
    pub async fn compliance_alert(&self, area: &str, score: f64) {
        self.broker
            .publish(
                channels::COMPLIANCE_ALERTS,
                EventDraft::new(
                    "compliance_alert",
                    json!({ "area": area, "score": score }),
                ),
            )
            .await;
    }
}
