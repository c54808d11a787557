//! Per-connection state machine and delivery plumbing.
//!
//! Each WebSocket connection runs one read loop plus one writer task fed by
//! a bounded outbound queue, so replies and fanned-out events never
//! interleave mid-frame. A malformed inbound frame never drops the
//! connection; a full outbound queue does (slow consumers are closed, never
//! backpressured upstream to the publisher).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Notify;
use tokio::sync::mpsc;

use super::messages::{
    AuthenticatedPayload, ChannelRef, InboundFrame, OutboundFrame, StatusPayload,
};
use crate::app_state::AppState;
use crate::auth::Identity;
use crate::domain::{ConnectionId, Event, SubscriptionHandle};
use crate::error::RealtimeError;

/// Lifecycle phase of a connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Socket open, no identity presented yet.
    Connected,
    /// Identity verified; may subscribe to permitted channels.
    Authenticated,
    /// Socket gone; all subscriptions removed.
    Closed,
}

/// Mutable state owned by one connection's read loop.
#[derive(Debug)]
pub struct ConnectionState {
    /// Connection id, stable for the life of the socket.
    pub id: ConnectionId,
    /// Current lifecycle phase.
    pub phase: Phase,
    /// Verified identity, present once authenticated.
    pub identity: Option<Identity>,
    /// When the socket was accepted.
    pub created_at: DateTime<Utc>,
    /// Last inbound frame time.
    pub last_activity_at: DateTime<Utc>,
    handles: HashMap<String, SubscriptionHandle>,
    out_tx: mpsc::Sender<String>,
    overflow: Arc<Notify>,
}

impl ConnectionState {
    fn new(id: ConnectionId, out_tx: mpsc::Sender<String>, overflow: Arc<Notify>) -> Self {
        let now = Utc::now();
        Self {
            id,
            phase: Phase::Connected,
            identity: None,
            created_at: now,
            last_activity_at: now,
            handles: HashMap::new(),
            out_tx,
            overflow,
        }
    }

    /// Builds the fan-out handler registered with the broker for one
    /// channel: serialize the event frame and fire-and-forget it into the
    /// outbound queue. Overflow wakes the read loop to close the
    /// connection.
    fn delivery_handler(&self) -> impl Fn(Event) + Send + Sync + 'static {
        let tx = self.out_tx.clone();
        let overflow = Arc::clone(&self.overflow);
        move |event: Event| {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::error!(error = %err, "event frame serialization failed");
                    return;
                }
            };
            match tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: close rather than backpressure.
                    overflow.notify_one();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }
}

/// Runs the read loop for one WebSocket connection until the socket closes
/// or its outbound queue overflows, then cascades registry and broker
/// cleanup.
pub async fn run_connection(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let id = ConnectionId::new();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.ws_outbound_queue);
    let overflow = Arc::new(Notify::new());

    // Single logical writer per connection.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut conn = ConnectionState::new(id, out_tx, Arc::clone(&overflow));
    state.registry.add_connection(id);
    tracing::debug!(connection = %id, "ws connection opened");

    if conn
        .out_tx
        .try_send(OutboundFrame::Welcome.to_json())
        .is_err()
    {
        cleanup(&mut conn, &state).await;
        return;
    }

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let mut queue_full = false;
                        for reply in handle_frame(&mut conn, &state, &text).await {
                            if conn.out_tx.try_send(reply.to_json()).is_err() {
                                queue_full = true;
                                break;
                            }
                        }
                        if queue_full {
                            tracing::warn!(connection = %id, "outbound queue overflow, closing");
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            () = overflow.notified() => {
                tracing::warn!(connection = %id, "outbound queue overflow, closing");
                break;
            }
        }
    }

    cleanup(&mut conn, &state).await;
    writer.abort();
}

/// Applies one inbound frame to the state machine, returning the replies.
///
/// Transitions follow the gateway table: `authenticate` moves Connected →
/// Authenticated, `subscribe`/`unsubscribe` require Authenticated, `ping`
/// and `get_status` work in any open phase, and a malformed frame yields an
/// `error` reply without touching the state.
pub async fn handle_frame(
    conn: &mut ConnectionState,
    state: &AppState,
    text: &str,
) -> Vec<OutboundFrame> {
    conn.last_activity_at = Utc::now();

    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            let err = RealtimeError::MalformedMessage(err.to_string());
            tracing::debug!(connection = %conn.id, error = %err, "malformed frame");
            return vec![OutboundFrame::error("Invalid message format")];
        }
    };

    match frame {
        InboundFrame::Authenticate { payload } => match state.verifier.verify(&payload.token) {
            Ok(identity) => {
                tracing::info!(
                    connection = %conn.id,
                    user = %identity.id,
                    role = %identity.role,
                    "connection authenticated"
                );
                conn.phase = Phase::Authenticated;
                conn.identity = Some(identity.clone());
                vec![OutboundFrame::Authenticated {
                    payload: AuthenticatedPayload { user: identity },
                }]
            }
            Err(err) => {
                tracing::debug!(connection = %conn.id, error = %err, "authentication rejected");
                vec![OutboundFrame::auth_error(err.to_string())]
            }
        },

        InboundFrame::Subscribe { payload } => subscribe(conn, state, payload.channel).await,

        InboundFrame::Unsubscribe { payload } => {
            if conn.phase != Phase::Authenticated {
                return vec![OutboundFrame::error("Authentication required")];
            }
            let channel = payload.channel;
            state.registry.remove_subscription(conn.id, &channel);
            if let Some(handle) = conn.handles.remove(&channel) {
                state.broker.unsubscribe(&channel, Some(&handle)).await;
            }
            tracing::debug!(connection = %conn.id, %channel, "unsubscribed");
            vec![OutboundFrame::Unsubscribed {
                payload: ChannelRef { channel },
            }]
        }

        InboundFrame::Ping { request_id } => vec![OutboundFrame::Pong { request_id }],

        InboundFrame::GetStatus { request_id } => vec![OutboundFrame::Status {
            request_id,
            payload: StatusPayload {
                connected: true,
                authenticated: conn.phase == Phase::Authenticated,
                subscriptions: state.registry.subscriptions(conn.id),
            },
        }],
    }
}

async fn subscribe(
    conn: &mut ConnectionState,
    state: &AppState,
    channel: String,
) -> Vec<OutboundFrame> {
    if conn.phase != Phase::Authenticated {
        return vec![OutboundFrame::error("Authentication required")];
    }
    let Some(identity) = conn.identity.as_ref() else {
        return vec![OutboundFrame::error("Authentication required")];
    };
    if channel.is_empty() {
        return vec![OutboundFrame::error("Channel required")];
    }
    if !identity.may_subscribe(&channel) {
        let err = RealtimeError::Authorization {
            channel: channel.clone(),
        };
        tracing::debug!(connection = %conn.id, %channel, "subscription denied");
        return vec![OutboundFrame::error(err.to_string())];
    }

    // Idempotent: a second subscribe to the same channel registers no
    // second delivery path.
    if state.registry.add_subscription(conn.id, &channel) {
        match state.broker.subscribe(&channel, conn.delivery_handler()).await {
            Ok(handle) => {
                conn.handles.insert(channel.clone(), handle);
            }
            Err(err) => {
                state.registry.remove_subscription(conn.id, &channel);
                tracing::warn!(connection = %conn.id, %channel, error = %err, "subscribe failed");
                return vec![OutboundFrame::error("Subscription failed")];
            }
        }
    }

    tracing::debug!(connection = %conn.id, %channel, "subscribed");
    vec![OutboundFrame::Subscribed {
        payload: ChannelRef { channel },
    }]
}

/// Terminal cleanup: removes every subscription atomically from the
/// registry and releases the matching broker handlers.
async fn cleanup(conn: &mut ConnectionState, state: &AppState) {
    conn.phase = Phase::Closed;
    for (channel, handle) in conn.handles.drain() {
        state.broker.unsubscribe(&channel, Some(&handle)).await;
    }
    let emptied = state.registry.remove_connection(conn.id);
    if !emptied.is_empty() {
        tracing::debug!(connection = %conn.id, channels = ?emptied, "channels released");
    }
    let lifetime = Utc::now().signed_duration_since(conn.created_at);
    tracing::debug!(
        connection = %conn.id,
        lifetime_secs = lifetime.num_seconds(),
        "ws connection closed"
    );
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::app_state::AppState;
    use crate::auth::{AuthenticationVerifier, Claims};
    use crate::domain::{ChannelBroker, ConnectionRegistry, EventDraft, InProcessTransport};
    use crate::service::{NullMetricsSource, PeriodicMetricsPublisher};
    use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
    use serde_json::json;
    use std::time::Duration;

    const SECRET: &str = "test-secret";

    async fn test_state() -> AppState {
        let transport = Arc::new(InProcessTransport::new());
        let broker = Arc::new(ChannelBroker::new(transport));
        let Ok(()) = broker.connect().await else {
            panic!("broker should connect");
        };
        let metrics = Arc::new(PeriodicMetricsPublisher::new(
            Arc::clone(&broker),
            Arc::new(NullMetricsSource),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        ));
        AppState {
            broker,
            registry: Arc::new(ConnectionRegistry::new()),
            verifier: Arc::new(AuthenticationVerifier::new(SECRET)),
            metrics,
            ws_outbound_queue: 8,
        }
    }

    fn test_conn(state: &AppState) -> (ConnectionState, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (out_tx, out_rx) = mpsc::channel(8);
        state.registry.add_connection(id);
        (
            ConnectionState::new(id, out_tx, Arc::new(Notify::new())),
            out_rx,
        )
    }

    fn token(role: &str, channels: Vec<String>) -> String {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        let claims = Claims {
            sub: "u1".to_string(),
            role: role.to_string(),
            channels,
            exp: now + 3600,
            iat: now,
        };
        let Ok(token) = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        ) else {
            panic!("token encoding should succeed");
        };
        token
    }

    fn frame_type(frame: &OutboundFrame) -> String {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&frame.to_json()) else {
            panic!("frame should serialize");
        };
        value
            .get("type")
            .and_then(|t| t.as_str())
            .map(ToString::to_string)
            .unwrap_or_default()
    }

    async fn authenticate(conn: &mut ConnectionState, state: &AppState, tok: &str) {
        let raw = json!({"type": "authenticate", "payload": {"token": tok}}).to_string();
        let replies = handle_frame(conn, state, &raw).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        assert_eq!(frame_type(reply), "authenticated");
    }

    #[tokio::test]
    async fn subscribe_before_auth_is_rejected() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);

        let raw = json!({"type": "subscribe", "payload": {"channel": "dsar:updates"}}).to_string();
        let replies = handle_frame(&mut conn, &state, &raw).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        assert_eq!(frame_type(reply), "error");
        assert!(reply.to_json().contains("Authentication required"));
        assert!(state.registry.subscriptions(conn.id).is_empty());
        assert_eq!(conn.phase, Phase::Connected);
    }

    #[tokio::test]
    async fn invalid_token_keeps_connection_open() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);

        let raw = json!({"type": "authenticate", "payload": {"token": "garbage"}}).to_string();
        let replies = handle_frame(&mut conn, &state, &raw).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        assert_eq!(frame_type(reply), "auth_error");
        assert_eq!(conn.phase, Phase::Connected);

        // A valid token afterwards still succeeds.
        authenticate(&mut conn, &state, &token("dpo", vec![])).await;
        assert_eq!(conn.phase, Phase::Authenticated);
    }

    #[tokio::test]
    async fn authorized_subscribe_registers_everywhere() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);
        authenticate(&mut conn, &state, &token("dpo", vec!["dsar:*".to_string()])).await;

        let raw = json!({"type": "subscribe", "payload": {"channel": "dsar:updates"}}).to_string();
        let replies = handle_frame(&mut conn, &state, &raw).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        assert_eq!(frame_type(reply), "subscribed");
        assert_eq!(state.registry.subscriptions(conn.id), vec!["dsar:updates"]);
        assert_eq!(state.broker.handler_count("dsar:updates").await, 1);
    }

    #[tokio::test]
    async fn unauthorized_channel_is_denied() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);
        authenticate(&mut conn, &state, &token("dpo", vec!["dsar:*".to_string()])).await;

        let raw = json!({"type": "subscribe", "payload": {"channel": "risk:alerts"}}).to_string();
        let replies = handle_frame(&mut conn, &state, &raw).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        assert_eq!(frame_type(reply), "error");
        assert!(state.registry.subscriptions(conn.id).is_empty());
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_idempotent() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);
        authenticate(&mut conn, &state, &token("admin", vec![])).await;

        let raw = json!({"type": "subscribe", "payload": {"channel": "policy:changes"}}).to_string();
        let _ = handle_frame(&mut conn, &state, &raw).await;
        let _ = handle_frame(&mut conn, &state, &raw).await;

        // One registry entry, one broker handler: no duplicate delivery.
        assert_eq!(state.registry.subscriptions(conn.id), vec!["policy:changes"]);
        assert_eq!(state.broker.handler_count("policy:changes").await, 1);
    }

    #[tokio::test]
    async fn unsubscribe_restores_parity() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);
        authenticate(&mut conn, &state, &token("admin", vec![])).await;

        let sub = json!({"type": "subscribe", "payload": {"channel": "risk:alerts"}}).to_string();
        let unsub =
            json!({"type": "unsubscribe", "payload": {"channel": "risk:alerts"}}).to_string();

        let _ = handle_frame(&mut conn, &state, &sub).await;
        let replies = handle_frame(&mut conn, &state, &unsub).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        assert_eq!(frame_type(reply), "unsubscribed");
        assert!(state.registry.subscriptions(conn.id).is_empty());
        assert_eq!(state.broker.handler_count("risk:alerts").await, 0);
    }

    #[tokio::test]
    async fn ping_echoes_request_id_in_any_phase() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);

        let raw = json!({"type": "ping", "requestId": "p1"}).to_string();
        let replies = handle_frame(&mut conn, &state, &raw).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        assert_eq!(frame_type(reply), "pong");
        assert!(reply.to_json().contains("\"requestId\":\"p1\""));
    }

    #[tokio::test]
    async fn get_status_reflects_state() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);

        let raw = json!({"type": "get_status", "requestId": "s1"}).to_string();
        let replies = handle_frame(&mut conn, &state, &raw).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&reply.to_json()) else {
            panic!("status frame should serialize");
        };
        assert_eq!(value.pointer("/payload/connected"), Some(&json!(true)));
        assert_eq!(value.pointer("/payload/authenticated"), Some(&json!(false)));

        authenticate(&mut conn, &state, &token("admin", vec![])).await;
        let sub = json!({"type": "subscribe", "payload": {"channel": "dsar:updates"}}).to_string();
        let _ = handle_frame(&mut conn, &state, &sub).await;

        let replies = handle_frame(&mut conn, &state, &raw).await;
        let Some(reply) = replies.first() else {
            panic!("expected a reply");
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&reply.to_json()) else {
            panic!("status frame should serialize");
        };
        assert_eq!(value.pointer("/payload/authenticated"), Some(&json!(true)));
        assert_eq!(
            value.pointer("/payload/subscriptions"),
            Some(&json!(["dsar:updates"]))
        );
    }

    #[tokio::test]
    async fn malformed_frame_keeps_connection_open() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);

        for raw in ["not json", "{\"type\":\"bogus\"}", "{}"] {
            let replies = handle_frame(&mut conn, &state, raw).await;
            let Some(reply) = replies.first() else {
                panic!("expected a reply");
            };
            assert_eq!(frame_type(reply), "error");
        }
        assert_eq!(conn.phase, Phase::Connected);

        // Session still works afterwards.
        authenticate(&mut conn, &state, &token("admin", vec![])).await;
    }

    #[tokio::test]
    async fn cleanup_removes_all_subscriptions() {
        let state = test_state().await;
        let (mut conn, _rx) = test_conn(&state);
        authenticate(&mut conn, &state, &token("admin", vec![])).await;

        for channel in ["dsar:updates", "risk:alerts"] {
            let raw = json!({"type": "subscribe", "payload": {"channel": channel}}).to_string();
            let _ = handle_frame(&mut conn, &state, &raw).await;
        }

        cleanup(&mut conn, &state).await;
        assert_eq!(conn.phase, Phase::Closed);
        assert_eq!(state.registry.connection_count(), 0);
        assert_eq!(state.broker.handler_count("dsar:updates").await, 0);
        assert_eq!(state.broker.handler_count("risk:alerts").await, 0);

        // Publishing to a channel the closed connection was on is harmless.
        state
            .broker
            .publish("dsar:updates", EventDraft::new("dsar_status_changed", json!({})))
            .await;
    }

    #[tokio::test]
    async fn delivery_lands_in_outbound_queue() {
        let state = test_state().await;
        let (mut conn, mut rx) = test_conn(&state);
        authenticate(&mut conn, &state, &token("admin", vec![])).await;

        let raw = json!({"type": "subscribe", "payload": {"channel": "dsar:updates"}}).to_string();
        let _ = handle_frame(&mut conn, &state, &raw).await;

        state
            .broker
            .publish(
                "dsar:updates",
                EventDraft::new("dsar_status_changed", json!({"dsarId": "d1"})),
            )
            .await;

        let Some(frame) = rx.recv().await else {
            panic!("expected event frame in outbound queue");
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&frame) else {
            panic!("event frame should be valid JSON");
        };
        assert_eq!(value.get("type"), Some(&json!("dsar_status_changed")));
        assert!(value.get("timestamp").is_some());
    }
}
