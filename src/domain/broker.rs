//! Channel broker: refcounted topic subscriptions and local fan-out.
//!
//! [`ChannelBroker`] sits between business collaborators and the pub/sub
//! transport. Publishing stamps the event timestamp and forwards to the
//! transport; the dispatch loop deserializes each delivery once and invokes
//! every local handler for the channel in isolation. Per channel there is at
//! most one transport-level subscription, no matter how many local handlers
//! are registered.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::event::{Event, EventDraft};
use super::transport::{Delivery, EventTransport};
use crate::error::RealtimeError;

/// Identifies one locally registered handler, enabling precise removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl HandlerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Returned by [`ChannelBroker::subscribe`]; identifies the registration
/// for later removal.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    /// Channel the handler is registered on.
    pub channel: String,
    /// Id of the registered handler.
    pub id: HandlerId,
}

type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;
type Registrations = HashMap<String, HashMap<HandlerId, EventHandler>>;

/// Pub/sub broker over an [`EventTransport`].
///
/// Process-wide singleton: constructed once at startup and injected into
/// every collaborator (gateway, metrics publisher, typed publishers).
pub struct ChannelBroker {
    transport: Arc<dyn EventTransport>,
    registrations: Arc<Mutex<Registrations>>,
    dispatch_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChannelBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBroker")
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl ChannelBroker {
    /// Creates a broker over the given transport. Call [`Self::connect`]
    /// before publishing or subscribing.
    #[must_use]
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self {
            transport,
            registrations: Arc::new(Mutex::new(HashMap::new())),
            dispatch_task: std::sync::Mutex::new(None),
        }
    }

    /// Connects the transport and starts the dispatch loop.
    ///
    /// Called once at startup. Failure here is the only fatal condition in
    /// the real-time subsystem.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::TransportUnavailable`] if the transport
    /// cannot connect, or [`RealtimeError::Internal`] if the dispatch loop
    /// was already started.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.transport.connect().await?;
        let Some(mut rx) = self.transport.take_delivery_stream() else {
            return Err(RealtimeError::Internal(
                "dispatch loop already started".to_string(),
            ));
        };

        let registrations = Arc::clone(&self.registrations);
        let task = tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                Self::dispatch(&registrations, delivery).await;
            }
            tracing::debug!("broker dispatch loop stopped");
        });

        let mut slot = self
            .dispatch_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *slot = Some(task);
        tracing::info!("channel broker connected");
        Ok(())
    }

    /// Stops the dispatch loop and disconnects the transport. Called once
    /// at shutdown.
    pub async fn disconnect(&self) {
        let task = {
            let mut slot = self
                .dispatch_task
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.transport.disconnect().await;
        tracing::info!("channel broker disconnected");
    }

    /// Publishes a draft event on a channel.
    ///
    /// Stamps the publish-time timestamp, serializes once, and forwards to
    /// the transport. Fire-and-forget relative to the business operation
    /// that triggered it: validation and transport failures are logged and
    /// swallowed, never surfaced to the caller.
    pub async fn publish(&self, channel: &str, draft: EventDraft) {
        if channel.is_empty() {
            tracing::warn!("publish rejected: empty channel");
            return;
        }
        if draft.event_type.is_empty() {
            tracing::warn!(channel, "publish rejected: empty event type");
            return;
        }

        let event = Event::stamp(draft);
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::error!(channel, error = %err, "event serialization failed");
                return;
            }
        };

        if let Err(err) = self.transport.publish(channel, payload).await {
            tracing::warn!(
                channel,
                event_type = %event.event_type,
                error = %err,
                "publish dropped: transport unavailable"
            );
        }
    }

    /// Registers a local handler for a channel.
    ///
    /// The first handler for a channel issues exactly one transport-level
    /// subscribe; the registration lock guards the refcount so concurrent
    /// subscribe/unsubscribe cannot race it.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidEvent`] for an empty channel name,
    /// or [`RealtimeError::TransportUnavailable`] if the transport-level
    /// subscribe fails.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: impl Fn(Event) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, RealtimeError> {
        if channel.is_empty() {
            return Err(RealtimeError::InvalidEvent("empty channel".to_string()));
        }

        let mut regs = self.registrations.lock().await;
        let first_for_channel = regs.get(channel).is_none_or(HashMap::is_empty);
        if first_for_channel {
            self.transport.subscribe(channel).await?;
        }

        let id = HandlerId::new();
        regs.entry(channel.to_string())
            .or_default()
            .insert(id, Arc::new(handler));

        tracing::debug!(channel, handler = ?id, "handler registered");
        Ok(SubscriptionHandle {
            channel: channel.to_string(),
            id,
        })
    }

    /// Removes one handler (via its handle) or every handler for the
    /// channel when `handle` is `None`. When the local set becomes empty
    /// the transport-level subscription is dropped.
    pub async fn unsubscribe(&self, channel: &str, handle: Option<&SubscriptionHandle>) {
        let mut regs = self.registrations.lock().await;
        let Some(handlers) = regs.get_mut(channel) else {
            return;
        };
        match handle {
            Some(handle) => {
                handlers.remove(&handle.id);
            }
            None => handlers.clear(),
        }
        if handlers.is_empty() {
            regs.remove(channel);
            if let Err(err) = self.transport.unsubscribe(channel).await {
                tracing::warn!(channel, error = %err, "transport unsubscribe failed");
            }
            tracing::debug!(channel, "last handler removed, channel released");
        }
    }

    /// Number of local handlers currently registered for a channel.
    pub async fn handler_count(&self, channel: &str) -> usize {
        let regs = self.registrations.lock().await;
        regs.get(channel).map_or(0, HashMap::len)
    }

    /// Deserializes a delivery once and invokes each handler for the
    /// channel independently. A panicking handler is caught and logged;
    /// siblings still run and the registration stays intact.
    async fn dispatch(registrations: &Mutex<Registrations>, delivery: Delivery) {
        let event: Event = match serde_json::from_str(&delivery.payload) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(
                    channel = %delivery.channel,
                    error = %err,
                    "dropping undecodable delivery"
                );
                return;
            }
        };

        // Snapshot the handler list so callbacks run outside the lock.
        let handlers: Vec<(HandlerId, EventHandler)> = {
            let regs = registrations.lock().await;
            regs.get(&delivery.channel)
                .map(|map| {
                    map.iter()
                        .map(|(id, handler)| (*id, Arc::clone(handler)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (id, handler) in handlers {
            let event = event.clone();
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                let err = RealtimeError::Callback(delivery.channel.clone());
                tracing::error!(handler = ?id, error = %err, "handler panicked during dispatch");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;
    use crate::domain::transport::InProcessTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    async fn connected_broker() -> Arc<ChannelBroker> {
        let transport = Arc::new(InProcessTransport::new());
        let broker = Arc::new(ChannelBroker::new(transport));
        let Ok(()) = broker.connect().await else {
            panic!("broker should connect");
        };
        broker
    }

    /// Transport that counts topic-level subscribe/unsubscribe calls.
    #[derive(Debug)]
    struct CountingTransport {
        inner: InProcessTransport,
        subscribes: AtomicUsize,
        unsubscribes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl EventTransport for CountingTransport {
        async fn connect(&self) -> Result<(), RealtimeError> {
            self.inner.connect().await
        }
        async fn disconnect(&self) {
            self.inner.disconnect().await;
        }
        async fn publish(&self, channel: &str, payload: String) -> Result<(), RealtimeError> {
            self.inner.publish(channel, payload).await
        }
        async fn subscribe(&self, channel: &str) -> Result<(), RealtimeError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            self.inner.subscribe(channel).await
        }
        async fn unsubscribe(&self, channel: &str) -> Result<(), RealtimeError> {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            self.inner.unsubscribe(channel).await
        }
        fn take_delivery_stream(&self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
            self.inner.take_delivery_stream()
        }
    }

    #[tokio::test]
    async fn publish_delivers_to_subscribed_handler() {
        let broker = connected_broker().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let Ok(_handle) = broker
            .subscribe("dsar:updates", move |event| {
                let _ = tx.send(event);
            })
            .await
        else {
            panic!("subscribe should succeed");
        };

        broker
            .publish(
                "dsar:updates",
                EventDraft::new("dsar_status_changed", json!({"dsarId": "d1"})),
            )
            .await;

        let Some(event) = rx.recv().await else {
            panic!("expected delivery");
        };
        assert_eq!(event.event_type, "dsar_status_changed");
        assert_eq!(event.payload, json!({"dsarId": "d1"}));
    }

    #[tokio::test]
    async fn one_transport_subscription_per_channel() {
        let transport = Arc::new(CountingTransport {
            inner: InProcessTransport::new(),
            subscribes: AtomicUsize::new(0),
            unsubscribes: AtomicUsize::new(0),
        });
        let broker = ChannelBroker::new(Arc::clone(&transport) as Arc<dyn EventTransport>);
        let Ok(()) = broker.connect().await else {
            panic!("broker should connect");
        };

        let Ok(h1) = broker.subscribe("risk:alerts", |_| {}).await else {
            panic!("first subscribe should succeed");
        };
        let Ok(h2) = broker.subscribe("risk:alerts", |_| {}).await else {
            panic!("second subscribe should succeed");
        };
        assert_eq!(transport.subscribes.load(Ordering::SeqCst), 1);
        assert_eq!(broker.handler_count("risk:alerts").await, 2);

        broker.unsubscribe("risk:alerts", Some(&h1)).await;
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 0);

        broker.unsubscribe("risk:alerts", Some(&h2)).await;
        assert_eq!(transport.unsubscribes.load(Ordering::SeqCst), 1);
        assert_eq!(broker.handler_count("risk:alerts").await, 0);
    }

    #[tokio::test]
    async fn unsubscribe_all_releases_channel() {
        let broker = connected_broker().await;
        let Ok(_h1) = broker.subscribe("policy:changes", |_| {}).await else {
            panic!("subscribe should succeed");
        };
        let Ok(_h2) = broker.subscribe("policy:changes", |_| {}).await else {
            panic!("subscribe should succeed");
        };

        broker.unsubscribe("policy:changes", None).await;
        assert_eq!(broker.handler_count("policy:changes").await, 0);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_starve_siblings() {
        let broker = connected_broker().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let Ok(_bad) = broker
            .subscribe("gdpr:notifications", |_| panic!("handler bug"))
            .await
        else {
            panic!("subscribe should succeed");
        };
        let Ok(_good) = broker
            .subscribe("gdpr:notifications", move |event| {
                let _ = tx.send(event);
            })
            .await
        else {
            panic!("subscribe should succeed");
        };

        broker
            .publish(
                "gdpr:notifications",
                EventDraft::new("record_created", json!({})),
            )
            .await;

        let Some(event) = rx.recv().await else {
            panic!("surviving handler should still receive the event");
        };
        assert_eq!(event.event_type, "record_created");
        // Registration is intact after the panic.
        assert_eq!(broker.handler_count("gdpr:notifications").await, 2);
    }

    #[tokio::test]
    async fn publish_stamps_timestamp_over_caller_input() {
        let broker = connected_broker().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let Ok(_handle) = broker
            .subscribe("user:activity", move |event| {
                let _ = tx.send(event);
            })
            .await
        else {
            panic!("subscribe should succeed");
        };

        let before = chrono::Utc::now();
        broker
            .publish("user:activity", EventDraft::new("login", json!({})))
            .await;
        let Some(event) = rx.recv().await else {
            panic!("expected delivery");
        };
        assert!(event.timestamp >= before);
    }

    #[tokio::test]
    async fn invalid_publish_is_swallowed() {
        let broker = connected_broker().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let Ok(_handle) = broker
            .subscribe("system:notifications", move |event| {
                let _ = tx.send(event);
            })
            .await
        else {
            panic!("subscribe should succeed");
        };

        // Empty event type and empty channel are both rejected pre-transport.
        broker
            .publish("system:notifications", EventDraft::new("", json!({})))
            .await;
        broker.publish("", EventDraft::new("ok", json!({}))).await;

        broker
            .publish("system:notifications", EventDraft::new("real", json!({})))
            .await;
        let Some(event) = rx.recv().await else {
            panic!("valid event should still arrive");
        };
        assert_eq!(event.event_type, "real");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscribe_empty_channel_rejected() {
        let broker = connected_broker().await;
        let result = broker.subscribe("", |_| {}).await;
        assert!(matches!(result, Err(RealtimeError::InvalidEvent(_))));
    }
}
