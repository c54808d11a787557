//! Pub/sub transport seam.
//!
//! [`EventTransport`] abstracts the at-least-once, topic-based backend the
//! broker forwards events through. The gateway binary wires
//! [`InProcessTransport`]; a networked backend (e.g. Redis pub/sub) slots in
//! behind the same trait without touching the broker.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RealtimeError;

/// A raw message delivered by the transport to the broker's dispatch loop.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the message was published on.
    pub channel: String,
    /// Serialized event payload.
    pub payload: String,
}

/// Topic-based pub/sub transport used by the broker.
///
/// Implementations must be safe for concurrent use; the broker calls
/// `publish` from many tasks at once.
#[async_trait]
pub trait EventTransport: Send + Sync + std::fmt::Debug {
    /// Establishes the transport connection. Called once at startup;
    /// failure is fatal to the process.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::TransportUnavailable`] if the backend
    /// cannot be reached.
    async fn connect(&self) -> Result<(), RealtimeError>;

    /// Tears the connection down. Called once at shutdown.
    async fn disconnect(&self);

    /// Forwards a serialized event to the given topic.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::TransportUnavailable`] if the backend is
    /// not connected or the delivery loop has gone away.
    async fn publish(&self, channel: &str, payload: String) -> Result<(), RealtimeError>;

    /// Issues a topic-level subscription. The broker calls this exactly
    /// once per channel, when the first local handler registers.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::TransportUnavailable`] if the backend is
    /// not connected.
    async fn subscribe(&self, channel: &str) -> Result<(), RealtimeError>;

    /// Drops a topic-level subscription once no local handlers remain.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::TransportUnavailable`] if the backend is
    /// not connected.
    async fn unsubscribe(&self, channel: &str) -> Result<(), RealtimeError>;

    /// Hands the delivery stream to the broker's dispatch loop. Yields
    /// `Some` exactly once; later calls return `None`.
    fn take_delivery_stream(&self) -> Option<mpsc::UnboundedReceiver<Delivery>>;
}

/// In-process transport: published messages loop back to this process's
/// own dispatch stream when the topic is subscribed.
///
/// Mirrors the single-process semantics of a topic backend — a message on
/// an unsubscribed topic is simply not delivered here.
#[derive(Debug)]
pub struct InProcessTransport {
    connected: AtomicBool,
    topics: Mutex<HashSet<String>>,
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl InProcessTransport {
    /// Creates a disconnected in-process transport.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            connected: AtomicBool::new(false),
            topics: Mutex::new(HashSet::new()),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    fn ensure_connected(&self) -> Result<(), RealtimeError> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RealtimeError::TransportUnavailable(
                "transport not connected".to_string(),
            ))
        }
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventTransport for InProcessTransport {
    async fn connect(&self) -> Result<(), RealtimeError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<(), RealtimeError> {
        self.ensure_connected()?;
        let subscribed = {
            let topics = self
                .topics
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            topics.contains(channel)
        };
        if !subscribed {
            // No local subscription for this topic; nothing to deliver.
            return Ok(());
        }
        self.tx
            .send(Delivery {
                channel: channel.to_string(),
                payload,
            })
            .map_err(|_| {
                RealtimeError::TransportUnavailable("delivery loop stopped".to_string())
            })
    }

    async fn subscribe(&self, channel: &str) -> Result<(), RealtimeError> {
        self.ensure_connected()?;
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        topics.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), RealtimeError> {
        self.ensure_connected()?;
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        topics.remove(channel);
        Ok(())
    }

    fn take_delivery_stream(&self) -> Option<mpsc::UnboundedReceiver<Delivery>> {
        self.rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}
