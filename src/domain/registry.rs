//! Connection registry: live connections and their channel subscriptions.
//!
//! Dual index (`connection -> channels` and `channel -> connections`) kept
//! behind a single mutex so no caller can observe a half-updated state.
//! Connection close is an atomic removal of all its subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use uuid::Uuid;

/// Identifies one live WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh connection id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Default)]
struct Indexes {
    by_connection: HashMap<ConnectionId, HashSet<String>>,
    by_channel: HashMap<String, HashSet<ConnectionId>>,
}

/// Concurrency-safe bookkeeping of connections and (connection, channel)
/// subscriptions.
///
/// The registry references connections; it never owns them. Ownership of
/// the socket and its state machine stays with the gateway's per-connection
/// task.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    indexes: Mutex<Indexes>,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Indexes> {
        self.indexes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Registers a connection with no subscriptions.
    pub fn add_connection(&self, connection: ConnectionId) {
        let mut idx = self.lock();
        idx.by_connection.entry(connection).or_default();
    }

    /// Removes a connection and all of its subscriptions atomically.
    ///
    /// Returns the channels that no longer have any subscribed connection,
    /// so the caller can release the matching broker subscriptions.
    pub fn remove_connection(&self, connection: ConnectionId) -> Vec<String> {
        let mut idx = self.lock();
        let channels = idx.by_connection.remove(&connection).unwrap_or_default();
        let mut emptied = Vec::new();
        for channel in channels {
            if let Some(members) = idx.by_channel.get_mut(&channel) {
                members.remove(&connection);
                if members.is_empty() {
                    idx.by_channel.remove(&channel);
                    emptied.push(channel);
                }
            }
        }
        emptied
    }

    /// Records a subscription. Idempotent: returns `false` when the pair
    /// already existed (and no duplicate delivery path must be created) or
    /// when the connection is unknown.
    pub fn add_subscription(&self, connection: ConnectionId, channel: &str) -> bool {
        let mut idx = self.lock();
        let Some(channels) = idx.by_connection.get_mut(&connection) else {
            return false;
        };
        if !channels.insert(channel.to_string()) {
            return false;
        }
        idx.by_channel
            .entry(channel.to_string())
            .or_default()
            .insert(connection);
        true
    }

    /// Removes a subscription. Returns `true` if the channel now has no
    /// subscribed connections at all.
    pub fn remove_subscription(&self, connection: ConnectionId, channel: &str) -> bool {
        let mut idx = self.lock();
        if let Some(channels) = idx.by_connection.get_mut(&connection) {
            channels.remove(channel);
        }
        if let Some(members) = idx.by_channel.get_mut(channel) {
            members.remove(&connection);
            if members.is_empty() {
                idx.by_channel.remove(channel);
                return true;
            }
        }
        false
    }

    /// Channels the connection is currently subscribed to, sorted for
    /// stable presentation in status frames.
    pub fn subscriptions(&self, connection: ConnectionId) -> Vec<String> {
        let idx = self.lock();
        let mut channels: Vec<String> = idx
            .by_connection
            .get(&connection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    /// Connections currently subscribed to a channel.
    pub fn connections_on(&self, channel: &str) -> Vec<ConnectionId> {
        let idx = self.lock();
        idx.by_channel
            .get(channel)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.lock().by_connection.len()
    }
}
