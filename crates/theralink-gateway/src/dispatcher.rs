use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use theralink_types::events::GatewayEvent;

use crate::presence::PresenceRegistry;

pub const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// An event serialized once for fan-out to every connection.
#[derive(Debug, Clone)]
pub struct Broadcast {
    /// `Some` for events only subscribers of that conversation should see.
    pub conversation_id: Option<Uuid>,
    pub json: Arc<str>,
}

/// Manages all connected clients, presence, and event fan-out.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Broadcast channel for gateway events; each connection filters by its subscriptions
    broadcast_tx: broadcast::Sender<Broadcast>,

    /// Tracked connections per user, with the presence revision counter
    presence: RwLock<PresenceRegistry>,

    /// Per-connection targeted send channels: user_id -> (conn_id -> sender)
    connections: RwLock<HashMap<Uuid, HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                presence: RwLock::new(PresenceRegistry::new()),
                connections: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Subscribe to gateway events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients. Delivery is best-effort:
    /// with no receivers the event is simply dropped.
    pub fn broadcast(&self, event: GatewayEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode gateway event: {}", e);
                return;
            }
        };

        let _ = self.inner.broadcast_tx.send(Broadcast {
            conversation_id: event.conversation_id(),
            json: json.into(),
        });
    }

    /// Register a targeted channel for a new connection. Returns (conn_id, receiver).
    pub async fn register_connection(
        &self,
        user_id: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .connections
            .write()
            .await
            .entry(user_id)
            .or_default()
            .insert(conn_id, tx);
        (conn_id, rx)
    }

    async fn unregister_connection(&self, user_id: Uuid, conn_id: Uuid) {
        let mut connections = self.inner.connections.write().await;
        if let Some(conns) = connections.get_mut(&user_id) {
            conns.remove(&conn_id);
            if conns.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    /// Send a targeted event to every connection of a user.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(conns) = connections.get(&user_id) {
            for tx in conns.values() {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Send a targeted event to one connection.
    pub async fn send_to_connection(&self, user_id: Uuid, conn_id: Uuid, event: GatewayEvent) {
        let connections = self.inner.connections.read().await;
        if let Some(tx) = connections.get(&user_id).and_then(|c| c.get(&conn_id)) {
            let _ = tx.send(event);
        }
    }

    /// Announce a connection as present. Broadcasts `PresenceJoin` when this
    /// is the user's first tracked connection, then hands the connection a
    /// full `PresenceSync` snapshot.
    pub async fn track(&self, user_id: Uuid, conn_id: Uuid) {
        let snapshot = {
            // Held across the broadcast so revisions go out in order
            let mut presence = self.inner.presence.write().await;
            if let Some(revision) = presence.track(user_id, conn_id) {
                debug!("{} online at presence revision {}", user_id, revision);
                self.broadcast(GatewayEvent::PresenceJoin { revision, user_id });
            }
            presence.snapshot()
        };

        let (revision, users) = snapshot;
        self.send_to_connection(user_id, conn_id, GatewayEvent::PresenceSync { revision, users })
            .await;
    }

    /// Tear down a connection. Broadcasts `PresenceLeave` when it was the
    /// user's last tracked connection.
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) {
        {
            let mut presence = self.inner.presence.write().await;
            if let Some(revision) = presence.untrack(user_id, conn_id) {
                debug!("{} offline at presence revision {}", user_id, revision);
                self.broadcast(GatewayEvent::PresenceLeave { revision, user_id });
            }
        }

        self.unregister_connection(user_id, conn_id).await;
    }

    /// Get list of online users.
    pub async fn online_users(&self) -> Vec<Uuid> {
        self.inner.presence.read().await.snapshot().1
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.presence.read().await.is_online(user_id)
    }

    /// Number of live connections across all users.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.read().await.values().map(HashMap::len).sum()
    }
}
