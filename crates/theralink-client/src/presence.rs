use std::collections::{HashMap, HashSet};

use tokio::sync::watch;
use uuid::Uuid;

use theralink_types::events::GatewayEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
    /// Not subscribed, or no snapshot yet. Never reported as offline.
    Unknown,
}

/// Presence changes as the tracker consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Sync { revision: u64, users: Vec<Uuid> },
    Join { revision: u64, user: Uuid },
    Leave { revision: u64, user: Uuid },
}

impl PresenceEvent {
    pub fn from_gateway(event: &GatewayEvent) -> Option<Self> {
        match event {
            GatewayEvent::PresenceSync { revision, users } => Some(Self::Sync {
                revision: *revision,
                users: users.clone(),
            }),
            GatewayEvent::PresenceJoin { revision, user_id } => Some(Self::Join {
                revision: *revision,
                user: *user_id,
            }),
            GatewayEvent::PresenceLeave { revision, user_id } => Some(Self::Leave {
                revision: *revision,
                user: *user_id,
            }),
            _ => None,
        }
    }
}

/// What the UI sees of presence. Published through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceSnapshot {
    pub state: ConnectionState,
    /// Revision of the last applied sync, `None` until one arrives.
    pub revision: Option<u64>,
    pub online: HashSet<Uuid>,
}

impl PresenceSnapshot {
    fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            revision: None,
            online: HashSet::new(),
        }
    }

    pub fn status(&self, user: Uuid) -> PresenceStatus {
        if self.state != ConnectionState::Subscribed || self.revision.is_none() {
            return PresenceStatus::Unknown;
        }
        if self.online.contains(&user) {
            PresenceStatus::Online
        } else {
            PresenceStatus::Offline
        }
    }
}

/// Single owner of the client's online set.
///
/// A sync replaces the baseline. Incremental joins and leaves apply on top of
/// it and are remembered per user, so a sync that was computed before a newer
/// incremental event does not undo that event.
pub struct PresenceTracker {
    snapshot: PresenceSnapshot,
    /// Newest incremental event per user: (revision, online).
    latest: HashMap<Uuid, (u64, bool)>,
    tx: watch::Sender<PresenceSnapshot>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        let snapshot = PresenceSnapshot::disconnected();
        let (tx, _) = watch::channel(snapshot.clone());
        Self {
            snapshot,
            latest: HashMap::new(),
            tx,
        }
    }

    /// Read-only view for the UI.
    pub fn watch(&self) -> watch::Receiver<PresenceSnapshot> {
        self.tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.state
    }

    pub fn status(&self, user: Uuid) -> PresenceStatus {
        self.snapshot.status(user)
    }

    pub fn set_connecting(&mut self) {
        self.snapshot = PresenceSnapshot {
            state: ConnectionState::Connecting,
            ..PresenceSnapshot::disconnected()
        };
        self.latest.clear();
        self.publish();
    }

    /// Returns `true` on the transition into `Subscribed`, when the caller
    /// must send `track`.
    pub fn set_subscribed(&mut self) -> bool {
        if self.snapshot.state != ConnectionState::Connecting {
            return false;
        }
        self.snapshot.state = ConnectionState::Subscribed;
        self.publish();
        true
    }

    /// Forget everything. Status reads `Unknown` until the next sync.
    pub fn disconnect(&mut self) {
        self.snapshot = PresenceSnapshot::disconnected();
        self.latest.clear();
        self.publish();
    }

    /// Apply one event. Returns `true` when the online set changed.
    pub fn apply(&mut self, event: PresenceEvent) -> bool {
        if self.snapshot.state == ConnectionState::Disconnected {
            return false;
        }

        let before = self.snapshot.clone();
        match event {
            PresenceEvent::Sync { revision, users } => {
                if self.snapshot.revision.is_some_and(|base| revision < base) {
                    return false;
                }
                self.snapshot.revision = Some(revision);
                self.snapshot.online = users.into_iter().collect();

                self.latest.retain(|_, (rev, _)| *rev > revision);
                for (user, (_, online)) in &self.latest {
                    if *online {
                        self.snapshot.online.insert(*user);
                    } else {
                        self.snapshot.online.remove(user);
                    }
                }
            }
            PresenceEvent::Join { revision, user } => self.incremental(revision, user, true),
            PresenceEvent::Leave { revision, user } => self.incremental(revision, user, false),
        }

        let changed = self.snapshot != before;
        if changed {
            self.publish();
        }
        changed
    }

    fn incremental(&mut self, revision: u64, user: Uuid, online: bool) {
        if self.snapshot.revision.is_some_and(|base| revision <= base) {
            return;
        }
        if self.latest.get(&user).is_some_and(|(rev, _)| *rev >= revision) {
            return;
        }
        self.latest.insert(user, (revision, online));

        // Before the first sync there is no baseline to apply to yet
        if self.snapshot.revision.is_none() {
            return;
        }
        if online {
            self.snapshot.online.insert(user);
        } else {
            self.snapshot.online.remove(&user);
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot.clone());
    }
}
