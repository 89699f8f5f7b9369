use std::collections::{HashMap, HashSet};

use uuid::Uuid;

/// Server-side presence: which users have at least one tracked connection.
///
/// Every online/offline transition bumps `revision`, so observers can tell a
/// stale snapshot from a newer incremental event.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    connections: HashMap<Uuid, HashSet<Uuid>>,
    revision: u64,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. Returns the new revision if the user just came online.
    pub fn track(&mut self, user_id: Uuid, conn_id: Uuid) -> Option<u64> {
        let conns = self.connections.entry(user_id).or_default();
        let was_offline = conns.is_empty();
        conns.insert(conn_id);

        if was_offline {
            self.revision += 1;
            Some(self.revision)
        } else {
            None
        }
    }

    /// Forget a connection. Returns the new revision if it was the user's last one.
    pub fn untrack(&mut self, user_id: Uuid, conn_id: Uuid) -> Option<u64> {
        let conns = self.connections.get_mut(&user_id)?;
        if !conns.remove(&conn_id) {
            return None;
        }
        if !conns.is_empty() {
            return None;
        }

        self.connections.remove(&user_id);
        self.revision += 1;
        Some(self.revision)
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Online users as of the current revision, sorted for stable output.
    pub fn snapshot(&self) -> (u64, Vec<Uuid>) {
        let mut users: Vec<Uuid> = self.connections.keys().copied().collect();
        users.sort();
        (self.revision, users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_tab_does_not_rejoin() {
        let mut reg = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let (tab1, tab2) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(reg.track(user, tab1), Some(1));
        assert_eq!(reg.track(user, tab2), None);

        assert_eq!(reg.untrack(user, tab1), None);
        assert!(reg.is_online(user));
        assert_eq!(reg.untrack(user, tab2), Some(2));
        assert!(!reg.is_online(user));
    }

    #[test]
    fn untracking_unknown_connection_is_ignored() {
        let mut reg = PresenceRegistry::new();
        let user = Uuid::new_v4();
        reg.track(user, Uuid::new_v4());

        assert_eq!(reg.untrack(user, Uuid::new_v4()), None);
        assert_eq!(reg.untrack(Uuid::new_v4(), Uuid::new_v4()), None);
        assert_eq!(reg.revision(), 1);
    }

    #[test]
    fn snapshot_carries_revision() {
        let mut reg = PresenceRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        reg.track(a, Uuid::new_v4());
        reg.track(b, Uuid::new_v4());

        let (revision, users) = reg.snapshot();
        assert_eq!(revision, 2);
        assert_eq!(users.len(), 2);
        assert!(users.contains(&a) && users.contains(&b));
    }
}
