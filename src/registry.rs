// src/registry.rs

use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::models::{ServerEvent, UserIdentity};

/// The outbound side of a connection. A per-connection writer task drains
/// this into the WebSocket sink, so pushing an event never blocks.
pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;

/// Result of removing a connection's user binding.
#[derive(Debug, PartialEq)]
pub struct Unregistered {
    pub user_id: String,
    /// True iff this was the user's last live connection.
    pub went_offline: bool,
}

struct ConnEntry {
    user_id: Option<String>,
    sender: OutboundSender,
}

struct UserEntry {
    identity: UserIdentity,
    live_connections: usize,
    /// Monotonic tick assigned when the user first came online; keeps the
    /// online list stable across snapshots so the client UI doesn't flicker.
    online_since: u64,
}

#[derive(Default)]
struct RegistryInner {
    connections: HashMap<Uuid, ConnEntry>,
    users: HashMap<String, UserEntry>,
    presence_clock: u64,
}

impl RegistryInner {
    fn online_snapshot(&self) -> Vec<UserIdentity> {
        let mut entries: Vec<&UserEntry> = self.users.values().collect();
        entries.sort_by_key(|user| user.online_since);
        entries
            .into_iter()
            .map(|user| {
                let mut identity = user.identity.clone();
                identity.is_online = true;
                identity
            })
            .collect()
    }
}

/// Owns every live connection and the derived per-user online state.
/// All mutation goes through the single mutex, so the online flag always
/// equals "live connection count > 0" regardless of how connect and
/// disconnect interleave across tabs of the same user.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Track a freshly upgraded connection. The user binding stays empty
    /// until the client identifies.
    pub async fn connect(&self, conn_id: Uuid, sender: OutboundSender) {
        let mut inner = self.inner.lock().await;
        inner.connections.insert(
            conn_id,
            ConnEntry {
                user_id: None,
                sender,
            },
        );
    }

    /// Bind a connection to a user. Idempotent for the same user; rebinding
    /// to a different user is protocol misuse. A connection that was already
    /// cleaned up is not resurrected.
    pub async fn register(
        &self,
        conn_id: Uuid,
        identity: UserIdentity,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock().await;

        let bound = match inner.connections.get(&conn_id) {
            // Lost a race with disconnect cleanup; nothing to bind.
            None => return Ok(()),
            Some(entry) => entry.user_id.clone(),
        };
        match bound {
            Some(existing) if existing == identity.id => return Ok(()),
            Some(_) => return Err(RegistryError::AlreadyBound),
            None => {}
        }

        let user_id = identity.id.clone();
        if let Some(entry) = inner.connections.get_mut(&conn_id) {
            entry.user_id = Some(user_id.clone());
        }

        inner.presence_clock += 1;
        let tick = inner.presence_clock;
        inner
            .users
            .entry(user_id)
            .and_modify(|user| user.live_connections += 1)
            .or_insert(UserEntry {
                identity,
                live_connections: 1,
                online_since: tick,
            });
        Ok(())
    }

    /// Remove a connection. Returns the previous user binding, if any, and
    /// whether that user just went offline. Calling this again for an
    /// already removed connection is a no-op returning `None`.
    pub async fn unregister(&self, conn_id: Uuid) -> Option<Unregistered> {
        let mut inner = self.inner.lock().await;
        let entry = inner.connections.remove(&conn_id)?;
        let user_id = entry.user_id?;

        let went_offline = match inner.users.get_mut(&user_id) {
            Some(user) => {
                user.live_connections = user.live_connections.saturating_sub(1);
                user.live_connections == 0
            }
            None => false,
        };
        if went_offline {
            inner.users.remove(&user_id);
            debug!(%user_id, "user went offline");
        }
        Some(Unregistered {
            user_id,
            went_offline,
        })
    }

    pub async fn is_online(&self, user_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .users
            .get(user_id)
            .is_some_and(|user| user.live_connections > 0)
    }

    /// Snapshot of everyone online, ordered by when they first came online.
    pub async fn online_users(&self) -> Vec<UserIdentity> {
        let inner = self.inner.lock().await;
        inner.online_snapshot()
    }

    /// Snapshot the online list and fan it out to every connection under a
    /// single lock acquisition, so concurrent publishes can't deliver an
    /// older snapshot after a newer one. Returns the snapshot size and how
    /// many deliveries were queued.
    pub async fn broadcast_online_users(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        let users = inner.online_snapshot();
        let online = users.len();
        let event = ServerEvent::OnlineUsersUpdated { users };
        let reached = inner
            .connections
            .values()
            .filter(|entry| entry.sender.send(event.clone()).is_ok())
            .count();
        (online, reached)
    }

    /// Deliver an event to one connection. False if the connection is gone.
    pub async fn send_to(&self, conn_id: Uuid, event: ServerEvent) -> bool {
        let inner = self.inner.lock().await;
        match inner.connections.get(&conn_id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => false,
        }
    }

}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn identity(id: &str, username: &str) -> UserIdentity {
        UserIdentity {
            id: id.into(),
            username: username.into(),
            avatar: String::new(),
            is_online: false,
        }
    }

    async fn connect(registry: &SessionRegistry) -> (Uuid, UnboundedReceiver<ServerEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.connect(conn_id, tx).await;
        (conn_id, rx)
    }

    #[tokio::test]
    async fn online_iff_at_least_one_live_connection() {
        let registry = SessionRegistry::new();
        let (a1, _rx1) = connect(&registry).await;
        let (a2, _rx2) = connect(&registry).await;

        assert!(!registry.is_online("u-a").await);

        registry.register(a1, identity("u-a", "alice")).await.unwrap();
        registry.register(a2, identity("u-a", "alice")).await.unwrap();
        assert!(registry.is_online("u-a").await);

        // First tab closes: still online through the second tab.
        let gone = registry.unregister(a1).await.unwrap();
        assert!(!gone.went_offline);
        assert!(registry.is_online("u-a").await);

        let gone = registry.unregister(a2).await.unwrap();
        assert!(gone.went_offline);
        assert!(!registry.is_online("u-a").await);
        assert!(registry.online_users().await.is_empty());
    }

    #[tokio::test]
    async fn register_is_idempotent_for_same_user() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = connect(&registry).await;

        registry.register(conn, identity("u-a", "alice")).await.unwrap();
        registry.register(conn, identity("u-a", "alice")).await.unwrap();

        registry.unregister(conn).await.unwrap();
        // A double register must not inflate the connection count.
        assert!(!registry.is_online("u-a").await);
    }

    #[tokio::test]
    async fn rebinding_to_another_user_is_rejected() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = connect(&registry).await;

        registry.register(conn, identity("u-a", "alice")).await.unwrap();
        let err = registry
            .register(conn, identity("u-b", "bob"))
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::AlreadyBound);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = connect(&registry).await;
        registry.register(conn, identity("u-a", "alice")).await.unwrap();

        assert!(registry.unregister(conn).await.is_some());
        assert!(registry.unregister(conn).await.is_none());
    }

    #[tokio::test]
    async fn unregister_of_unidentified_connection_returns_none() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = connect(&registry).await;
        assert!(registry.unregister(conn).await.is_none());
    }

    #[tokio::test]
    async fn register_after_cleanup_does_not_resurrect() {
        let registry = SessionRegistry::new();
        let (conn, _rx) = connect(&registry).await;
        registry.unregister(conn).await;

        registry.register(conn, identity("u-a", "alice")).await.unwrap();
        assert!(!registry.is_online("u-a").await);
    }

    #[tokio::test]
    async fn online_list_is_ordered_by_first_seen() {
        let registry = SessionRegistry::new();
        let (a, _rxa) = connect(&registry).await;
        let (b, _rxb) = connect(&registry).await;
        let (a2, _rxa2) = connect(&registry).await;

        registry.register(a, identity("u-a", "alice")).await.unwrap();
        registry.register(b, identity("u-b", "bob")).await.unwrap();
        // A second tab for alice must not reorder her.
        registry.register(a2, identity("u-a", "alice")).await.unwrap();

        let names: Vec<String> = registry
            .online_users()
            .await
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
        assert!(registry.online_users().await.iter().all(|u| u.is_online));
    }

    #[tokio::test]
    async fn online_broadcast_reaches_unidentified_connections() {
        let registry = SessionRegistry::new();
        let (a, mut rxa) = connect(&registry).await;
        let (_b, mut rxb) = connect(&registry).await;
        registry.register(a, identity("u-a", "alice")).await.unwrap();

        assert_eq!(registry.broadcast_online_users().await, (1, 2));
        assert!(rxa.try_recv().is_ok());
        assert!(rxb.try_recv().is_ok());
    }

    #[tokio::test]
    async fn interleaved_online_broadcasts_end_on_the_freshest_list() {
        let registry = Arc::new(SessionRegistry::new());
        let (_watcher, mut rx) = connect(&registry).await;

        // Registrations racing with publishes from other tasks must never
        // leave the watcher holding a list older than the last one sent.
        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let conn_id = Uuid::new_v4();
                let (tx, _rx) = mpsc::unbounded_channel();
                registry.connect(conn_id, tx).await;
                registry
                    .register(conn_id, identity(&format!("u-{i}"), &format!("user-{i}")))
                    .await
                    .unwrap();
                registry.broadcast_online_users().await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        registry.broadcast_online_users().await;

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        match last {
            Some(ServerEvent::OnlineUsersUpdated { users }) => {
                assert_eq!(users.len(), registry.online_users().await.len())
            }
            other => panic!("expected online_users_updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_to_unknown_connection_is_false() {
        let registry = SessionRegistry::new();
        let event = ServerEvent::SendFailed { reason: "x".into() };
        assert!(!registry.send_to(Uuid::new_v4(), event).await);
    }
}
