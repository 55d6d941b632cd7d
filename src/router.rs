// src/router.rs

use std::collections::{HashMap, HashSet};

use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::models::ServerEvent;
use crate::registry::OutboundSender;

/// Result of a channel fan-out. Failed connections had their outbound
/// queue closed under us; the caller logs them and schedules disconnect
/// cleanup, delivery to everyone else is unaffected.
#[derive(Debug, Default)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub failed: Vec<Uuid>,
}

#[derive(Default)]
struct RouterInner {
    /// channel name -> subscribed connections and their outbound queues.
    channels: HashMap<String, HashMap<Uuid, OutboundSender>>,
    /// Reverse index for unsubscribe_all and membership checks.
    memberships: HashMap<Uuid, HashSet<String>>,
}

/// Maps channel names to subscriber sets and performs broadcast fan-out.
/// Channels exist implicitly: a name appears in the map while it has at
/// least one subscriber and is dropped when the last one leaves.
///
/// Sequential broadcasts to the same channel push into every subscriber's
/// queue while holding the router lock, so each subscriber observes them
/// in issuance order (per-subscriber FIFO). No ordering is promised across
/// different channels.
pub struct ChannelRouter {
    inner: Mutex<RouterInner>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner::default()),
        }
    }

    pub async fn subscribe(&self, conn_id: Uuid, sender: OutboundSender, channel: &str) {
        let mut inner = self.inner.lock().await;
        inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(conn_id, sender);
        inner
            .memberships
            .entry(conn_id)
            .or_default()
            .insert(channel.to_string());
    }

    pub async fn unsubscribe(&self, conn_id: Uuid, channel: &str) {
        let mut inner = self.inner.lock().await;
        Self::remove_from_channel(&mut inner.channels, conn_id, channel);
        if let Some(joined) = inner.memberships.get_mut(&conn_id) {
            joined.remove(channel);
            if joined.is_empty() {
                inner.memberships.remove(&conn_id);
            }
        }
    }

    /// Drop a connection from every channel. Safe to call for connections
    /// that never subscribed anywhere, and safe to call repeatedly.
    pub async fn unsubscribe_all(&self, conn_id: Uuid) {
        let mut inner = self.inner.lock().await;
        let Some(joined) = inner.memberships.remove(&conn_id) else {
            return;
        };
        for channel in joined {
            Self::remove_from_channel(&mut inner.channels, conn_id, &channel);
        }
    }

    pub async fn is_subscribed(&self, conn_id: Uuid, channel: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .memberships
            .get(&conn_id)
            .is_some_and(|joined| joined.contains(channel))
    }

    /// Queue `event` for every subscriber of `channel` except `exclude`.
    /// Best-effort per connection: one dead subscriber never aborts
    /// delivery to the rest.
    pub async fn broadcast(
        &self,
        channel: &str,
        event: &ServerEvent,
        exclude: Option<Uuid>,
    ) -> BroadcastOutcome {
        let inner = self.inner.lock().await;
        let mut outcome = BroadcastOutcome::default();
        if let Some(subscribers) = inner.channels.get(channel) {
            for (conn_id, sender) in subscribers {
                if exclude == Some(*conn_id) {
                    continue;
                }
                if sender.send(event.clone()).is_ok() {
                    outcome.delivered += 1;
                } else {
                    outcome.failed.push(*conn_id);
                }
            }
        }
        debug!(channel, delivered = outcome.delivered, "broadcast fan-out");
        outcome
    }

    fn remove_from_channel(
        channels: &mut HashMap<String, HashMap<Uuid, OutboundSender>>,
        conn_id: Uuid,
        channel: &str,
    ) {
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.remove(&conn_id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

impl Default for ChannelRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn typing(channel: &str, on: bool) -> ServerEvent {
        ServerEvent::TypingStatus {
            channel: channel.into(),
            typing: on,
        }
    }

    fn conn() -> (Uuid, OutboundSender, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Uuid::new_v4(), tx, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn broadcast_excludes_sender_and_delivers_once_in_order() {
        let router = ChannelRouter::new();
        let (a, tx_a, mut rx_a) = conn();
        let (b, tx_b, mut rx_b) = conn();
        router.subscribe(a, tx_a, "general").await;
        router.subscribe(b, tx_b, "general").await;

        let first = typing("general", true);
        let second = typing("general", false);
        let outcome = router.broadcast("general", &first, Some(a)).await;
        assert_eq!(outcome.delivered, 1);
        router.broadcast("general", &second, Some(a)).await;

        assert_eq!(drain(&mut rx_b), vec![first, second]);
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn broadcast_without_exclusion_reaches_everyone() {
        let router = ChannelRouter::new();
        let (a, tx_a, mut rx_a) = conn();
        let (b, tx_b, mut rx_b) = conn();
        router.subscribe(a, tx_a, "general").await;
        router.subscribe(b, tx_b, "general").await;

        let outcome = router.broadcast("general", &typing("general", true), None).await;
        assert_eq!(outcome.delivered, 2);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_the_channel() {
        let router = ChannelRouter::new();
        let (a, tx_a, mut rx_a) = conn();
        let (b, tx_b, mut rx_b) = conn();
        router.subscribe(a, tx_a, "general").await;
        router.subscribe(b, tx_b, "random").await;

        router.broadcast("general", &typing("general", true), None).await;
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_channel_delivers_nothing() {
        let router = ChannelRouter::new();
        let outcome = router.broadcast("nowhere", &typing("nowhere", true), None).await;
        assert_eq!(outcome.delivered, 0);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn dead_subscriber_is_reported_but_does_not_abort_fanout() {
        let router = ChannelRouter::new();
        let (a, tx_a, rx_a) = conn();
        let (b, tx_b, mut rx_b) = conn();
        router.subscribe(a, tx_a, "general").await;
        router.subscribe(b, tx_b, "general").await;
        drop(rx_a); // a's writer task is gone

        let outcome = router.broadcast("general", &typing("general", true), None).await;
        assert_eq!(outcome.delivered, 1);
        assert_eq!(outcome.failed, vec![a]);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn connection_may_hold_multiple_subscriptions() {
        let router = ChannelRouter::new();
        let (a, tx_a, mut rx_a) = conn();
        router.subscribe(a, tx_a.clone(), "general").await;
        router.subscribe(a, tx_a, "random").await;

        assert!(router.is_subscribed(a, "general").await);
        assert!(router.is_subscribed(a, "random").await);

        router.broadcast("general", &typing("general", true), None).await;
        router.broadcast("random", &typing("random", true), None).await;
        assert_eq!(drain(&mut rx_a).len(), 2);

        router.unsubscribe(a, "general").await;
        assert!(!router.is_subscribed(a, "general").await);
        assert!(router.is_subscribed(a, "random").await);
    }

    #[tokio::test]
    async fn unsubscribe_all_is_idempotent_and_safe_for_strangers() {
        let router = ChannelRouter::new();
        let (a, tx_a, _rx_a) = conn();
        router.subscribe(a, tx_a, "general").await;

        router.unsubscribe_all(a).await;
        assert!(!router.is_subscribed(a, "general").await);
        // Second call and a never-subscribed connection are both no-ops.
        router.unsubscribe_all(a).await;
        router.unsubscribe_all(Uuid::new_v4()).await;

        let outcome = router.broadcast("general", &typing("general", true), None).await;
        assert_eq!(outcome.delivered, 0);
    }
}
