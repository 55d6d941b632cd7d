// src/presence.rs

use std::sync::Arc;

use tracing::debug;

use crate::registry::SessionRegistry;

/// Pushes the global online-user list to every connection. Presence is
/// not channel-scoped; even clients that haven't identified yet receive
/// the list. Called after every registry mutation that changed an online
/// flag, so the latest publish always reflects current state.
pub struct PresencePublisher {
    registry: Arc<SessionRegistry>,
}

impl PresencePublisher {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub async fn publish(&self) {
        // Snapshot and fan-out happen under one registry lock; the last
        // delivered list is always the freshest one.
        let (online, reached) = self.registry.broadcast_online_users().await;
        debug!(online, reached, "published online-user list");
    }
}
