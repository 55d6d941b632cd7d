// src/state.rs

use std::sync::Arc;

use crate::auth::AuthService;
use crate::config::Config;
use crate::history::{ChannelLocks, HistoryStore};
use crate::presence::PresencePublisher;
use crate::registry::SessionRegistry;
use crate::router::ChannelRouter;
use crate::upload::AttachmentStore;

/// The application's shared state, created once in `main.rs` and handed
/// to every connection task and HTTP handler via axum's state management.
/// The distribution core (registry, router, presence, history) lives
/// here; auth and attachments are the external capabilities behind their
/// traits.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<ChannelRouter>,
    pub presence: Arc<PresencePublisher>,
    pub history: Arc<dyn HistoryStore>,
    pub channel_locks: Arc<ChannelLocks>,
    pub auth: Arc<dyn AuthService>,
    pub attachments: Arc<dyn AttachmentStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        auth: Arc<dyn AuthService>,
        attachments: Arc<dyn AttachmentStore>,
        config: Arc<Config>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            presence: Arc::new(PresencePublisher::new(registry.clone())),
            registry,
            router: Arc::new(ChannelRouter::new()),
            channel_locks: Arc::new(ChannelLocks::new()),
            history,
            auth,
            attachments,
            config,
        }
    }
}
