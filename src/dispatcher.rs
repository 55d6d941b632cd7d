// src/dispatcher.rs

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EventError;
use crate::models::{ClientEvent, MessagePayload, ServerEvent};
use crate::registry::OutboundSender;
use crate::state::AppState;

/// Lifecycle of a connection as seen by the dispatcher.
enum ConnState {
    Unidentified,
    Identified { user_id: String },
    Closed,
}

/// Per-connection orchestrator. Receives validated inbound events and
/// drives the registry, router, history store and presence publisher in
/// the contract order: register before publish, persist before broadcast,
/// subscribe before replay.
pub struct Dispatcher {
    conn_id: Uuid,
    sender: OutboundSender,
    state: ConnState,
}

impl Dispatcher {
    pub fn new(conn_id: Uuid, sender: OutboundSender) -> Self {
        Self {
            conn_id,
            sender,
            state: ConnState::Unidentified,
        }
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Handle one inbound event. An `Err` is reported to this connection
    /// only; whether it also closes the connection is decided by
    /// `EventError::is_fatal`.
    pub async fn handle(&mut self, app: &AppState, event: ClientEvent) -> Result<(), EventError> {
        if matches!(self.state, ConnState::Closed) {
            return Err(EventError::Validation("connection is closed".into()));
        }
        match event {
            ClientEvent::Identify { user_id } => self.identify(app, user_id).await,
            ClientEvent::JoinChannel { channel } => self.join(app, channel).await,
            ClientEvent::SendMessage { message } => self.send_message(app, message).await,
            ClientEvent::Typing { channel } => self.typing(app, channel, true).await,
            ClientEvent::StopTyping { channel } => self.typing(app, channel, false).await,
        }
    }

    async fn identify(&mut self, app: &AppState, user_id: String) -> Result<(), EventError> {
        if matches!(self.state, ConnState::Identified { .. }) {
            return Err(EventError::DuplicateIdentity);
        }
        let identity = app
            .auth
            .lookup(&user_id)
            .await
            .map_err(|_| EventError::Validation(format!("unknown user id '{user_id}'")))?;

        app.registry.register(self.conn_id, identity).await?;
        self.state = ConnState::Identified {
            user_id: user_id.clone(),
        };
        info!(conn_id = %self.conn_id, %user_id, "connection identified");
        app.presence.publish().await;
        Ok(())
    }

    async fn join(&mut self, app: &AppState, channel: String) -> Result<(), EventError> {
        self.require_identified()?;
        if channel.trim().is_empty() {
            return Err(EventError::Validation("channel name is empty".into()));
        }

        // The channel lock serializes this replay against concurrent
        // appends: everything persisted before we got the lock is in the
        // backlog, everything after will arrive via broadcast.
        let _guard = app.channel_locks.acquire(&channel).await;
        app.router
            .subscribe(self.conn_id, self.sender.clone(), &channel)
            .await;
        let messages = app
            .history
            .load_history(&channel)
            .await
            .map_err(EventError::HistoryUnavailable)?;
        debug!(conn_id = %self.conn_id, channel, backlog = messages.len(), "joined channel");
        // Replay goes to the joining connection only, never broadcast.
        app.registry
            .send_to(self.conn_id, ServerEvent::HistoryLoaded { messages })
            .await;
        Ok(())
    }

    async fn send_message(
        &mut self,
        app: &AppState,
        payload: MessagePayload,
    ) -> Result<(), EventError> {
        self.require_identified()?;
        if !payload.has_content() {
            return Err(EventError::Validation(
                "message needs text or an attachment".into(),
            ));
        }
        if !app.router.is_subscribed(self.conn_id, &payload.channel).await {
            return Err(EventError::NotSubscribed(payload.channel));
        }

        let _guard = app.channel_locks.acquire(&payload.channel).await;
        // Persist first; a message that failed to persist is never
        // broadcast, so replay can't miss anything clients saw live.
        let stored = app.history.append(&payload).await?;
        let channel = stored.channel.clone();
        let outcome = app
            .router
            .broadcast(
                &channel,
                // The sender keeps its optimistic local copy, so the
                // broadcast deliberately skips it.
                &ServerEvent::MessageReceived { message: stored },
                Some(self.conn_id),
            )
            .await;
        self.reap_failed(app, outcome.failed);
        Ok(())
    }

    async fn typing(
        &mut self,
        app: &AppState,
        channel: String,
        typing: bool,
    ) -> Result<(), EventError> {
        self.require_identified()?;
        let outcome = app
            .router
            .broadcast(
                &channel,
                &ServerEvent::TypingStatus {
                    channel: channel.clone(),
                    typing,
                },
                Some(self.conn_id),
            )
            .await;
        self.reap_failed(app, outcome.failed);
        Ok(())
    }

    /// Terminal transition. Idempotent: a transport error racing an
    /// explicit close runs the cleanup once.
    pub async fn disconnect(&mut self, app: &AppState) {
        if matches!(self.state, ConnState::Closed) {
            return;
        }
        self.state = ConnState::Closed;
        cleanup_connection(app, self.conn_id).await;
    }

    fn require_identified(&self) -> Result<&str, EventError> {
        match &self.state {
            ConnState::Identified { user_id } => Ok(user_id),
            _ => Err(EventError::Validation("identify first".into())),
        }
    }

    /// Connections whose outbound queue is gone get their cleanup
    /// scheduled off this task; their own read loop may be stuck on a
    /// half-dead transport.
    fn reap_failed(&self, app: &AppState, failed: Vec<Uuid>) {
        for conn_id in failed {
            warn!(%conn_id, "delivery failed, scheduling disconnect cleanup");
            let app = app.clone();
            tokio::spawn(async move {
                cleanup_connection(&app, conn_id).await;
            });
        }
    }
}

/// Shared disconnect path: drop all subscriptions, remove the session
/// binding, and republish presence iff an online flag changed. Safe to
/// run more than once per connection.
pub async fn cleanup_connection(app: &AppState, conn_id: Uuid) {
    app.router.unsubscribe_all(conn_id).await;
    if let Some(gone) = app.registry.unregister(conn_id).await {
        info!(%conn_id, user_id = %gone.user_id, "connection closed");
        if gone.went_offline {
            app.presence.publish().await;
        }
    }
}
