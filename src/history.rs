// src/history.rs

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, postgres::PgPool};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;

use crate::error::HistoryError;
use crate::models::{MessagePayload, StoredMessage};

/// Append-only message persistence per channel. Behind a trait so the
/// dispatcher can run against Postgres in production and an in-memory
/// store in tests or database-less deployments.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist a message, assigning its per-channel insertion order and
    /// server timestamp. Callers must not broadcast a message whose append
    /// failed; history replayed on a later join has to contain everything
    /// that was ever broadcast.
    async fn append(&self, payload: &MessagePayload) -> Result<StoredMessage, HistoryError>;

    /// All messages for a channel in append order. Unbounded; pagination
    /// is a known scaling limit at the target size, not a feature here.
    async fn load_history(&self, channel: &str) -> Result<Vec<StoredMessage>, HistoryError>;
}

/// Creates the `messages` table if it doesn't exist.
pub async fn setup_messages_table(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            id BIGSERIAL PRIMARY KEY,
            channel TEXT NOT NULL,
            message JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres-backed store. Messages are kept as JSONB rows; the serial id
/// doubles as the per-channel ordering key.
pub struct PgHistoryStore {
    pool: PgPool,
}

impl PgHistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl HistoryStore for PgHistoryStore {
    async fn append(&self, payload: &MessagePayload) -> Result<StoredMessage, HistoryError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| HistoryError::Storage(format!("failed to serialize message: {e}")))?;

        let row = sqlx::query(
            "INSERT INTO messages (channel, message) VALUES ($1, $2) RETURNING id, created_at",
        )
        .bind(&payload.channel)
        .bind(&body)
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        let created_at: DateTime<Utc> = row.try_get("created_at")?;
        Ok(StoredMessage::from_payload(id, payload.clone(), created_at))
    }

    async fn load_history(&self, channel: &str) -> Result<Vec<StoredMessage>, HistoryError> {
        let rows = sqlx::query(
            "SELECT id, message, created_at FROM messages WHERE channel = $1 ORDER BY id ASC",
        )
        .bind(channel)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            let body: serde_json::Value = row.try_get("message")?;
            match serde_json::from_value::<MessagePayload>(body) {
                Ok(payload) => messages.push(StoredMessage::from_payload(id, payload, created_at)),
                // A row we can't decode shouldn't break replay of the rest.
                Err(e) => warn!(channel, id, "skipping undecodable history row: {e}"),
            }
        }
        Ok(messages)
    }
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    channels: HashMap<String, Vec<StoredMessage>>,
}

/// In-memory store for tests and ephemeral (no-database) deployments.
#[derive(Default)]
pub struct MemoryHistoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, payload: &MessagePayload) -> Result<StoredMessage, HistoryError> {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let message = StoredMessage::from_payload(inner.next_id, payload.clone(), Utc::now());
        inner
            .channels
            .entry(payload.channel.clone())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn load_history(&self, channel: &str) -> Result<Vec<StoredMessage>, HistoryError> {
        let inner = self.inner.lock().await;
        Ok(inner.channels.get(channel).cloned().unwrap_or_default())
    }
}

/// Per-channel async locks serializing append and replay on the same
/// channel, so a join's history load reflects every append that completed
/// before it. Locks are created on first use and kept for the process
/// lifetime; channel names are low-cardinality at the target scale.
#[derive(Default)]
pub struct ChannelLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, channel: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(channel.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_payload(channel: &str, text: &str) -> MessagePayload {
        MessagePayload {
            text: Some(text.into()),
            attachment: None,
            channel: channel.into(),
            sender: "alice".into(),
            time: "10:00".into(),
        }
    }

    #[tokio::test]
    async fn replay_is_prefix_consistent() {
        let store = MemoryHistoryStore::new();
        for i in 0..5 {
            store
                .append(&text_payload("general", &format!("msg {i}")))
                .await
                .unwrap();
        }

        let history = store.load_history("general").await.unwrap();
        let texts: Vec<&str> = history.iter().filter_map(|m| m.text.as_deref()).collect();
        assert_eq!(texts, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);

        // Insertion order ids: strictly increasing, no gaps, no duplicates.
        let ids: Vec<i64> = history.iter().map(|m| m.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(history.len(), 5);
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let store = MemoryHistoryStore::new();
        store.append(&text_payload("general", "a")).await.unwrap();
        store.append(&text_payload("random", "b")).await.unwrap();

        let general = store.load_history("general").await.unwrap();
        assert_eq!(general.len(), 1);
        assert_eq!(general[0].text.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn empty_channel_replays_an_empty_sequence() {
        let store = MemoryHistoryStore::new();
        assert!(store.load_history("random").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_returns_the_durable_record() {
        let store = MemoryHistoryStore::new();
        let stored = store.append(&text_payload("general", "hi")).await.unwrap();
        assert_eq!(stored.text.as_deref(), Some("hi"));
        assert_eq!(stored.channel, "general");
        assert_eq!(store.load_history("general").await.unwrap(), vec![stored]);
    }

    #[tokio::test]
    async fn channel_locks_serialize_the_same_channel() {
        let locks = ChannelLocks::new();
        let first = locks.acquire("general").await;
        // A different channel is not blocked.
        let _other = locks.acquire("random").await;

        // Same channel: second acquire only proceeds once the guard drops.
        let locks = Arc::new(locks);
        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks2.acquire("general").await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(first);
        waiter.await.unwrap();
    }
}
