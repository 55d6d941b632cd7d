// src/error.rs

use thiserror::Error;

use crate::models::ServerEvent;

/// Session registry failures. `AlreadyBound` is protocol misuse and
/// closes the connection.
#[derive(Error, Debug, PartialEq)]
pub enum RegistryError {
    #[error("connection already bound to a different user")]
    AlreadyBound,
}

/// History store failures. Wraps whatever the backing storage reports.
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("storage failure: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for HistoryError {
    fn from(err: sqlx::Error) -> Self {
        HistoryError::Storage(err.to_string())
    }
}

/// Failures raised while handling a single inbound event. These never
/// cross connection boundaries: the dispatcher reports them only to the
/// originating connection.
#[derive(Error, Debug)]
pub enum EventError {
    #[error("invalid event: {0}")]
    Validation(String),

    #[error("not subscribed to channel '{0}'")]
    NotSubscribed(String),

    #[error("failed to persist message: {0}")]
    Persistence(#[from] HistoryError),

    #[error("failed to load history: {0}")]
    HistoryUnavailable(HistoryError),

    #[error("connection is already identified")]
    DuplicateIdentity,

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl EventError {
    /// Protocol misuse closes the connection; everything else leaves it
    /// open and only rejects the offending event.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EventError::DuplicateIdentity | EventError::Registry(RegistryError::AlreadyBound)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            EventError::Validation(_) => "validation",
            EventError::NotSubscribed(_) => "not_subscribed",
            EventError::Persistence(_) => "persistence",
            EventError::HistoryUnavailable(_) => "history_unavailable",
            EventError::DuplicateIdentity => "duplicate_identity",
            EventError::Registry(RegistryError::AlreadyBound) => "already_bound",
        }
    }

    /// The outbound failure response for the originating connection.
    /// Failed appends get the dedicated `send_failed` event so the
    /// client can mark its optimistic copy as undelivered.
    pub fn to_server_event(&self) -> ServerEvent {
        match self {
            EventError::Persistence(err) => ServerEvent::SendFailed {
                reason: err.to_string(),
            },
            other => ServerEvent::Error {
                code: other.code().to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Auth service failures, mapped onto HTTP statuses by the route glue.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("username already taken")]
    UsernameTaken,

    #[error("user not found")]
    UserNotFound,

    #[error("wrong password")]
    WrongPassword,

    #[error("{0}")]
    Invalid(String),

    #[error("auth backend failure: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for AuthError {
    fn from(err: sqlx::Error) -> Self {
        // Two registrations can race past the taken-username check; the
        // UNIQUE constraint on usernames is the authority, so its
        // violation is still a conflict, not a backend fault.
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => AuthError::UsernameTaken,
            _ => AuthError::Backend(err.to_string()),
        }
    }
}

/// Attachment store failures.
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("empty upload")]
    Empty,

    #[error("storage failure: {0}")]
    Storage(String),
}
