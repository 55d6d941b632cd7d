// src/auth.rs

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use bcrypt::{DEFAULT_COST, hash, verify};
use chrono::{Duration, Utc};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};
use sqlx::{Row, postgres::PgPool};
use tracing::info;
use uuid::Uuid;

use crate::error::AuthError;
use crate::models::UserIdentity;
use crate::state::AppState;

/// The credential-storage capability. The distribution core only uses
/// `lookup` (resolving an identify event to a user); register and
/// authenticate back the HTTP routes.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn register(&self, username: &str, password: &str) -> Result<UserIdentity, AuthError>;
    async fn authenticate(&self, username: &str, password: &str)
    -> Result<LoginResponse, AuthError>;
    async fn lookup(&self, user_id: &str) -> Result<UserIdentity, AuthError>;
}

#[derive(Serialize, Debug)]
pub struct LoginResponse {
    #[serde(flatten)]
    pub user: UserIdentity,
    pub token: String,
}

#[derive(Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    exp: i64,
}

/// Creates the `users` table if it doesn't exist.
pub async fn setup_users_table(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password TEXT NOT NULL,
            avatar TEXT NOT NULL DEFAULT ''
        )",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Postgres-backed auth with bcrypt password hashing and JWT login tokens.
pub struct PgAuthService {
    pool: PgPool,
    jwt_secret: String,
}

impl PgAuthService {
    pub fn new(pool: PgPool, jwt_secret: String) -> Self {
        Self { pool, jwt_secret }
    }

    fn identity_from_row(row: &sqlx::postgres::PgRow) -> Result<UserIdentity, AuthError> {
        Ok(UserIdentity {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            avatar: row.try_get("avatar")?,
            is_online: false,
        })
    }

    fn issue_token(&self, user: &UserIdentity) -> Result<String, AuthError> {
        let claims = Claims {
            sub: user.id.clone(),
            username: user.username.clone(),
            exp: (Utc::now() + Duration::days(1)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::Backend(e.to_string()))
    }
}

fn validate_credentials(username: &str, password: &str) -> Result<(), AuthError> {
    if username.trim().len() < 3 {
        return Err(AuthError::Invalid(
            "username must be at least 3 characters".into(),
        ));
    }
    if password.len() < 6 {
        return Err(AuthError::Invalid(
            "password must be at least 6 characters".into(),
        ));
    }
    Ok(())
}

#[async_trait]
impl AuthService for PgAuthService {
    async fn register(&self, username: &str, password: &str) -> Result<UserIdentity, AuthError> {
        validate_credentials(username, password)?;
        let username = username.trim();

        let taken = sqlx::query("SELECT 1 FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        if taken.is_some() {
            return Err(AuthError::UsernameTaken);
        }

        let plaintext = password.to_owned();
        let hashed = tokio::task::spawn_blocking(move || hash(plaintext, DEFAULT_COST))
            .await
            .map_err(|e| AuthError::Backend(e.to_string()))?
            .map_err(|e| AuthError::Backend(e.to_string()))?;

        let user = UserIdentity {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            avatar: format!("https://api.dicebear.com/7.x/avataaars/svg?seed={username}"),
            is_online: false,
        };
        sqlx::query("INSERT INTO users (id, username, password, avatar) VALUES ($1, $2, $3, $4)")
            .bind(&user.id)
            .bind(&user.username)
            .bind(&hashed)
            .bind(&user.avatar)
            .execute(&self.pool)
            .await?;

        info!(username = %user.username, "registered new user");
        Ok(user)
    }

    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<LoginResponse, AuthError> {
        let row = sqlx::query("SELECT id, username, password, avatar FROM users WHERE username = $1")
            .bind(username.trim())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::UserNotFound)?;

        let hashed: String = row.try_get("password")?;
        let plaintext = password.to_owned();
        let valid = tokio::task::spawn_blocking(move || verify(plaintext, &hashed))
            .await
            .map_err(|e| AuthError::Backend(e.to_string()))?
            .map_err(|e| AuthError::Backend(e.to_string()))?;
        if !valid {
            return Err(AuthError::WrongPassword);
        }

        let user = Self::identity_from_row(&row)?;
        let token = self.issue_token(&user)?;
        Ok(LoginResponse { user, token })
    }

    async fn lookup(&self, user_id: &str) -> Result<UserIdentity, AuthError> {
        let row = sqlx::query("SELECT id, username, avatar FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AuthError::UserNotFound)?;
        Self::identity_from_row(&row)
    }
}

impl AuthError {
    fn status(&self) -> StatusCode {
        match self {
            AuthError::UsernameTaken => StatusCode::CONFLICT,
            AuthError::UserNotFound => StatusCode::NOT_FOUND,
            AuthError::WrongPassword => StatusCode::UNAUTHORIZED,
            AuthError::Invalid(_) => StatusCode::BAD_REQUEST,
            AuthError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// POST /api/auth/register
pub async fn register_handler(
    State(app): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<(StatusCode, Json<UserIdentity>), (StatusCode, String)> {
    app.auth
        .register(&credentials.username, &credentials.password)
        .await
        .map(|user| (StatusCode::CREATED, Json(user)))
        .map_err(|e| (e.status(), e.to_string()))
}

/// POST /api/auth/login
pub async fn login_handler(
    State(app): State<AppState>,
    Json(credentials): Json<Credentials>,
) -> Result<Json<LoginResponse>, (StatusCode, String)> {
    app.auth
        .authenticate(&credentials.username, &credentials.password)
        .await
        .map(Json)
        .map_err(|e| (e.status(), e.to_string()))
}
