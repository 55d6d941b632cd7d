// src/main.rs

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use sqlx::postgres::PgPool;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

use chatline::auth::{self, PgAuthService};
use chatline::config::Config;
use chatline::history::{self, PgHistoryStore};
use chatline::state::AppState;
use chatline::upload::{self, DiskAttachmentStore};
use chatline::websocket;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = PgPool::connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    history::setup_messages_table(&pool)
        .await
        .context("failed to create messages table")?;
    auth::setup_users_table(&pool)
        .await
        .context("failed to create users table")?;

    let app = AppState::new(
        Arc::new(PgHistoryStore::new(pool.clone())),
        Arc::new(PgAuthService::new(pool, config.jwt_secret.clone())),
        Arc::new(DiskAttachmentStore::new(
            config.upload_dir.clone(),
            config.public_base_url.clone(),
        )),
        config.clone(),
    );

    let router = Router::new()
        .route("/ws", get(websocket::websocket_handler))
        .route("/api/auth/register", post(auth::register_handler))
        .route("/api/auth/login", post(auth::login_handler))
        .route("/api/upload", post(upload::upload_handler))
        .nest_service("/uploads", ServeDir::new(&config.upload_dir))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(app);

    info!(addr = %config.bind_addr, "chat server listening");
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind address")?;
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}
