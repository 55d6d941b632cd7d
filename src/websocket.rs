// src/websocket.rs

use std::time::Duration;

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::models::{ClientEvent, ServerEvent};
use crate::state::AppState;

/// The handler for the WebSocket route.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(app): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, app))
}

/// Manages the lifecycle of one connection: a writer task drains the
/// outbound queue into the socket while this task reads inbound frames,
/// translates them into dispatcher transitions, and runs the disconnect
/// cleanup exactly once on the way out.
async fn handle_socket(socket: WebSocket, app: AppState) {
    let conn_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    app.registry.connect(conn_id, tx.clone()).await;
    info!(%conn_id, "client connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!("failed to serialize outbound event: {e}");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut dispatcher = Dispatcher::new(conn_id, tx.clone());
    let idle = Duration::from_secs(app.config.idle_timeout_secs);

    loop {
        let frame = match tokio::time::timeout(idle, ws_rx.next()).await {
            Err(_) => {
                info!(%conn_id, "closing idle connection");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => {
                let event = match serde_json::from_str::<ClientEvent>(text.as_str()) {
                    Ok(event) => event,
                    Err(e) => {
                        debug!(%conn_id, "rejecting malformed event: {e}");
                        let _ = tx.send(ServerEvent::Error {
                            code: "validation".into(),
                            message: format!("malformed event: {e}"),
                        });
                        continue;
                    }
                };
                if let Err(err) = dispatcher.handle(&app, event).await {
                    // Rejected locally; other connections never see this.
                    warn!(%conn_id, code = err.code(), "event rejected: {err}");
                    let _ = tx.send(err.to_server_event());
                    if err.is_fatal() {
                        break;
                    }
                }
            }
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are not part of
            // the protocol.
            _ => {}
        }
    }

    dispatcher.disconnect(&app).await;
    writer.abort();
    info!(%conn_id, "client disconnected");
}
