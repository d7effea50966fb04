use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use super::auth::AuthUser;
use super::AppState;

pub async fn ws_handler(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(state, user, socket))
}

/// Forward the caller's invalidations until either side goes away.
async fn handle_ws(state: AppState, user: String, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.service.events().subscribe();
    tracing::debug!(user = %user, "invalidation feed connected");

    let send_user = user.clone();
    let mut send_task = tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(user = %send_user, skipped, "invalidation feed lagged");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            if event.user_id != send_user {
                continue;
            }
            let Ok(text) = serde_json::to_string(&event.kind) else {
                continue;
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::debug!(user = %user, "invalidation feed closed");
}
