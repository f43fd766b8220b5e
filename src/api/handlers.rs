use std::sync::Arc;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::session::{self, Session, OUTBOX_CAPACITY};

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        sessions: state.registry.len().await,
    })
}

pub(super) async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// Upgrade to the control channel. The origin has already been checked by
/// the time this runs.
pub(super) async fn socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let upgrade = &state.settings.upgrade;
    ws.read_buffer_size(upgrade.read_buffer_size)
        .write_buffer_size(upgrade.write_buffer_size)
        .max_message_size(upgrade.read_buffer_size)
        .on_failed_upgrade(|e| tracing::warn!(error = %e, "websocket upgrade failed"))
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Register this connection for graceful shutdown tracking
    let (_guard, shutdown) = state.shutdown.register();

    let (outbox, outbound) = session::outbox(OUTBOX_CAPACITY);
    let admission = match state.registry.admit(outbox.clone()).await {
        Ok(admission) => admission,
        Err(e) => {
            tracing::warn!(error = %e, "refusing connection");
            let close_frame = CloseFrame {
                code: close_code::AGAIN,
                reason: e.to_string().into(),
            };
            let _ = socket.send(Message::Close(Some(close_frame))).await;
            return;
        }
    };

    let session = Arc::new(Session::new(
        admission,
        outbox,
        state.registry.clone(),
        &state.settings,
    ));
    session.serve(socket, outbound, shutdown).await;

    // _guard is dropped here, decrementing active connection count
}
