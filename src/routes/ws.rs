//! WebSocket upgrade — credential check, then hand-off to a session.
//!
//! LIFECYCLE
//! =========
//! 1. `GET /ws/boards/{board_id}?ticket=...` → verify credential
//! 2. Upgrade → `Session::run` registers with the hub (sync snapshot follows)
//! 3. Reader/writer run until close, timeout, or eviction → hub leave

use std::collections::HashMap;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{error, info};

use crate::message::BoardId;
use crate::services::session::Session;
use crate::state::AppState;

pub async fn handle_ws(
    State(state): State<AppState>,
    Path(board_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(credential) = params.get("ticket").or_else(|| params.get("token")) else {
        return (StatusCode::UNAUTHORIZED, "ticket required").into_response();
    };

    let user_id = match state.verifier.verify(credential).await {
        Ok(Some(uid)) => uid,
        Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
        Err(e) => {
            error!(error = %e, "ws credential validation failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
        }
    };

    let board_id = BoardId::from(board_id);
    let session = Session::new(board_id.clone(), user_id, state.session);
    info!(%board_id, %user_id, session_id = %session.session_id, "ws: upgrading connection");

    let hub = state.hub.clone();
    ws.max_message_size(state.session.max_message_bytes)
        .on_upgrade(move |socket| session.run(socket, hub))
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
