//! Board presence routes.

use axum::Json;
use axum::extract::{Path, State};
use serde::Serialize;

use crate::message::BoardId;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct OnlineCount {
    pub board_id: BoardId,
    pub online: usize,
}

/// `GET /api/boards/{board_id}/online`: live session count, 0 for idle boards.
pub async fn online_count(State(state): State<AppState>, Path(board_id): Path<String>) -> Json<OnlineCount> {
    let board_id = BoardId::from(board_id);
    let online = state.hub.online_count(&board_id).await;
    Json(OnlineCount { board_id, online })
}

#[cfg(test)]
#[path = "boards_test.rs"]
mod tests;
