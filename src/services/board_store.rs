//! Durable board store — snapshot, append, remove, clear.
//!
//! DESIGN
//! ======
//! The realtime core only talks to `dyn BoardStore`. Postgres keeps each
//! board's document in `boards.data` as `{"objects": [...], "version": n}`
//! and mutates it with one row-level `UPDATE` per call, so concurrent calls
//! for the same board serialize on the row lock rather than in the caller.
//!
//! Every successful mutation bumps `version` by one; the counter never goes
//! backwards, clears included.

use std::collections::HashMap;

use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::message::{BoardId, BoardSnapshot, DrawObject};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("board not found: {0}")]
    NotFound(BoardId),
    #[error("invalid board id: {0}")]
    InvalidBoardId(BoardId),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("board document encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Board persistence consumed by the realtime core.
#[async_trait::async_trait]
pub trait BoardStore: Send + Sync {
    /// Current objects in append order plus version. `None` if the board does not exist.
    async fn snapshot(&self, board_id: &BoardId) -> Result<Option<BoardSnapshot>, StoreError>;

    async fn append_object(&self, board_id: &BoardId, object: &DrawObject) -> Result<(), StoreError>;

    async fn remove_object(&self, board_id: &BoardId, object_id: &str) -> Result<(), StoreError>;

    /// Replace the object list with an empty one.
    async fn clear(&self, board_id: &BoardId) -> Result<(), StoreError>;
}

// =============================================================================
// POSTGRES
// =============================================================================

pub struct PgBoardStore {
    pool: PgPool,
}

impl PgBoardStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_board_uuid(board_id: &BoardId) -> Result<Uuid, StoreError> {
    Uuid::parse_str(board_id.as_str()).map_err(|_| StoreError::InvalidBoardId(board_id.clone()))
}

fn require_row(rows_affected: u64, board_id: &BoardId) -> Result<(), StoreError> {
    if rows_affected == 0 {
        return Err(StoreError::NotFound(board_id.clone()));
    }
    Ok(())
}

#[async_trait::async_trait]
impl BoardStore for PgBoardStore {
    async fn snapshot(&self, board_id: &BoardId) -> Result<Option<BoardSnapshot>, StoreError> {
        // A board id that is not a UUID cannot name an existing row.
        let Ok(id) = parse_board_uuid(board_id) else {
            return Ok(None);
        };

        let row = sqlx::query_scalar::<_, Option<serde_json::Value>>("SELECT data FROM boards WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            None => Ok(None),
            Some(None) => Ok(Some(BoardSnapshot::default())),
            Some(Some(data)) => Ok(Some(serde_json::from_value(data)?)),
        }
    }

    async fn append_object(&self, board_id: &BoardId, object: &DrawObject) -> Result<(), StoreError> {
        let id = parse_board_uuid(board_id)?;
        let object_json = serde_json::to_value(object)?;

        let result = sqlx::query(
            "UPDATE boards
             SET data = jsonb_build_object(
                     'objects', COALESCE(data->'objects', '[]'::jsonb) || jsonb_build_array($1::jsonb),
                     'version', COALESCE((data->>'version')::bigint, 0) + 1),
                 updated_at = now()
             WHERE id = $2",
        )
        .bind(&object_json)
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result.rows_affected(), board_id)
    }

    async fn remove_object(&self, board_id: &BoardId, object_id: &str) -> Result<(), StoreError> {
        let id = parse_board_uuid(board_id)?;

        let result = sqlx::query(
            "UPDATE boards
             SET data = jsonb_build_object(
                     'objects', (
                         SELECT COALESCE(jsonb_agg(obj ORDER BY pos), '[]'::jsonb)
                         FROM jsonb_array_elements(COALESCE(data->'objects', '[]'::jsonb))
                              WITH ORDINALITY AS elems(obj, pos)
                         WHERE obj->>'id' IS DISTINCT FROM $1
                     ),
                     'version', COALESCE((data->>'version')::bigint, 0) + 1),
                 updated_at = now()
             WHERE id = $2",
        )
        .bind(object_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result.rows_affected(), board_id)
    }

    async fn clear(&self, board_id: &BoardId) -> Result<(), StoreError> {
        let id = parse_board_uuid(board_id)?;

        let result = sqlx::query(
            "UPDATE boards
             SET data = jsonb_build_object(
                     'objects', '[]'::jsonb,
                     'version', COALESCE((data->>'version')::bigint, 0) + 1),
                 updated_at = now()
             WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        require_row(result.rows_affected(), board_id)
    }
}

// =============================================================================
// IN-MEMORY
// =============================================================================

/// Process-local store for development and tests. Appends create the board
/// on demand; removes and clears require it to exist.
#[derive(Default)]
pub struct MemoryBoardStore {
    boards: RwLock<HashMap<BoardId, BoardSnapshot>>,
}

impl MemoryBoardStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_board(&self, board_id: BoardId, snapshot: BoardSnapshot) {
        self.boards.write().await.insert(board_id, snapshot);
    }
}

#[async_trait::async_trait]
impl BoardStore for MemoryBoardStore {
    async fn snapshot(&self, board_id: &BoardId) -> Result<Option<BoardSnapshot>, StoreError> {
        Ok(self.boards.read().await.get(board_id).cloned())
    }

    async fn append_object(&self, board_id: &BoardId, object: &DrawObject) -> Result<(), StoreError> {
        let mut boards = self.boards.write().await;
        let snapshot = boards.entry(board_id.clone()).or_default();
        snapshot.objects.push(object.clone());
        snapshot.version += 1;
        Ok(())
    }

    async fn remove_object(&self, board_id: &BoardId, object_id: &str) -> Result<(), StoreError> {
        let mut boards = self.boards.write().await;
        let Some(snapshot) = boards.get_mut(board_id) else {
            return Err(StoreError::NotFound(board_id.clone()));
        };
        snapshot.objects.retain(|obj| obj.id != object_id);
        snapshot.version += 1;
        Ok(())
    }

    async fn clear(&self, board_id: &BoardId) -> Result<(), StoreError> {
        let mut boards = self.boards.write().await;
        let Some(snapshot) = boards.get_mut(board_id) else {
            return Err(StoreError::NotFound(board_id.clone()));
        };
        snapshot.objects.clear();
        snapshot.version += 1;
        Ok(())
    }
}

#[cfg(test)]
#[path = "board_store_test.rs"]
mod tests;
