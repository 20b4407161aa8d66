//! Message router — per-type side effects and delivery decision.
//!
//! DESIGN
//! ======
//! Handlers apply persistence effects and return an `Outcome`; the hub
//! applies the outcome to board membership. Persistence failures are logged
//! and never block delivery: peers see a delete or clear even when the
//! durable copy did not change, and a later sync may resurrect the object.

use tracing::{debug, warn};

use crate::message::{DeletePayload, DrawPayload, Message, Payload};
use crate::services::persistence::PersistenceBatcher;

/// What the hub should do with a message after its side effects ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every session on the board, sender included.
    BroadcastAll,
    /// Every session on the board except the sender's.
    BroadcastOthers,
    /// Push a fresh snapshot to the requesting session only.
    ReplySnapshot,
    Drop,
}

/// Run the side effects for one stamped inbound message.
pub async fn dispatch(batcher: &PersistenceBatcher, message: &Message) -> Outcome {
    let board_id = &message.board_id;
    match &message.payload {
        Payload::Draw(DrawPayload { object }) => {
            batcher.enqueue(board_id, object.clone());
            debug!(%board_id, object_id = %object.id, pending = batcher.pending_count(board_id), "draw queued");
            Outcome::BroadcastAll
        }
        Payload::Delete(DeletePayload { object_id }) => {
            match batcher.remove_object(board_id, object_id).await {
                Ok(true) => debug!(%board_id, %object_id, "deleted object before it was flushed"),
                Ok(false) => {}
                Err(e) => warn!(error = %e, %board_id, %object_id, "durable delete failed; broadcasting anyway"),
            }
            Outcome::BroadcastAll
        }
        Payload::Clear => {
            if let Err(e) = batcher.clear_board(board_id).await {
                warn!(error = %e, %board_id, "durable clear failed; broadcasting anyway");
            }
            Outcome::BroadcastAll
        }
        Payload::SyncRequest => Outcome::ReplySnapshot,
        Payload::Sync(_) => {
            debug!(%board_id, user_id = %message.user_id, "dropping client-sent sync");
            Outcome::Drop
        }
        Payload::Relay { .. } => Outcome::BroadcastOthers,
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
