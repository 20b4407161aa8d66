//! Broadcast engine — per-board fan-out with a drop-slow-consumer policy.
//!
//! DESIGN
//! ======
//! Each session owns a bounded outbound queue; the engine only ever
//! `try_send`s into it. A full queue marks the peer as unresponsive: the
//! session is removed from the set and its handle dropped, which closes the
//! queue and lets the writer shut the socket. No retry, no unbounded buffer.
//!
//! The engine mutates the set it is given but never the board map itself;
//! the hub owns that and removes emptied boards.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::message::{BoardId, Message};

/// Messages are shared, not copied, across recipients.
pub type Outbound = Arc<Message>;

/// Live sessions of one board keyed by session id.
pub type SessionSet = HashMap<Uuid, SessionHandle>;

/// Who receives a board-scoped delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    All,
    /// Everyone except sessions of the originating user.
    Others { sender: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,
    #[error("outbound queue closed")]
    Closed,
}

/// The registry's reference to a session: identity plus the producer end of
/// its outbound queue. Not `Clone`; dropping it closes the queue and fires the
/// release signal.
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub board_id: BoardId,
    tx: mpsc::Sender<Outbound>,
    release: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(session_id: Uuid, user_id: Uuid, board_id: BoardId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { session_id, user_id, board_id, tx, release: None }
    }

    /// A receiver that resolves as soon as this handle is dropped, while the
    /// outbound queue may still hold undelivered messages.
    #[must_use]
    pub fn release_signal(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.release = Some(tx);
        rx
    }

    /// Non-blocking enqueue onto this session's outbound queue.
    ///
    /// # Errors
    ///
    /// Returns [`DeliveryError::Full`] if the queue is at capacity and
    /// [`DeliveryError::Closed`] if the writer is gone.
    pub fn try_deliver(&self, message: &Outbound) -> Result<(), DeliveryError> {
        self.tx.try_send(Arc::clone(message)).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Result of one fan-out.
#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: usize,
    /// Sessions removed from the set, with the reason.
    pub evicted: Vec<(SessionHandle, DeliveryError)>,
}

/// Deliver `message` to every session in scope, evicting any that cannot
/// take it.
pub fn deliver(sessions: &mut SessionSet, message: &Outbound, scope: Scope) -> Delivery {
    let mut delivery = Delivery::default();
    let mut failed = Vec::new();

    for (session_id, session) in sessions.iter() {
        if let Scope::Others { sender } = scope {
            if session.user_id == sender {
                continue;
            }
        }
        match session.try_deliver(message) {
            Ok(()) => delivery.delivered += 1,
            Err(reason) => failed.push((*session_id, reason)),
        }
    }

    for (session_id, reason) in failed {
        if let Some(session) = sessions.remove(&session_id) {
            delivery.evicted.push((session, reason));
        }
    }
    delivery
}

#[cfg(test)]
#[path = "broadcast_test.rs"]
mod tests;
