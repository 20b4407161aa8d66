//! Hub — the session registry and its single control loop.
//!
//! ARCHITECTURE
//! ============
//! One task owns every membership change. Sessions talk to it through a
//! bounded command channel: join and leave are acknowledged, routed messages
//! are fire-and-forget. Membership lives in a board-keyed map behind an
//! `RwLock` that only the control loop writes; `online_count` reads it
//! directly so HTTP handlers never queue behind broadcast traffic.
//!
//! Boards exist in the map only while they have sessions: the first join
//! creates the entry and the last leave (or eviction) removes it.
//!
//! ERROR HANDLING
//! ==============
//! Failed sends are evictions, not errors. Store failures while building a
//! sync snapshot skip the sync; the session stays registered.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::message::{BoardId, Message};
use crate::services::board_store::BoardStore;
use crate::services::broadcast::{self, DeliveryError, Scope, SessionHandle, SessionSet};
use crate::services::persistence::PersistenceBatcher;
use crate::services::router::{self, Outcome};

type Boards = Arc<RwLock<HashMap<BoardId, SessionSet>>>;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub control loop is not running")]
    Closed,
}

enum HubCommand {
    Join { session: SessionHandle, ack: oneshot::Sender<()> },
    Leave { board_id: BoardId, session_id: Uuid, ack: oneshot::Sender<bool> },
    Route { session_id: Uuid, message: Message },
    /// Acked once every earlier command has been handled.
    #[cfg(test)]
    Settle(oneshot::Sender<()>),
}

// =============================================================================
// HANDLE
// =============================================================================

/// Cheap, cloneable entry point into the hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    boards: Boards,
}

impl HubHandle {
    /// Register a session and push it the current board snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the control loop has stopped.
    pub async fn join(&self, session: SessionHandle) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::Join { session, ack }).await?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Unregister a session. `Ok(false)` if it was already gone.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the control loop has stopped.
    pub async fn leave(&self, board_id: BoardId, session_id: Uuid) -> Result<bool, HubError> {
        let (ack, done) = oneshot::channel();
        self.send(HubCommand::Leave { board_id, session_id, ack }).await?;
        done.await.map_err(|_| HubError::Closed)
    }

    /// Hand a stamped inbound message to the control loop.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Closed`] if the control loop has stopped.
    pub async fn route(&self, session_id: Uuid, message: Message) -> Result<(), HubError> {
        self.send(HubCommand::Route { session_id, message }).await
    }

    /// Live sessions on a board. 0 for unknown boards.
    pub async fn online_count(&self, board_id: &BoardId) -> usize {
        self.boards.read().await.get(board_id).map_or(0, HashMap::len)
    }

    /// Boards with at least one live session.
    #[cfg(test)]
    pub async fn active_boards(&self) -> usize {
        self.boards.read().await.len()
    }

    #[cfg(test)]
    pub async fn settle(&self) {
        let (ack, done) = oneshot::channel();
        if self.send(HubCommand::Settle(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Closed)
    }
}

// =============================================================================
// CONTROL LOOP
// =============================================================================

pub struct Hub {
    rx: mpsc::Receiver<HubCommand>,
    boards: Boards,
    store: Arc<dyn BoardStore>,
    batcher: PersistenceBatcher,
}

impl Hub {
    /// Start the control loop. It runs until every handle is dropped.
    pub fn spawn(
        store: Arc<dyn BoardStore>,
        batcher: PersistenceBatcher,
        queue_capacity: usize,
    ) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let boards: Boards = Arc::new(RwLock::new(HashMap::new()));
        let hub = Self { rx, boards: boards.clone(), store, batcher };
        let task = tokio::spawn(hub.run());
        (HubHandle { tx, boards }, task)
    }

    async fn run(mut self) {
        info!("hub control loop started");
        while let Some(command) = self.rx.recv().await {
            match command {
                HubCommand::Join { session, ack } => {
                    self.join(session).await;
                    let _ = ack.send(());
                }
                HubCommand::Leave { board_id, session_id, ack } => {
                    let removed = self.leave(&board_id, session_id).await;
                    let _ = ack.send(removed);
                }
                HubCommand::Route { session_id, message } => self.route(session_id, message).await,
                #[cfg(test)]
                HubCommand::Settle(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        info!("hub control loop stopped");
    }

    async fn join(&mut self, session: SessionHandle) {
        let board_id = session.board_id.clone();
        let session_id = session.session_id;
        let user_id = session.user_id;
        {
            let mut boards = self.boards.write().await;
            let sessions = boards.entry(board_id.clone()).or_insert_with(|| {
                info!(%board_id, "board activated");
                SessionSet::new()
            });
            sessions.insert(session_id, session);
            info!(%board_id, %session_id, %user_id, online = sessions.len(), "session joined board");
        }
        self.push_snapshot(&board_id, session_id).await;
    }

    async fn leave(&mut self, board_id: &BoardId, session_id: Uuid) -> bool {
        let mut boards = self.boards.write().await;
        let Some(sessions) = boards.get_mut(board_id) else {
            return false;
        };
        let Some(session) = sessions.remove(&session_id) else {
            return false;
        };
        let remaining = sessions.len();
        if remaining == 0 {
            boards.remove(board_id);
        }
        drop(boards);

        info!(%board_id, %session_id, user_id = %session.user_id, remaining, "session left board");
        if remaining == 0 {
            info!(%board_id, "board released");
        }
        true
    }

    async fn route(&mut self, session_id: Uuid, message: Message) {
        match router::dispatch(&self.batcher, &message).await {
            Outcome::BroadcastAll => self.deliver(Arc::new(message), Scope::All).await,
            Outcome::BroadcastOthers => {
                let sender = message.user_id;
                self.deliver(Arc::new(message), Scope::Others { sender }).await;
            }
            Outcome::ReplySnapshot => self.push_snapshot(&message.board_id, session_id).await,
            Outcome::Drop => {}
        }
    }

    async fn deliver(&mut self, message: Arc<Message>, scope: Scope) {
        let board_id = &message.board_id;
        let mut boards = self.boards.write().await;
        let Some(sessions) = boards.get_mut(board_id) else {
            debug!(%board_id, kind = message.kind(), "no sessions on board; message not delivered");
            return;
        };
        let delivery = broadcast::deliver(sessions, &message, scope);
        let emptied = sessions.is_empty();
        if emptied {
            boards.remove(board_id);
        }
        drop(boards);

        for (session, reason) in delivery.evicted {
            match reason {
                DeliveryError::Full => warn!(
                    %board_id, session_id = %session.session_id, user_id = %session.user_id,
                    "outbound queue full; session unregistered"
                ),
                DeliveryError::Closed => debug!(
                    %board_id, session_id = %session.session_id,
                    "outbound queue closed; session unregistered"
                ),
            }
        }
        if emptied {
            info!(%board_id, "board released");
        }
    }

    /// Send the board snapshot to one session. Never evicts.
    async fn push_snapshot(&self, board_id: &BoardId, session_id: Uuid) {
        let snapshot = match self.store.snapshot(board_id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                debug!(%board_id, %session_id, "board has no stored state; sync skipped");
                return;
            }
            Err(e) => {
                warn!(error = %e, %board_id, %session_id, "snapshot load failed; sync skipped");
                return;
            }
        };

        let message = Arc::new(Message::sync(board_id.clone(), snapshot));
        let boards = self.boards.read().await;
        let Some(session) = boards.get(board_id).and_then(|sessions| sessions.get(&session_id)) else {
            return;
        };
        if let Err(e) = session.try_deliver(&message) {
            debug!(error = %e, %board_id, %session_id, "sync dropped");
        }
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
