//! Persistence batcher — periodic write-back of accumulated draws.
//!
//! DESIGN
//! ======
//! Draw events are appended to a per-board pending queue and fanned out
//! immediately; a timer task swaps the whole pending map out every interval
//! and appends each board's objects to the store in arrival order. Live
//! broadcast latency never waits on storage.
//!
//! The pending map is the one piece of state shared between the hub's
//! control loop (enqueue/discard) and the flush timer, so it sits behind a
//! narrow `std::sync::Mutex` that is never held across an await.
//!
//! Swapped-out draws sit in an in-flight map until the cycle reaches their
//! board. Durable writes are serialized per board by an async gate: the cycle
//! takes a board's in-flight draws only while holding that board's gate, and
//! clear and delete discard from both maps under the same gate. So a clear
//! either discards those draws first or runs after they land, and it waits
//! only on its own board's appends. Gates exist only while someone holds or
//! waits on them.
//!
//! The timer stops cooperatively: shutdown is observed between cycles, so an
//! in-flight cycle always finishes appending what it took.
//!
//! ERROR HANDLING
//! ==============
//! A failed append is logged and the object is dropped for good. Later
//! objects and other boards are still attempted. Worst-case loss on a crash
//! is one interval of draws.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{OwnedMutexGuard, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::message::{BoardId, DrawObject};
use crate::services::board_store::{BoardStore, StoreError};

/// Per-board draws awaiting durable append, in arrival order.
pub type PendingSaves = HashMap<BoardId, Vec<DrawObject>>;

type BoardGates = HashMap<BoardId, Arc<tokio::sync::Mutex<()>>>;

/// Draws not yet durable: still accepting, or swapped out by a cycle that has
/// not reached their board yet.
#[derive(Default)]
struct Queues {
    pending: PendingSaves,
    in_flight: PendingSaves,
}

impl Queues {
    fn discard(&mut self, board_id: &BoardId) -> usize {
        [&mut self.pending, &mut self.in_flight]
            .into_iter()
            .filter_map(|saves| saves.remove(board_id))
            .map(|objects| objects.len())
            .sum()
    }

    fn discard_object(&mut self, board_id: &BoardId, object_id: &str) -> bool {
        let mut removed = false;
        for saves in [&mut self.pending, &mut self.in_flight] {
            let Some(objects) = saves.get_mut(board_id) else {
                continue;
            };
            let before = objects.len();
            objects.retain(|obj| obj.id != object_id);
            removed |= objects.len() != before;
            if objects.is_empty() {
                saves.remove(board_id);
            }
        }
        removed
    }
}

/// Outcome of one flush cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub boards: usize,
    pub appended: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct PersistenceBatcher {
    store: Arc<dyn BoardStore>,
    queues: Arc<Mutex<Queues>>,
    gates: Arc<Mutex<BoardGates>>,
}

/// Exclusive hold on one board's durable writes.
struct BoardGuard<'a> {
    batcher: &'a PersistenceBatcher,
    board_id: &'a BoardId,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for BoardGuard<'_> {
    fn drop(&mut self) {
        self.held.take();
        // Only the map's own reference left: nobody holds or waits on it.
        let mut gates = self.batcher.lock_gates();
        if gates.get(self.board_id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(self.board_id);
        }
    }
}

impl PersistenceBatcher {
    #[must_use]
    pub fn new(store: Arc<dyn BoardStore>) -> Self {
        Self {
            store,
            queues: Arc::new(Mutex::new(Queues::default())),
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock_queues(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_gates(&self) -> MutexGuard<'_, BoardGates> {
        self.gates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn lock_board<'a>(&'a self, board_id: &'a BoardId) -> BoardGuard<'a> {
        let gate = self.lock_gates().entry(board_id.clone()).or_default().clone();
        let held = gate.lock_owned().await;
        BoardGuard { batcher: self, board_id, held: Some(held) }
    }

    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.lock_gates().len()
    }

    /// Queue a draw for the next flush. Never waits on storage.
    pub fn enqueue(&self, board_id: &BoardId, object: DrawObject) {
        self.lock_queues()
            .pending
            .entry(board_id.clone())
            .or_default()
            .push(object);
    }

    /// Drop every not-yet-durable draw for a board. Returns how many were dropped.
    pub fn discard(&self, board_id: &BoardId) -> usize {
        self.lock_queues().discard(board_id)
    }

    /// Drop a not-yet-durable draw so a delete is not undone by a flush.
    pub fn discard_object(&self, board_id: &BoardId, object_id: &str) -> bool {
        self.lock_queues().discard_object(board_id, object_id)
    }

    /// Draws for a board that are not durable yet.
    #[must_use]
    pub fn pending_count(&self, board_id: &BoardId) -> usize {
        let queues = self.lock_queues();
        [&queues.pending, &queues.in_flight]
            .into_iter()
            .filter_map(|saves| saves.get(board_id))
            .map(Vec::len)
            .sum()
    }

    /// Clear a board durably and drop its pending draws. Waits for an
    /// in-flight append on the same board, not for other boards.
    ///
    /// # Errors
    ///
    /// Returns the store error if the durable clear fails. Pending draws are
    /// discarded either way.
    pub async fn clear_board(&self, board_id: &BoardId) -> Result<usize, StoreError> {
        let _gate = self.lock_board(board_id).await;
        let discarded = self.discard(board_id);
        if discarded > 0 {
            debug!(%board_id, discarded, "discarded pending draws on clear");
        }
        self.store.clear(board_id).await?;
        Ok(discarded)
    }

    /// Remove one object durably, dropping it from the pending queues first.
    /// Returns whether the object was still pending.
    ///
    /// # Errors
    ///
    /// Returns the store error if the durable remove fails.
    pub async fn remove_object(&self, board_id: &BoardId, object_id: &str) -> Result<bool, StoreError> {
        let _gate = self.lock_board(board_id).await;
        let was_pending = self.discard_object(board_id, object_id);
        self.store.remove_object(board_id, object_id).await?;
        Ok(was_pending)
    }

    /// Run one flush cycle: swap out all pending draws, then append them
    /// board by board in arrival order.
    pub async fn flush(&self) -> FlushReport {
        // PHASE: SWAP
        // WHY: enqueue keeps running against a fresh map while we do I/O.
        let boards = {
            let mut queues = self.lock_queues();
            let swapped = std::mem::take(&mut queues.pending);
            let boards: Vec<BoardId> = swapped.keys().cloned().collect();
            for (board_id, objects) in swapped {
                queues.in_flight.entry(board_id).or_default().extend(objects);
            }
            boards
        };

        // PHASE: APPEND
        // WHY: the board gate orders these appends against clear and delete.
        let mut report = FlushReport::default();
        for board_id in boards {
            let _gate = self.lock_board(&board_id).await;
            let Some(objects) = self.lock_queues().in_flight.remove(&board_id) else {
                continue;
            };
            if objects.is_empty() {
                continue;
            }

            report.boards += 1;
            for object in &objects {
                match self.store.append_object(&board_id, object).await {
                    Ok(()) => report.appended += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(error = %e, %board_id, object_id = %object.id, "draw append failed; object dropped");
                    }
                }
            }
        }

        if report.boards > 0 {
            info!(boards = report.boards, appended = report.appended, failed = report.failed, "flushed pending draws");
        }
        report
    }
}

/// Handle to the running flush timer. Dropping it also stops the timer.
pub struct FlushTask {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FlushTask {
    /// Stop the timer and wait for it. A cycle already running finishes first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "flush timer ended abnormally");
        }
    }
}

/// Spawn the flush timer.
pub fn spawn_flush_task(batcher: PersistenceBatcher, interval: Duration) -> FlushTask {
    let flush_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    info!(flush_interval_ms, "draw persistence flush configured");
    let (stop, mut stopped) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                biased;
                _ = stopped.changed() => break,
                _ = ticker.tick() => {}
            }
            batcher.flush().await;
        }
        debug!("flush timer stopped");
    });
    FlushTask { stop, task }
}

#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
