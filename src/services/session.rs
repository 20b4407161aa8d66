//! Session — one participant's websocket, driven by a reader and a writer.
//!
//! DESIGN
//! ======
//! The reader decodes inbound frames, stamps them with the session's board
//! and user, and routes them through the hub. The writer drains the bounded
//! outbound queue the hub fills, coalescing whatever is already queued into
//! one newline-separated text frame, and sends heartbeat pings.
//!
//! Liveness: the read deadline is `pong_wait` and only a pong extends it.
//! Pings go out every `ping_period`. Every write is bounded by `write_wait`.
//!
//! TEARDOWN
//! ========
//! Whichever side stops first ends the session. The hub is told to drop the
//! session, which closes the outbound queue; the writer then sends a close
//! frame and exits. When the hub drops the session first (eviction), the
//! reader stops at once, while the writer still drains what was queued. Both loops are generic over `Stream`/`Sink` so they run
//! against in-memory channels in tests.

use std::fmt;

use axum::body::Bytes;
use axum::extract::ws::Message as WsMessage;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::message::{BoardId, Message};
use crate::services::broadcast::{Outbound, SessionHandle};
use crate::services::hub::HubHandle;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    ClientClosed,
    ReadTimeout,
    ReadError(String),
    WriteTimeout,
    WriteError(String),
    /// The hub dropped the session (leave or eviction).
    QueueClosed,
    HubClosed,
}

impl fmt::Display for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::ReadTimeout => f.write_str("no pong within deadline"),
            Self::ReadError(e) => write!(f, "read failed: {e}"),
            Self::WriteTimeout => f.write_str("write deadline exceeded"),
            Self::WriteError(e) => write!(f, "write failed: {e}"),
            Self::QueueClosed => f.write_str("unregistered by hub"),
            Self::HubClosed => f.write_str("hub stopped"),
        }
    }
}

pub struct Session {
    pub session_id: Uuid,
    pub board_id: BoardId,
    pub user_id: Uuid,
    config: SessionConfig,
}

impl Session {
    #[must_use]
    pub fn new(board_id: BoardId, user_id: Uuid, config: SessionConfig) -> Self {
        Self { session_id: Uuid::new_v4(), board_id, user_id, config }
    }

    /// Register with the hub and drive the socket until either side stops.
    pub async fn run<S>(self, socket: S, hub: HubHandle)
    where
        S: Stream<Item = Result<WsMessage, axum::Error>> + Sink<WsMessage> + Send + 'static,
        <S as Sink<WsMessage>>::Error: fmt::Display + Send,
    {
        let Self { session_id, board_id, user_id, config } = self;
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let mut handle = SessionHandle::new(session_id, user_id, board_id.clone(), tx);
        let released = handle.release_signal();

        if hub.join(handle).await.is_err() {
            warn!(%board_id, %session_id, "hub unavailable; dropping connection");
            return;
        }

        let (sink, stream) = socket.split();
        let mut writer = tokio::spawn(write_loop(sink, rx, config));
        let reader = read_loop(stream, &hub, &board_id, user_id, session_id, config);

        let reason = tokio::select! {
            reason = reader => reason,
            joined = &mut writer => joined.unwrap_or(Teardown::QueueClosed),
            _ = released => Teardown::QueueClosed,
        };

        // Releases the outbound queue; a still-running writer sends close and exits.
        if let Err(e) = hub.leave(board_id.clone(), session_id).await {
            debug!(error = %e, %board_id, %session_id, "leave after hub shutdown");
        }
        if !writer.is_finished() {
            let _ = writer.await;
        }

        info!(%board_id, %session_id, %user_id, %reason, "session closed");
    }
}

/// Decode, stamp, and route inbound frames until the peer goes away.
pub async fn read_loop<R>(
    mut stream: R,
    hub: &HubHandle,
    board_id: &BoardId,
    user_id: Uuid,
    session_id: Uuid,
    config: SessionConfig,
) -> Teardown
where
    R: Stream<Item = Result<WsMessage, axum::Error>> + Unpin,
{
    let mut deadline = Instant::now() + config.pong_wait;
    loop {
        let frame = match timeout_at(deadline, stream.next()).await {
            Err(_) => return Teardown::ReadTimeout,
            Ok(None) => return Teardown::ClientClosed,
            Ok(Some(Err(e))) => return Teardown::ReadError(e.to_string()),
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => {
                let message = match Message::decode(text.as_str()) {
                    Ok(message) => message.stamped(board_id, user_id),
                    Err(e) if e.is_silent() => {
                        debug!(error = %e, %board_id, %session_id, "ignoring inbound message");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, %board_id, %session_id, "dropping malformed inbound message");
                        continue;
                    }
                };
                if hub.route(session_id, message).await.is_err() {
                    return Teardown::HubClosed;
                }
            }
            WsMessage::Pong(_) => deadline = Instant::now() + config.pong_wait,
            WsMessage::Close(_) => return Teardown::ClientClosed,
            WsMessage::Binary(_) | WsMessage::Ping(_) => {}
        }
    }
}

/// Drain the outbound queue onto the socket and keep the peer alive with pings.
pub async fn write_loop<W>(mut sink: W, mut rx: mpsc::Receiver<Outbound>, config: SessionConfig) -> Teardown
where
    W: Sink<WsMessage> + Unpin,
    W::Error: fmt::Display,
{
    let mut ping = tokio::time::interval_at(Instant::now() + config.ping_period, config.ping_period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            next = rx.recv() => {
                let Some(first) = next else {
                    let _ = timeout(config.write_wait, sink.send(WsMessage::Close(None))).await;
                    return Teardown::QueueClosed;
                };
                let batch = drain_batch(first, &mut rx);
                if batch.is_empty() {
                    continue;
                }
                WsMessage::Text(batch.into())
            }
            _ = ping.tick() => WsMessage::Ping(Bytes::new()),
        };

        match timeout(config.write_wait, sink.send(frame)).await {
            Err(_) => return Teardown::WriteTimeout,
            Ok(Err(e)) => return Teardown::WriteError(e.to_string()),
            Ok(Ok(())) => {}
        }
    }
}

/// Encode `first` plus everything already queued behind it, one JSON object
/// per line.
fn drain_batch(first: Outbound, rx: &mut mpsc::Receiver<Outbound>) -> String {
    let queued = rx.len();
    let mut batch = String::new();
    push_encoded(&mut batch, &first);
    for _ in 0..queued {
        let Ok(next) = rx.try_recv() else {
            break;
        };
        push_encoded(&mut batch, &next);
    }
    batch
}

fn push_encoded(batch: &mut String, message: &Message) {
    match message.encode() {
        Ok(json) => {
            if !batch.is_empty() {
                batch.push('\n');
            }
            batch.push_str(&json);
        }
        Err(e) => warn!(error = %e, board_id = %message.board_id, kind = message.kind(), "outbound encode failed"),
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
