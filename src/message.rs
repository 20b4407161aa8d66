//! Message — the wire envelope exchanged with board participants.
//!
//! ARCHITECTURE
//! ============
//! Every websocket text frame carries one or more newline-separated JSON
//! messages shaped `{board_id, user_id, type, payload}`. Inbound text is
//! decoded exactly once into the closed `Payload` enum; the router and the
//! broadcast path only ever see the narrowed variant.
//!
//! DESIGN
//! ======
//! - `board_id` and `user_id` are optional on input. The session that read a
//!   message always overwrites both with its own identity.
//! - Tags outside the core set are relayed verbatim (`Payload::Relay`) when
//!   they look like an application tag, and rejected otherwise.
//! - `sync` is server-only; a client cannot forge a snapshot.
//! - A decoded inbound message keeps the client's payload JSON next to the
//!   typed variant. Peers receive that JSON as sent; the typed view only feeds
//!   persistence and routing.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// TYPE TAGS
// =============================================================================

pub const TYPE_DRAW: &str = "draw";
pub const TYPE_DELETE: &str = "delete";
pub const TYPE_CLEAR: &str = "clear";
pub const TYPE_SYNC_REQUEST: &str = "sync_request";
pub const TYPE_SYNC: &str = "sync";

/// Longest tag accepted for relayed application messages.
const MAX_TAG_LEN: usize = 64;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Opaque board identifier. Scopes all membership and broadcast operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardId(String);

impl BoardId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BoardId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for BoardId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<Uuid> for BoardId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

// =============================================================================
// DRAW OBJECTS
// =============================================================================

/// Shape tag of a draw object. Geometry fields are interpreted per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShapeKind {
    Path,
    Line,
    Rect,
    Circle,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// An immutable shape placed on a board. Deleted by id, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrawObject {
    /// Client-generated, unique within a board.
    pub id: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: ShapeKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub points: Vec<Point>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub line_width: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
}

/// Authoritative board state: objects in append order plus a version counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoardSnapshot {
    #[serde(default)]
    pub objects: Vec<DrawObject>,
    #[serde(default)]
    pub version: i64,
}

// =============================================================================
// PAYLOADS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawPayload {
    pub object: DrawObject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    #[serde(rename = "objectId", alias = "object_id")]
    pub object_id: String,
}

/// Closed set of message bodies, one variant per type tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Draw(DrawPayload),
    Delete(DeletePayload),
    Clear,
    SyncRequest,
    /// Server → client only.
    Sync(BoardSnapshot),
    /// Any other application message, relayed to peers untouched.
    Relay { kind: String, body: serde_json::Value },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid message json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("message type {0:?} is server-only")]
    ServerOnly(String),
}

impl DecodeError {
    /// Drops that are expected traffic rather than client bugs.
    #[must_use]
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::UnknownType(_) | Self::ServerOnly(_))
    }
}

impl Payload {
    /// The wire `type` tag for this payload.
    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::Draw(_) => TYPE_DRAW,
            Self::Delete(_) => TYPE_DELETE,
            Self::Clear => TYPE_CLEAR,
            Self::SyncRequest => TYPE_SYNC_REQUEST,
            Self::Sync(_) => TYPE_SYNC,
            Self::Relay { kind, .. } => kind,
        }
    }

    /// Narrow a tagged body. Also hands back the body for variants whose
    /// client JSON is forwarded as received.
    fn decode(kind: String, body: serde_json::Value) -> Result<(Self, Option<serde_json::Value>), DecodeError> {
        match kind.as_str() {
            TYPE_DRAW => {
                let draw = DrawPayload::deserialize(&body)
                    .map_err(|source| DecodeError::Payload { kind: TYPE_DRAW, source })?;
                Ok((Self::Draw(draw), Some(body)))
            }
            TYPE_DELETE => {
                let delete = DeletePayload::deserialize(&body)
                    .map_err(|source| DecodeError::Payload { kind: TYPE_DELETE, source })?;
                Ok((Self::Delete(delete), Some(body)))
            }
            // Bodies of clear and sync_request carry nothing we read.
            TYPE_CLEAR => Ok((Self::Clear, Some(body))),
            TYPE_SYNC_REQUEST => Ok((Self::SyncRequest, Some(body))),
            TYPE_SYNC => Err(DecodeError::ServerOnly(kind)),
            _ if is_application_tag(&kind) => Ok((Self::Relay { kind, body }, None)),
            _ => Err(DecodeError::UnknownType(kind)),
        }
    }

    fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Draw(p) => serde_json::to_value(p),
            Self::Delete(p) => serde_json::to_value(p),
            Self::Clear | Self::SyncRequest => Ok(serde_json::json!({})),
            Self::Sync(snapshot) => serde_json::to_value(snapshot),
            Self::Relay { body, .. } => Ok(body.clone()),
        }
    }
}

/// Lowercase ASCII letters, digits, and `_ - : .`, at most 64 bytes.
fn is_application_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'-' | b':' | b'.'))
}

// =============================================================================
// MESSAGE
// =============================================================================

/// One decoded message, addressed to a board and attributed to a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub board_id: BoardId,
    pub user_id: Uuid,
    pub payload: Payload,
    /// Payload JSON exactly as the client sent it. `None` for server-built
    /// messages, which encode from `payload`.
    raw_payload: Option<serde_json::Value>,
}

/// Serde shape of an inbound envelope. `payload` stays untyped until `Payload::decode`.
#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    board_id: BoardId,
    #[serde(default)]
    user_id: Uuid,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// Serde shape of an outbound envelope.
#[derive(Serialize)]
struct WireMessageRef<'a> {
    board_id: &'a BoardId,
    user_id: Uuid,
    #[serde(rename = "type")]
    kind: &'a str,
    payload: Cow<'a, serde_json::Value>,
}

impl Message {
    #[must_use]
    pub fn new(board_id: BoardId, user_id: Uuid, payload: Payload) -> Self {
        Self { board_id, user_id, payload, raw_payload: None }
    }

    /// Server-originated snapshot push. Carries the nil user id.
    #[must_use]
    pub fn sync(board_id: BoardId, snapshot: BoardSnapshot) -> Self {
        Self::new(board_id, Uuid::nil(), Payload::Sync(snapshot))
    }

    /// Decode one JSON message.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] for malformed JSON, a payload that does not
    /// match its tag, an unknown tag, or a server-only tag.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let wire: WireMessage = serde_json::from_str(text)?;
        let (payload, raw_payload) = Payload::decode(wire.kind, wire.payload)?;
        // A missing payload has nothing to preserve.
        let raw_payload = raw_payload.filter(|raw| !raw.is_null());
        Ok(Self { board_id: wire.board_id, user_id: wire.user_id, payload, raw_payload })
    }

    /// Encode as one JSON object. Decoded messages carry their payload as
    /// received; the envelope fields always reflect the current identity.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload value cannot be represented as JSON.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let payload = match &self.raw_payload {
            Some(raw) => Cow::Borrowed(raw),
            None => Cow::Owned(self.payload.to_value()?),
        };
        let wire = WireMessageRef { board_id: &self.board_id, user_id: self.user_id, kind: self.payload.kind(), payload };
        serde_json::to_string(&wire)
    }

    /// Overwrite the client-declared identity with the session's.
    #[must_use]
    pub fn stamped(mut self, board_id: &BoardId, user_id: Uuid) -> Self {
        self.board_id = board_id.clone();
        self.user_id = user_id;
        self
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        self.payload.kind()
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
