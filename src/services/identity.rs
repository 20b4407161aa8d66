//! Identity verification for websocket upgrades.
//!
//! ARCHITECTURE
//! ============
//! The surrounding request layer hands out short-lived, single-use tickets;
//! the upgrade handler trades one for a user id before any session exists.
//! The realtime core never sees credentials.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive (`DELETE ... RETURNING`) to guarantee
//! single use; a reconnecting client must fetch a fresh ticket.

use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Turns a connection credential into a stable user id.
#[async_trait::async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// `Ok(None)` means the credential was rejected.
    async fn verify(&self, credential: &str) -> Result<Option<Uuid>, IdentityError>;
}

/// Consumes one-time tickets from the `ws_tickets` table.
pub struct TicketVerifier {
    pool: PgPool,
}

impl TicketVerifier {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IdentityVerifier for TicketVerifier {
    async fn verify(&self, credential: &str) -> Result<Option<Uuid>, IdentityError> {
        let row = sqlx::query("DELETE FROM ws_tickets WHERE ticket = $1 AND expires_at > now() RETURNING user_id")
            .bind(credential)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("user_id")))
    }
}

/// Development verifier: the credential is the user id itself.
pub struct DevVerifier;

#[async_trait::async_trait]
impl IdentityVerifier for DevVerifier {
    async fn verify(&self, credential: &str) -> Result<Option<Uuid>, IdentityError> {
        Ok(Uuid::parse_str(credential).ok().filter(|id| !id.is_nil()))
    }
}

#[cfg(test)]
#[path = "identity_test.rs"]
mod tests;
