//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It carries only handles: the hub owns session membership, the verifier
//! owns credentials, and per-connection limits are plain config.

use std::sync::Arc;

use crate::config::SessionConfig;
use crate::services::hub::HubHandle;
use crate::services::identity::IdentityVerifier;

/// Clone is required by Axum; every field is a handle or `Copy`.
#[derive(Clone)]
pub struct AppState {
    pub hub: HubHandle,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub session: SessionConfig,
}

impl AppState {
    #[must_use]
    pub fn new(hub: HubHandle, verifier: Arc<dyn IdentityVerifier>, session: SessionConfig) -> Self {
        Self { hub, verifier, session }
    }
}
