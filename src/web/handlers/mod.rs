pub mod config;

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::relay::RelaySnapshot;
use crate::state::AppState;

// ============================================================================
// Health & Status
// ============================================================================

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Relay status response
#[derive(Serialize)]
pub struct RelayStatusResponse {
    /// Number of bridged sessions currently open
    pub active: usize,
    /// Whether an upstream credential resolves (the credential itself is never returned)
    pub credential_configured: bool,
    pub relays: Vec<RelaySnapshot>,
}

pub async fn relay_status(State(state): State<Arc<AppState>>) -> Json<RelayStatusResponse> {
    let relays = state.relay.registry().snapshot();
    Json(RelayStatusResponse {
        active: relays.len(),
        credential_configured: state.config.get().upstream.credential().is_some(),
        relays,
    })
}
