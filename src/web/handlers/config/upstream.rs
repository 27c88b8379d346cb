//! Upstream configuration handlers

use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::state::AppState;

use super::types::{UpstreamConfigResponse, UpstreamConfigUpdate};

/// Get upstream configuration (the stored credential is never returned)
pub async fn get_upstream_config(
    State(state): State<Arc<AppState>>,
) -> Json<UpstreamConfigResponse> {
    Json(UpstreamConfigResponse::from(&state.config.get().upstream))
}

/// Update upstream configuration. Applies to relays opened afterwards.
pub async fn update_upstream_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<UpstreamConfigUpdate>,
) -> Result<Json<UpstreamConfigResponse>> {
    req.validate()?;

    state
        .config
        .update(|config| {
            req.apply_to(&mut config.upstream);
        })
        .await?;

    if req.api_key.is_some() {
        info!("Stored upstream credential updated");
    }

    Ok(Json(UpstreamConfigResponse::from(
        &state.config.get().upstream,
    )))
}
