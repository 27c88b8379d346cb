//! Coach configuration handlers

use axum::{extract::State, Json};
use std::sync::Arc;

use crate::config::CoachConfig;
use crate::error::Result;
use crate::state::AppState;

use super::types::CoachConfigUpdate;

/// Get coach configuration
pub async fn get_coach_config(State(state): State<Arc<AppState>>) -> Json<CoachConfig> {
    Json(state.config.get().coach.clone())
}

/// Update coach configuration. Takes effect on the next `session.update`.
pub async fn update_coach_config(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CoachConfigUpdate>,
) -> Result<Json<CoachConfig>> {
    req.validate()?;

    state
        .config
        .update(|config| {
            req.apply_to(&mut config.coach);
        })
        .await?;

    Ok(Json(state.config.get().coach.clone()))
}
