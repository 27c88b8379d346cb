//! Relay WebSocket handler
//!
//! `/api/relay` upgrades the client connection and bridges it to the
//! upstream realtime service. Requests that are not WebSocket upgrades are
//! rejected before anything is dialed.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::relay::split_axum;
use crate::state::AppState;

/// Relay WebSocket upgrade handler
pub async fn relay_ws_handler(
    State(state): State<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_relay_socket(socket, state)),
        Err(rejection) => {
            warn!("Rejected non-upgrade relay request: {}", rejection);
            AppError::Protocol(format!("Expected a WebSocket upgrade: {}", rejection))
                .into_response()
        }
    }
}

async fn handle_relay_socket(socket: WebSocket, state: Arc<AppState>) {
    debug!("Relay client connected");
    // Snapshot so a config change mid-session does not affect this relay
    let upstream = state.config.get().upstream.clone();
    let (client_tx, client_rx) = split_axum(socket);

    let mut shutdown = state.shutdown_signal();

    tokio::select! {
        outcome = state.relay.run(&upstream, client_tx, client_rx) => {
            debug!("Relay client finished: {:?}", outcome);
        }
        _ = shutdown.recv() => {
            debug!("Relay aborted by server shutdown");
        }
    }
}
