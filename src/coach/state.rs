//! Connection state machine

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::error::{AppError, Result};
use crate::events::{CoachEvent, EventBus};

/// Lifecycle of the client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }

    /// Checked transition
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AppError::InvalidState(format!(
                "Cannot move from {:?} to {:?}",
                self, next
            )))
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(s)
    }
}

/// Connection state plus the orthogonal `speaking` flag. Every change is
/// published on the event bus.
pub struct StatusCell {
    state: Mutex<ConnectionState>,
    speaking: AtomicBool,
    events: Arc<EventBus>,
}

impl StatusCell {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            speaking: AtomicBool::new(false),
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst)
    }

    pub fn advance(&self, next: ConnectionState) -> Result<()> {
        {
            let mut state = self.state.lock();
            *state = state.transition(next)?;
        }
        info!("Voice coach {}", next);
        self.events.publish(CoachEvent::StateChanged { state: next });
        Ok(())
    }

    /// Walk back to `Disconnected` from wherever an aborted enable left off
    pub fn reset(&self) {
        if matches!(
            self.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            let _ = self.advance(ConnectionState::Disconnecting);
        }
        if self.state() == ConnectionState::Disconnecting {
            let _ = self.advance(ConnectionState::Disconnected);
        }
    }

    pub fn set_speaking(&self, speaking: bool) {
        if self.speaking.swap(speaking, Ordering::SeqCst) != speaking {
            self.events.publish(CoachEvent::SpeakingChanged { speaking });
        }
    }
}
