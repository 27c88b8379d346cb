//! Coach event types
//!
//! Defines the events the client pipeline broadcasts for UI consumption.

use serde::{Deserialize, Serialize};

use crate::coach::ConnectionState;

/// Coach event enumeration
///
/// Serialized as `{"event": "...", "data": {...}}`:
/// ```json
/// {"event": "coach.speaking_changed", "data": {"speaking": true}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum CoachEvent {
    /// Connection state machine moved
    #[serde(rename = "coach.state_changed")]
    StateChanged { state: ConnectionState },

    /// Coach started or finished a spoken response
    #[serde(rename = "coach.speaking_changed")]
    SpeakingChanged { speaking: bool },

    /// A captured frame was dropped instead of transmitted
    #[serde(rename = "coach.frame_dropped")]
    FrameDropped { reason: String },

    /// Terminal failure, surfaced once per connection
    #[serde(rename = "coach.error")]
    Error { message: String },
}

impl CoachEvent {
    /// Event name used in the serialized form
    pub fn event_name(&self) -> &'static str {
        match self {
            CoachEvent::StateChanged { .. } => "coach.state_changed",
            CoachEvent::SpeakingChanged { .. } => "coach.speaking_changed",
            CoachEvent::FrameDropped { .. } => "coach.frame_dropped",
            CoachEvent::Error { .. } => "coach.error",
        }
    }
}
