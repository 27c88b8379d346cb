//! Session/context protocol multiplexed over the bridged channel

pub mod messages;

pub use messages::{
    AudioFormat, ContentPart, ControlMessage, ConversationItem, Modality, SessionConfig,
    ServiceErrorDetail, TurnDetection, TurnDetectionMode,
};

/// WebSocket close codes (RFC 6455 §7.4)
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Used for a missing upstream credential
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Used for upstream transport failures
    pub const INTERNAL_ERROR: u16 = 1011;

    /// Whether an endpoint may put `code` in a close frame it sends.
    ///
    /// 1005, 1006 and 1015 are reserved for local reporting only.
    pub fn is_sendable(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }
}
