//! Control messages carried over the bridged channel
//!
//! The relay never looks at these; only the two endpoints do. Every
//! message is a JSON text frame tagged by its `type` field.

use serde::{Deserialize, Serialize};

use crate::config::CoachConfig;
use crate::error::Result;

/// Tagged control message. Exactly one variant per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Session configuration, sent once right after connecting
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Replaces the coach's working context with a new card
    #[serde(rename = "conversation.item.create")]
    ContextInject { item: ConversationItem },

    /// One captured PCM16 frame, base64 encoded
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend { audio: String },

    #[serde(rename = "response.created")]
    ResponseCreated,

    /// Chunk of synthesized PCM16 audio, base64 encoded
    #[serde(rename = "response.audio.delta")]
    ResponseAudioDelta { delta: String },

    #[serde(rename = "response.done")]
    ResponseDone,

    /// Error event reported by the upstream service
    #[serde(rename = "error")]
    ServiceError { error: ServiceErrorDetail },

    /// Any message type this endpoint does not act on
    #[serde(other, skip_serializing)]
    Unhandled,
}

impl ControlMessage {
    /// Build the `session.update` message from coach configuration
    pub fn session_update(config: &CoachConfig) -> Self {
        ControlMessage::SessionUpdate {
            session: SessionConfig::from_config(config),
        }
    }

    /// Build a user-role text item for `conversation.item.create`
    pub fn context_inject(text: impl Into<String>) -> Self {
        ControlMessage::ContextInject {
            item: ConversationItem {
                kind: ItemKind::Message,
                role: Role::User,
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    pub fn audio_append(audio_base64: String) -> Self {
        ControlMessage::AudioAppend {
            audio: audio_base64,
        }
    }

    /// Wire name of the message type
    pub fn type_name(&self) -> &'static str {
        match self {
            ControlMessage::SessionUpdate { .. } => "session.update",
            ControlMessage::ContextInject { .. } => "conversation.item.create",
            ControlMessage::AudioAppend { .. } => "input_audio_buffer.append",
            ControlMessage::ResponseCreated => "response.created",
            ControlMessage::ResponseAudioDelta { .. } => "response.audio.delta",
            ControlMessage::ResponseDone => "response.done",
            ControlMessage::ServiceError { .. } => "error",
            ControlMessage::Unhandled => "unhandled",
        }
    }

    /// Serialize to the JSON text frame payload
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Output/input modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Text,
    Audio,
}

/// Audio encoding used on both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioFormat {
    #[serde(rename = "pcm16")]
    Pcm16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnDetectionMode {
    #[serde(rename = "server_vad")]
    ServerVad,
}

/// Server-side voice activity detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub mode: TurnDetectionMode,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

/// Payload of `session.update`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<Modality>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: AudioFormat,
    pub output_audio_format: AudioFormat,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
}

impl SessionConfig {
    pub fn from_config(config: &CoachConfig) -> Self {
        Self {
            modalities: vec![Modality::Text, Modality::Audio],
            instructions: config.instructions.clone(),
            voice: config.voice.clone(),
            input_audio_format: AudioFormat::Pcm16,
            output_audio_format: AudioFormat::Pcm16,
            turn_detection: TurnDetection {
                mode: TurnDetectionMode::ServerVad,
                threshold: config.vad_threshold,
                prefix_padding_ms: config.prefix_padding_ms,
                silence_duration_ms: config.silence_duration_ms,
            },
            temperature: config.temperature,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

/// Payload of `conversation.item.create`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ConversationItem {
    /// Concatenated text of all text parts
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(|part| match part {
                ContentPart::InputText { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Body of an upstream `error` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceErrorDetail {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: String,
}
