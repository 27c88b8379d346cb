use serde::{Deserialize, Serialize};
use typeshare::typeshare;

/// Persona the coach speaks with. Encouraging but critical, never gives the answer away.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a technical interviewer helping a candidate practice coding problems. Be encouraging but critical. Give subtle hints without revealing the solution. The candidate will explain their approach verbally, and you should:
1. Listen carefully to their reasoning
2. Point out logical flaws or edge cases they might have missed
3. Ask clarifying questions
4. Give hints only when they're stuck
5. Never directly give the solution
6. Be concise and conversational";

/// PCM16 sample rate shared by capture, playback and the upstream session
pub const SAMPLE_RATE: u32 = 24000;

/// Main application configuration
#[typeshare]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Upstream realtime service settings
    pub upstream: UpstreamConfig,
    /// Coaching session parameters sent in `session.update`
    pub coach: CoachConfig,
    /// Client-side audio devices and framing
    pub audio: AudioConfig,
}

/// Web server configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8080,
        }
    }
}

/// Upstream realtime service configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Realtime endpoint base URL
    pub url: String,
    /// Model query parameter
    pub model: String,
    /// Environment variable consulted first for the credential
    pub api_key_env: String,
    /// Stored credential, used when the environment variable is unset
    pub api_key: Option<String>,
    /// Value of the `OpenAI-Beta` header
    pub beta_header: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://api.openai.com/v1/realtime".to_string(),
            model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            beta_header: "realtime=v1".to_string(),
        }
    }
}

impl UpstreamConfig {
    /// Resolve the upstream credential: environment first, stored key second.
    /// Blank values count as absent.
    pub fn credential(&self) -> Option<String> {
        let from_env = std::env::var(&self.api_key_env).ok();
        from_env
            .into_iter()
            .chain(self.api_key.clone())
            .map(|key| key.trim().to_string())
            .find(|key| !key.is_empty())
    }

    /// Full endpoint URL including the model parameter
    pub fn endpoint(&self) -> String {
        if self.model.is_empty() {
            return self.url.clone();
        }
        let sep = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}model={}", self.url, sep, self.model)
    }
}

/// Coaching session configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoachConfig {
    /// Voice identifier
    pub voice: String,
    /// System instructions defining the coaching persona
    pub instructions: String,
    /// Response randomness
    pub temperature: f32,
    /// Server VAD activation threshold (0.0 - 1.0)
    pub vad_threshold: f32,
    /// Audio kept before detected speech start
    pub prefix_padding_ms: u32,
    /// Trailing silence that ends a user turn
    pub silence_duration_ms: u32,
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            voice: "alloy".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            temperature: 0.8,
            vad_threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 1000,
        }
    }
}

/// Client-side audio configuration
#[typeshare]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// ALSA capture device name
    pub capture_device: String,
    /// ALSA playback device name
    pub playback_device: String,
    /// Samples per transmitted frame (4096 = ~170ms at 24kHz)
    pub frame_samples: u32,
    /// ALSA period size in frames
    pub period_frames: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_device: "default".to_string(),
            playback_device: "default".to_string(),
            frame_samples: 4096,
            period_frames: 1024,
        }
    }
}
