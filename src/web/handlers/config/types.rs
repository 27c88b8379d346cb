use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::config::{CoachConfig, UpstreamConfig};
use crate::error::AppError;

// ===== Coach Config =====

#[typeshare]
#[derive(Debug, Deserialize)]
pub struct CoachConfigUpdate {
    pub voice: Option<String>,
    pub instructions: Option<String>,
    pub temperature: Option<f32>,
    pub vad_threshold: Option<f32>,
    pub prefix_padding_ms: Option<u32>,
    pub silence_duration_ms: Option<u32>,
}

impl CoachConfigUpdate {
    pub fn validate(&self) -> crate::error::Result<()> {
        if let Some(ref voice) = self.voice {
            if voice.trim().is_empty() {
                return Err(AppError::BadRequest("Voice must not be empty".into()));
            }
        }
        if let Some(ref instructions) = self.instructions {
            if instructions.trim().is_empty() {
                return Err(AppError::BadRequest("Instructions must not be empty".into()));
            }
        }
        if let Some(temperature) = self.temperature {
            if !(0.6..=1.2).contains(&temperature) {
                return Err(AppError::BadRequest(
                    "Invalid temperature: must be 0.6-1.2".into(),
                ));
            }
        }
        if let Some(threshold) = self.vad_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(AppError::BadRequest(
                    "Invalid VAD threshold: must be 0.0-1.0".into(),
                ));
            }
        }
        if let Some(ms) = self.prefix_padding_ms {
            if ms > 10_000 {
                return Err(AppError::BadRequest(
                    "Invalid prefix padding: must be 0-10000 ms".into(),
                ));
            }
        }
        if let Some(ms) = self.silence_duration_ms {
            if ms > 10_000 {
                return Err(AppError::BadRequest(
                    "Invalid silence duration: must be 0-10000 ms".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut CoachConfig) {
        if let Some(ref voice) = self.voice {
            config.voice = voice.trim().to_string();
        }
        if let Some(ref instructions) = self.instructions {
            config.instructions = instructions.clone();
        }
        if let Some(temperature) = self.temperature {
            config.temperature = temperature;
        }
        if let Some(threshold) = self.vad_threshold {
            config.vad_threshold = threshold;
        }
        if let Some(ms) = self.prefix_padding_ms {
            config.prefix_padding_ms = ms;
        }
        if let Some(ms) = self.silence_duration_ms {
            config.silence_duration_ms = ms;
        }
    }
}

// ===== Upstream Config =====

/// Upstream configuration response (includes `has_api_key` instead of the key)
#[typeshare]
#[derive(Debug, Serialize)]
pub struct UpstreamConfigResponse {
    pub url: String,
    pub model: String,
    pub api_key_env: String,
    pub beta_header: String,
    /// Whether a credential is stored in the configuration
    pub has_api_key: bool,
    /// Whether a credential resolves from the environment or the store
    pub credential_configured: bool,
}

impl From<&UpstreamConfig> for UpstreamConfigResponse {
    fn from(config: &UpstreamConfig) -> Self {
        Self {
            url: config.url.clone(),
            model: config.model.clone(),
            api_key_env: config.api_key_env.clone(),
            beta_header: config.beta_header.clone(),
            has_api_key: config
                .api_key
                .as_deref()
                .map_or(false, |key| !key.trim().is_empty()),
            credential_configured: config.credential().is_some(),
        }
    }
}

/// Runtime-adjustable upstream settings.
///
/// The endpoint URL and the credential's environment variable name are
/// startup-only (`serve --upstream-url/--api-key-env`); a request naming
/// them is rejected.
#[typeshare]
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfigUpdate {
    pub model: Option<String>,
    /// Stored credential; an empty string clears it
    pub api_key: Option<String>,
    pub beta_header: Option<String>,
}

impl UpstreamConfigUpdate {
    pub fn validate(&self) -> crate::error::Result<()> {
        if let Some(ref model) = self.model {
            if model.trim().is_empty() {
                return Err(AppError::BadRequest("Model must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn apply_to(&self, config: &mut UpstreamConfig) {
        if let Some(ref model) = self.model {
            config.model = model.trim().to_string();
        }
        if let Some(ref key) = self.api_key {
            let key = key.trim();
            config.api_key = if key.is_empty() {
                None
            } else {
                Some(key.to_string())
            };
        }
        if let Some(ref beta) = self.beta_header {
            config.beta_header = beta.clone();
        }
    }
}
