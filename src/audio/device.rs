//! Audio device enumeration using ALSA

use alsa::pcm::{Format, HwParams};
use alsa::{Direction, PCM};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SAMPLE_RATE;
use crate::error::Result;

/// Device direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Capture,
    Playback,
}

impl DeviceKind {
    fn direction(self) -> Direction {
        match self {
            DeviceKind::Capture => Direction::Capture,
            DeviceKind::Playback => Direction::Playback,
        }
    }
}

/// Audio device information
#[derive(Debug, Clone, Serialize)]
pub struct AudioDeviceInfo {
    /// Device name (e.g., "hw:0,0" or "default")
    pub name: String,
    pub description: String,
    pub kind: DeviceKind,
    /// Supported sample rates from a common set
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u32>,
    /// Can be opened as mono f32 at the session sample rate
    pub usable: bool,
}

/// Enumerate capture and playback devices
pub fn enumerate_audio_devices() -> Result<Vec<AudioDeviceInfo>> {
    let mut devices = Vec::new();
    for kind in [DeviceKind::Capture, DeviceKind::Playback] {
        devices.extend(enumerate_kind(kind));
    }
    info!("Found {} audio devices", devices.len());
    Ok(devices)
}

fn enumerate_kind(kind: DeviceKind) -> Vec<AudioDeviceInfo> {
    let mut devices = Vec::new();

    for card_result in alsa::card::Iter::new() {
        let card = match card_result {
            Ok(c) => c,
            Err(e) => {
                debug!("Error iterating card: {}", e);
                continue;
            }
        };

        let card_index = card.get_index();
        let card_name = card.get_name().unwrap_or_else(|_| "Unknown".to_string());
        let card_longname = card.get_longname().unwrap_or_else(|_| card_name.clone());
        debug!("Found audio card {}: {}", card_index, card_longname);

        for device_index in 0..8 {
            let device_name = format!("hw:{},{}", card_index, device_index);
            // Missing or busy devices are skipped
            let Ok(pcm) = PCM::new(&device_name, kind.direction(), false) else {
                continue;
            };
            if let Some(info) = describe(
                &pcm,
                device_name,
                format!("{} - Device {}", card_longname, device_index),
                kind,
            ) {
                devices.push(info);
            }
        }
    }

    if let Ok(pcm) = PCM::new("default", kind.direction(), false) {
        if let Some(info) = describe(
            &pcm,
            "default".to_string(),
            "Default Audio Device".to_string(),
            kind,
        ) {
            devices.insert(0, info);
        }
    }

    devices
}

fn describe(
    pcm: &PCM,
    name: String,
    description: String,
    kind: DeviceKind,
) -> Option<AudioDeviceInfo> {
    let (sample_rates, channels, usable) = query_device_caps(pcm);
    if sample_rates.is_empty() || channels.is_empty() {
        return None;
    }
    Some(AudioDeviceInfo {
        name,
        description,
        kind,
        sample_rates,
        channels,
        usable,
    })
}

/// Query device capabilities
fn query_device_caps(pcm: &PCM) -> (Vec<u32>, Vec<u32>, bool) {
    let hwp = match HwParams::any(pcm) {
        Ok(h) => h,
        Err(_) => return (vec![], vec![], false),
    };

    let common_rates = [8000, 16000, 22050, SAMPLE_RATE, 44100, 48000];
    let supported_rates: Vec<u32> = common_rates
        .iter()
        .copied()
        .filter(|rate| hwp.test_rate(*rate).is_ok())
        .collect();

    let supported_channels: Vec<u32> = (1..=8).filter(|ch| hwp.test_channels(*ch).is_ok()).collect();

    let usable = supported_rates.contains(&SAMPLE_RATE)
        && supported_channels.contains(&1)
        && hwp.test_format(Format::FloatLE).is_ok();

    (supported_rates, supported_channels, usable)
}
