//! Audio capture, encoding and playback
//!
//! This module provides:
//! - PCM16 codec used on the wire
//! - Microphone capture framed into fixed-size PCM16 frames
//! - Gapless playback scheduling on a monotonic output clock
//! - ALSA microphone and speaker backends
//! - Audio device enumeration

pub mod capture;
pub mod device;
pub mod output;
pub mod pcm;
pub mod playback;

pub use capture::{
    AlsaMicrophone, AudioCapturer, CaptureSettings, CaptureState, FrameAssembler, FrameSink,
    MicrophoneBackend, SampleSource,
};
pub use device::{enumerate_audio_devices, AudioDeviceInfo, DeviceKind};
pub use output::{AlsaSpeaker, AlsaSpeakerBackend, PlayoutQueue};
pub use playback::{
    AudioOutput, AudioPlaybackScheduler, PlaybackStats, ScheduledBuffer, SpeakerBackend,
};
