//! Microphone capture and PCM16 framing
//!
//! A capture runs on a blocking thread that owns the input device. Samples
//! are collected into fixed-size frames, encoded to PCM16 and handed to a
//! [`FrameSink`]. The thread owns the device, so it is released on every
//! exit path: stop, drop of the capturer, or a read failure.

use alsa::pcm::{Access, Format, HwParams, State};
use alsa::{Direction, ValueOr, PCM};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use super::pcm::encode_frame;
use crate::error::{AppError, Result};

/// Blocking source of mono float samples
pub trait SampleSource: Send {
    /// Read up to `buf.len()` samples. Blocks for at most one device period.
    /// `Ok(0)` means nothing was available this period.
    fn read(&mut self, buf: &mut [f32]) -> Result<usize>;
}

/// Something that can acquire a microphone
pub trait MicrophoneBackend: Send + Sync {
    fn open(&self) -> Result<Box<dyn SampleSource>>;
}

/// Receives encoded PCM16 frames. Called from the capture thread and must
/// not block.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, pcm16: Vec<u8>);
}

/// Collects samples into frames of exactly `frame_samples`
#[derive(Debug)]
pub struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples),
        }
    }

    /// Append samples, calling `emit` once per completed frame
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let room = self.frame_samples - self.pending.len();
            let take = room.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_samples {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }

    /// Samples waiting for the current frame to fill
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Capture framing parameters
#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    /// Samples per emitted frame
    pub frame_samples: usize,
    /// Samples requested per device read
    pub read_chunk: usize,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            frame_samples: 4096,
            read_chunk: 1024,
        }
    }
}

/// Capture state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureState {
    Running,
    Stopped,
    /// Device failed mid-capture
    Failed(String),
}

/// Running microphone capture
pub struct AudioCapturer {
    state_rx: watch::Receiver<CaptureState>,
    stop_flag: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl AudioCapturer {
    /// Acquire the microphone and start capturing.
    ///
    /// Returns only after acquisition finished; a failed open surfaces as
    /// `Hardware` with nothing left running.
    pub async fn start(
        backend: Arc<dyn MicrophoneBackend>,
        settings: CaptureSettings,
        sink: Arc<dyn FrameSink>,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(CaptureState::Stopped);
        let (open_tx, open_rx) = oneshot::channel::<Result<()>>();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));

        let handle = {
            let stop_flag = stop_flag.clone();
            let frames = frames.clone();
            tokio::task::spawn_blocking(move || {
                let source = match backend.open() {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let _ = state_tx.send(CaptureState::Running);
                let _ = open_tx.send(Ok(()));

                match capture_loop(source, settings, sink.as_ref(), &stop_flag, &frames) {
                    Ok(()) => {
                        let _ = state_tx.send(CaptureState::Stopped);
                    }
                    Err(e) => {
                        error!("Audio capture error: {}", e);
                        let _ = state_tx.send(CaptureState::Failed(e.to_string()));
                    }
                }
            })
        };

        match open_rx.await {
            Ok(Ok(())) => {
                info!(
                    "Audio capture started ({} samples per frame)",
                    settings.frame_samples
                );
                Ok(Self {
                    state_rx,
                    stop_flag,
                    frames,
                    handle: Some(handle),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.await;
                Err(e)
            }
            Err(_) => {
                let _ = handle.await;
                Err(AppError::Hardware(
                    "Capture thread exited before opening the device".to_string(),
                ))
            }
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state_rx.borrow().clone()
    }

    /// Subscribe to state changes
    pub fn state_watch(&self) -> watch::Receiver<CaptureState> {
        self.state_rx.clone()
    }

    /// Frames handed to the sink so far
    pub fn frames_emitted(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Stop capturing and wait for the device to be released
    pub async fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
            info!(
                "Audio capture stopped after {} frames",
                self.frames.load(Ordering::Relaxed)
            );
        }
    }
}

impl Drop for AudioCapturer {
    fn drop(&mut self) {
        // The thread exits after its current read and drops the device
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

fn capture_loop(
    mut source: Box<dyn SampleSource>,
    settings: CaptureSettings,
    sink: &dyn FrameSink,
    stop_flag: &AtomicBool,
    frames: &AtomicU64,
) -> Result<()> {
    let mut assembler = FrameAssembler::new(settings.frame_samples);
    let mut buf = vec![0f32; settings.read_chunk.max(1)];

    while !stop_flag.load(Ordering::Relaxed) {
        let n = source.read(&mut buf)?;
        if n == 0 {
            continue;
        }
        assembler.push(&buf[..n], |frame| {
            if stop_flag.load(Ordering::Relaxed) {
                return;
            }
            sink.on_frame(encode_frame(frame));
            frames.fetch_add(1, Ordering::Relaxed);
        });
    }

    debug!("Capture loop exiting, {} samples discarded", assembler.pending());
    Ok(())
}

/// ALSA microphone opened as mono FLOAT_LE
#[derive(Debug, Clone)]
pub struct AlsaMicrophone {
    pub device_name: String,
    pub sample_rate: u32,
    pub period_frames: u32,
}

impl AlsaMicrophone {
    pub fn new(device_name: impl Into<String>, sample_rate: u32, period_frames: u32) -> Self {
        Self {
            device_name: device_name.into(),
            sample_rate,
            period_frames,
        }
    }
}

impl MicrophoneBackend for AlsaMicrophone {
    fn open(&self) -> Result<Box<dyn SampleSource>> {
        let pcm = PCM::new(&self.device_name, Direction::Capture, false).map_err(|e| {
            AppError::Hardware(format!(
                "Failed to open audio device {}: {}",
                self.device_name, e
            ))
        })?;

        {
            let hwp = HwParams::any(&pcm)
                .map_err(|e| AppError::Hardware(format!("Failed to get HwParams: {}", e)))?;

            hwp.set_channels(1)
                .map_err(|e| AppError::Hardware(format!("Failed to set channels: {}", e)))?;

            hwp.set_rate(self.sample_rate, ValueOr::Nearest)
                .map_err(|e| AppError::Hardware(format!("Failed to set sample rate: {}", e)))?;

            hwp.set_format(Format::FloatLE)
                .map_err(|e| AppError::Hardware(format!("Failed to set format: {}", e)))?;

            hwp.set_access(Access::RWInterleaved)
                .map_err(|e| AppError::Hardware(format!("Failed to set access: {}", e)))?;

            hwp.set_period_size_near(self.period_frames as alsa::pcm::Frames, ValueOr::Nearest)
                .map_err(|e| AppError::Hardware(format!("Failed to set period size: {}", e)))?;

            pcm.hw_params(&hwp)
                .map_err(|e| AppError::Hardware(format!("Failed to apply hw params: {}", e)))?;
        }

        let actual_rate = pcm
            .hw_params_current()
            .and_then(|h| h.get_rate())
            .unwrap_or(self.sample_rate);
        if actual_rate != self.sample_rate {
            return Err(AppError::Hardware(format!(
                "Device {} does not support {}Hz (got {}Hz)",
                self.device_name, self.sample_rate, actual_rate
            )));
        }

        pcm.prepare()
            .map_err(|e| AppError::Hardware(format!("Failed to prepare PCM: {}", e)))?;

        info!(
            "Microphone {} opened: {}Hz mono f32",
            self.device_name, actual_rate
        );
        Ok(Box::new(AlsaInput { pcm }))
    }
}

struct AlsaInput {
    pcm: PCM,
}

impl SampleSource for AlsaInput {
    fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
        match self.pcm.state() {
            State::XRun => {
                warn!("Audio buffer overrun, recovering");
                let _ = self.pcm.prepare();
                return Ok(0);
            }
            State::Suspended => {
                warn!("Audio device suspended, recovering");
                let _ = self.pcm.resume();
                return Ok(0);
            }
            State::Disconnected => {
                return Err(AppError::Hardware("Microphone disconnected".to_string()));
            }
            _ => {}
        }

        let io = self
            .pcm
            .io_f32()
            .map_err(|e| AppError::Hardware(format!("Failed to get PCM io: {}", e)))?;

        match io.readi(buf) {
            Ok(frames) => Ok(frames),
            Err(e) => {
                let desc = e.to_string();
                if desc.contains("EPIPE") || desc.contains("Broken pipe") {
                    warn!("Audio buffer overrun");
                    let _ = self.pcm.prepare();
                    Ok(0)
                } else {
                    Err(AppError::Hardware(format!("Audio read error: {}", e)))
                }
            }
        }
    }
}
