//! ALSA playback device with a sample-accurate clock
//!
//! A writer thread owns the PCM and keeps it fed, writing silence between
//! scheduled buffers. The number of samples the device has consumed is the
//! output clock reported by [`AudioOutput::now`].

use alsa::pcm::{Access, Format, HwParams, State};
use alsa::{Direction, ValueOr, PCM};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

use super::playback::{AudioOutput, ScheduledBuffer, SpeakerBackend};
use crate::error::{AppError, Result};

struct QueuedBuffer {
    start_sample: u64,
    samples: Vec<f32>,
}

/// Turns scheduled buffers into a continuous sample stream.
///
/// A buffer begins at its scheduled sample or, if that point has already
/// been written, immediately. It always plays in full before the next one.
#[derive(Default)]
pub struct PlayoutQueue {
    pending: VecDeque<QueuedBuffer>,
    current: Option<(QueuedBuffer, usize)>,
}

impl PlayoutQueue {
    pub fn push(&mut self, buffer: ScheduledBuffer, sample_rate: u32) {
        if buffer.samples.is_empty() {
            return;
        }
        let start_sample = (buffer.start * sample_rate as f64).round().max(0.0) as u64;
        self.pending.push_back(QueuedBuffer {
            start_sample,
            samples: buffer.samples,
        });
    }

    /// Fill `out` with the samples for positions `position..position + out.len()`
    pub fn fill(&mut self, position: u64, out: &mut [f32]) {
        for (i, slot) in out.iter_mut().enumerate() {
            let at = position + i as u64;
            *slot = 0.0;

            if self.current.is_none() {
                match self.pending.front() {
                    Some(next) if next.start_sample <= at => {
                        self.current = self.pending.pop_front().map(|b| (b, 0));
                    }
                    _ => continue,
                }
            }

            if let Some((buffer, pos)) = &mut self.current {
                *slot = buffer.samples[*pos];
                *pos += 1;
                if *pos >= buffer.samples.len() {
                    self.current = None;
                }
            }
        }
    }
}

/// Opens ALSA playback devices
#[derive(Debug, Clone)]
pub struct AlsaSpeakerBackend {
    pub device_name: String,
    pub sample_rate: u32,
    pub period_frames: u32,
}

impl AlsaSpeakerBackend {
    pub fn new(device_name: impl Into<String>, sample_rate: u32, period_frames: u32) -> Self {
        Self {
            device_name: device_name.into(),
            sample_rate,
            period_frames,
        }
    }

    fn open_pcm(&self) -> Result<PCM> {
        let pcm = PCM::new(&self.device_name, Direction::Playback, false).map_err(|e| {
            AppError::Hardware(format!(
                "Failed to open playback device {}: {}",
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
            hwp.set_buffer_size_near((self.period_frames * 4) as alsa::pcm::Frames)
                .map_err(|e| AppError::Hardware(format!("Failed to set buffer size: {}", e)))?;
            pcm.hw_params(&hwp)
                .map_err(|e| AppError::Hardware(format!("Failed to apply hw params: {}", e)))?;
        }

        pcm.prepare()
            .map_err(|e| AppError::Hardware(format!("Failed to prepare PCM: {}", e)))?;
        Ok(pcm)
    }
}

impl SpeakerBackend for AlsaSpeakerBackend {
    fn open(&self) -> Result<Box<dyn AudioOutput>> {
        let pcm = self.open_pcm()?;
        info!(
            "Speaker {} opened: {}Hz mono f32",
            self.device_name, self.sample_rate
        );

        let shared = Arc::new(Shared {
            queue: Mutex::new(PlayoutQueue::default()),
            played: AtomicU64::new(0),
            stop: AtomicBool::new(false),
        });

        let thread = {
            let shared = shared.clone();
            let period = self.period_frames.max(1) as usize;
            std::thread::Builder::new()
                .name("speaker-writer".to_string())
                .spawn(move || {
                    if let Err(e) = writer_loop(pcm, &shared, period) {
                        error!("Speaker writer stopped: {}", e);
                    }
                })
                .map_err(|e| AppError::Hardware(format!("Failed to spawn writer: {}", e)))?
        };

        Ok(Box::new(AlsaSpeaker {
            shared,
            sample_rate: self.sample_rate,
            thread: Some(thread),
        }))
    }
}

struct Shared {
    queue: Mutex<PlayoutQueue>,
    /// Samples consumed by the device
    played: AtomicU64,
    stop: AtomicBool,
}

/// Playback device handle. Dropping it stops the writer and closes the PCM.
pub struct AlsaSpeaker {
    shared: Arc<Shared>,
    sample_rate: u32,
    thread: Option<JoinHandle<()>>,
}

impl AudioOutput for AlsaSpeaker {
    fn now(&self) -> f64 {
        self.shared.played.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn submit(&mut self, buffer: ScheduledBuffer) -> Result<()> {
        if self.thread.as_ref().map_or(true, |t| t.is_finished()) {
            return Err(AppError::Hardware("Speaker writer is not running".to_string()));
        }
        self.shared.queue.lock().push(buffer, self.sample_rate);
        Ok(())
    }
}

impl Drop for AlsaSpeaker {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!("Speaker released");
    }
}

fn writer_loop(pcm: PCM, shared: &Shared, period: usize) -> Result<()> {
    let mut buf = vec![0f32; period];
    let mut written: u64 = 0;

    while !shared.stop.load(Ordering::Relaxed) {
        shared.queue.lock().fill(written, &mut buf);

        if pcm.state() == State::XRun {
            warn!("Playback underrun, recovering");
            let _ = pcm.prepare();
        }

        let io = pcm
            .io_f32()
            .map_err(|e| AppError::Hardware(format!("Failed to get PCM io: {}", e)))?;
        written += write_period(
            &buf,
            &shared.stop,
            |chunk| match io.writei(chunk) {
                Ok(frames) => Ok(frames),
                Err(e) if is_underrun(&e) => Err(WriteError::Underrun),
                Err(e) => Err(WriteError::Fatal(e.to_string())),
            },
            || {
                let _ = pcm.prepare();
            },
        )?;

        let delay = pcm.delay().unwrap_or(0).max(0) as u64;
        shared
            .played
            .store(written.saturating_sub(delay), Ordering::Release);
    }

    // Dropping the PCM here releases the device without draining
    Ok(())
}

fn is_underrun(e: &alsa::Error) -> bool {
    let desc = e.to_string();
    desc.contains("EPIPE") || desc.contains("Broken pipe")
}

enum WriteError {
    Underrun,
    Fatal(String),
}

/// Write one period in full, re-preparing the device after an underrun so
/// samples already pulled from the queue are not lost. Returns the number
/// of frames written, which is short only when `stop` is raised.
fn write_period<W, R>(buf: &[f32], stop: &AtomicBool, mut write: W, mut recover: R) -> Result<u64>
where
    W: FnMut(&[f32]) -> std::result::Result<usize, WriteError>,
    R: FnMut(),
{
    let mut offset = 0;
    while offset < buf.len() && !stop.load(Ordering::Relaxed) {
        match write(&buf[offset..]) {
            Ok(frames) => offset += frames,
            Err(WriteError::Underrun) => {
                warn!("Playback underrun, rewriting period");
                recover();
            }
            Err(WriteError::Fatal(e)) => {
                return Err(AppError::Hardware(format!("Audio write error: {}", e)))
            }
        }
    }
    Ok(offset as u64)
}
