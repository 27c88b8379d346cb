//! Gapless playback scheduling
//!
//! Each decoded delta is placed on the output timeline at
//! `max(output clock, cursor)` and the cursor moves to the end of that
//! buffer. Buffers therefore play in receipt order, never overlap, and
//! follow each other without a gap when they arrive ahead of time.

use tracing::{debug, trace};

use super::pcm::decode_base64;
use crate::error::Result;

/// A decoded buffer with its place on the output timeline
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    pub sequence: u64,
    /// Start time on the output clock, in seconds
    pub start: f64,
    /// Duration in seconds
    pub duration: f64,
    pub samples: Vec<f32>,
}

impl ScheduledBuffer {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Output device with a monotonic clock
pub trait AudioOutput: Send {
    /// Current output clock position in seconds
    fn now(&self) -> f64;

    /// Queue a buffer for playback at its scheduled start
    fn submit(&mut self, buffer: ScheduledBuffer) -> Result<()>;
}

/// Something that can acquire an output device
pub trait SpeakerBackend: Send + Sync {
    fn open(&self) -> Result<Box<dyn AudioOutput>>;
}

/// Playback counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackStats {
    pub responses: u64,
    pub buffers_scheduled: u64,
    pub deltas_rejected: u64,
}

/// Schedules decoded response audio and tracks the `speaking` flag
#[derive(Debug)]
pub struct AudioPlaybackScheduler {
    sample_rate: u32,
    cursor: f64,
    speaking: bool,
    next_sequence: u64,
    stats: PlaybackStats,
}

impl AudioPlaybackScheduler {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            cursor: 0.0,
            speaking: false,
            next_sequence: 0,
            stats: PlaybackStats::default(),
        }
    }

    /// End of the last scheduled buffer
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn speaking(&self) -> bool {
        self.speaking
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }

    /// Place `samples` on the timeline given the current output clock
    pub fn schedule(&mut self, samples: Vec<f32>, now: f64) -> ScheduledBuffer {
        let start = now.max(self.cursor);
        let duration = samples.len() as f64 / self.sample_rate as f64;
        self.cursor = start + duration;

        let buffer = ScheduledBuffer {
            sequence: self.next_sequence,
            start,
            duration,
            samples,
        };
        self.next_sequence += 1;
        self.stats.buffers_scheduled += 1;
        trace!(
            "Scheduled buffer {} at {:.3}s for {:.3}s",
            buffer.sequence,
            buffer.start,
            buffer.duration
        );
        buffer
    }

    /// Decode a `response.audio.delta` payload and submit it to `output`.
    ///
    /// A malformed payload is rejected with `Encoding` and leaves the
    /// cursor untouched. Empty payloads schedule nothing.
    pub fn handle_delta(
        &mut self,
        delta: &str,
        output: &mut dyn AudioOutput,
    ) -> Result<Option<ScheduledBuffer>> {
        let samples = match decode_base64(delta) {
            Ok(samples) => samples,
            Err(e) => {
                self.stats.deltas_rejected += 1;
                return Err(e);
            }
        };
        if samples.is_empty() {
            return Ok(None);
        }

        let buffer = self.schedule(samples, output.now());
        output.submit(buffer.clone())?;
        Ok(Some(buffer))
    }

    /// `response.created`: returns true if the flag changed
    pub fn on_response_created(&mut self) -> bool {
        self.stats.responses += 1;
        let changed = !self.speaking;
        self.speaking = true;
        changed
    }

    /// `response.done`: returns true if the flag changed. Audio already
    /// scheduled keeps playing.
    pub fn on_response_done(&mut self) -> bool {
        let changed = self.speaking;
        self.speaking = false;
        if changed {
            debug!("Response done, audio queued until {:.3}s", self.cursor);
        }
        changed
    }
}
