//! One enable cycle's worth of tasks and devices
//!
//! A `Connection` owns the writer task (sole owner of the outbound sink),
//! the inbound router task (owner of the playback device), and the
//! microphone capture. Shutting it down closes the outbound gate first so
//! nothing is transmitted after `shutdown` returns.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::state::StatusCell;
use crate::audio::{
    AudioCapturer, AudioOutput, AudioPlaybackScheduler, CaptureState, FrameSink,
};
use crate::error::{AppError, Result};
use crate::events::{CoachEvent, EventBus};
use crate::protocol::{close_code, ControlMessage};
use crate::relay::bridge::CLOSE_TIMEOUT;
use crate::relay::{BoxFrameSink, BoxFrameStream, CloseReason, Frame};

/// Outbound frames buffered between producers and the writer
const OUTBOUND_CAPACITY: usize = 8;
/// How long a task may keep running after cancellation before it is aborted
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);
/// How long the relay has to answer a new session
pub(crate) const ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct Connection {
    pub(crate) epoch: u64,
    cancel: CancellationToken,
    gate: Arc<AtomicBool>,
    outbound: mpsc::Sender<Frame>,
    failures: mpsc::UnboundedSender<AppError>,
    inbound: Option<BoxFrameStream>,
    capturer: Option<AudioCapturer>,
    tasks: Vec<JoinHandle<()>>,
}

impl Connection {
    /// Start the writer over `sink`. Terminal failures from any task of
    /// this connection arrive on the returned receiver.
    pub(crate) fn new(
        epoch: u64,
        sink: BoxFrameSink,
        stream: BoxFrameStream,
    ) -> (Self, mpsc::UnboundedReceiver<AppError>) {
        let cancel = CancellationToken::new();
        let gate = Arc::new(AtomicBool::new(true));
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (failures, failures_rx) = mpsc::unbounded_channel();

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            gate.clone(),
            cancel.clone(),
            failures.clone(),
        ));

        let conn = Self {
            epoch,
            cancel,
            gate,
            outbound,
            failures,
            inbound: Some(stream),
            capturer: None,
            tasks: vec![writer],
        };
        (conn, failures_rx)
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Handle for queueing control messages without borrowing the connection
    pub(crate) fn control(&self) -> ControlSender {
        ControlSender {
            gate: self.gate.clone(),
            outbound: self.outbound.clone(),
        }
    }

    pub(crate) async fn send_control(&self, msg: &ControlMessage) -> Result<()> {
        self.control().send(msg).await
    }

    /// Wait for the relay's first frame.
    ///
    /// A relay without an upstream credential refuses the session with a
    /// policy close, which surfaces here as `AppError::Configuration`. Any
    /// other first frame is kept for the router.
    pub(crate) async fn await_accept(&mut self, limit: Duration) -> Result<()> {
        let mut stream = self
            .inbound
            .take()
            .ok_or_else(|| AppError::InvalidState("Router already started".to_string()))?;

        let first = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(AppError::InvalidState("Connection is closing".to_string()))
            }
            first = tokio::time::timeout(limit, stream.next()) => first,
        };

        match first {
            Err(_) => Err(AppError::Upstream(format!(
                "Relay did not answer within {}s",
                limit.as_secs()
            ))),
            Ok(Some(Ok(Frame::Close(reason)))) => Err(closed_by_peer(reason)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Err(AppError::Upstream("Relay connection ended".to_string())),
            Ok(Some(Ok(frame))) => {
                trace!("Relay accepted session with {} frame", frame.kind());
                self.inbound = Some(Box::pin(futures::stream::iter([Ok(frame)]).chain(stream)));
                Ok(())
            }
        }
    }

    /// Sink for captured frames, feeding the outbound queue without blocking
    pub(crate) fn audio_sink(&self, events: Arc<EventBus>) -> Arc<dyn FrameSink> {
        Arc::new(OutboundAudio {
            gate: self.gate.clone(),
            outbound: self.outbound.clone(),
            events,
        })
    }

    /// Take ownership of a running capture and watch it for device loss
    pub(crate) fn attach_capturer(&mut self, capturer: AudioCapturer) {
        let mut state = capturer.state_watch();
        let cancel = self.cancel.clone();
        let failures = self.failures.clone();

        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let current = state.borrow_and_update().clone();
                        if let CaptureState::Failed(reason) = current {
                            let _ = failures.send(AppError::Hardware(format!(
                                "Microphone lost: {}",
                                reason
                            )));
                            return;
                        }
                    }
                }
            }
        }));
        self.capturer = Some(capturer);
    }

    /// Start routing inbound messages to the scheduler and `output`
    pub(crate) fn start_router(
        &mut self,
        output: Box<dyn AudioOutput>,
        scheduler: AudioPlaybackScheduler,
        status: Arc<StatusCell>,
    ) -> Result<()> {
        let stream = self
            .inbound
            .take()
            .ok_or_else(|| AppError::InvalidState("Router already started".to_string()))?;
        self.tasks.push(tokio::spawn(read_loop(
            stream,
            scheduler,
            output,
            status,
            self.cancel.clone(),
            self.failures.clone(),
        )));
        Ok(())
    }

    /// Close the gate, cancel every task and release both devices.
    ///
    /// Queued frames are discarded. A task still busy after cancellation
    /// (a writer stuck on a stalled transport, say) is aborted.
    pub(crate) async fn shutdown(mut self) {
        self.gate.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(mut capturer) = self.capturer.take() {
            capturer.stop().await;
        }
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(CLOSE_TIMEOUT + JOIN_TIMEOUT, &mut task)
                .await
                .is_err()
            {
                warn!("Connection {} task did not stop, aborting", self.epoch);
                task.abort();
            }
        }
        debug!("Connection {} shut down", self.epoch);
    }
}

/// Queues control messages for one connection's writer
#[derive(Clone)]
pub(crate) struct ControlSender {
    gate: Arc<AtomicBool>,
    outbound: mpsc::Sender<Frame>,
}

impl ControlSender {
    /// Queue `msg` behind anything already queued
    pub(crate) async fn send(&self, msg: &ControlMessage) -> Result<()> {
        if !self.gate.load(Ordering::SeqCst) {
            return Err(AppError::InvalidState("Connection is closing".to_string()));
        }
        let text = msg.to_text()?;
        debug!("Sending {}", msg.type_name());
        self.outbound
            .send(Frame::Text(text))
            .await
            .map_err(|_| AppError::Upstream("Outbound channel closed".to_string()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.gate.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

struct OutboundAudio {
    gate: Arc<AtomicBool>,
    outbound: mpsc::Sender<Frame>,
    events: Arc<EventBus>,
}

impl OutboundAudio {
    fn drop_frame(&self, reason: &str) {
        debug!("Dropping captured frame: {}", reason);
        self.events.publish(CoachEvent::FrameDropped {
            reason: reason.to_string(),
        });
    }
}

impl FrameSink for OutboundAudio {
    fn on_frame(&self, pcm16: Vec<u8>) {
        if !self.gate.load(Ordering::SeqCst) {
            self.drop_frame("outbound closed");
            return;
        }

        let text = match ControlMessage::audio_append(STANDARD.encode(&pcm16)).to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize audio frame: {}", e);
                return;
            }
        };

        match self.outbound.try_send(Frame::Text(text)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.drop_frame("outbound full"),
            Err(TrySendError::Closed(_)) => self.drop_frame("outbound closed"),
        }
    }
}

async fn write_loop(
    mut sink: BoxFrameSink,
    mut rx: mpsc::Receiver<Frame>,
    gate: Arc<AtomicBool>,
    cancel: CancellationToken,
    failures: mpsc::UnboundedSender<AppError>,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if !gate.load(Ordering::SeqCst) {
                    break;
                }
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = sink.send(frame) => sent,
                };
                if let Err(e) = sent {
                    let _ = failures.send(e);
                    return;
                }
            }
        }
    }

    // Pending frames are discarded, not drained. The close is best effort.
    let close = async {
        let _ = sink.send(Frame::Close(Some(CloseReason::normal()))).await;
        let _ = sink.close().await;
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        debug!("Timed out closing relay channel");
    }
}

async fn read_loop(
    mut stream: BoxFrameStream,
    mut scheduler: AudioPlaybackScheduler,
    mut output: Box<dyn AudioOutput>,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
    failures: mpsc::UnboundedSender<AppError>,
) {
    let failure = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(Frame::Text(text))) => {
                if let Err(e) = route_message(&text, &mut scheduler, output.as_mut(), &status) {
                    break e;
                }
            }
            Some(Ok(Frame::Close(reason))) => break closed_by_peer(reason),
            Some(Ok(frame)) => trace!("Ignoring {} frame", frame.kind()),
            Some(Err(e)) => break e,
            None => break AppError::Upstream("Relay connection ended".to_string()),
        }
    };

    let _ = failures.send(failure);
}

fn closed_by_peer(reason: Option<CloseReason>) -> AppError {
    match reason {
        Some(r) if r.code == close_code::POLICY_VIOLATION => AppError::Configuration(r.reason),
        Some(r) => AppError::Upstream(format!(
            "Relay closed the connection ({} {})",
            r.code, r.reason
        )),
        None => AppError::Upstream("Relay closed the connection".to_string()),
    }
}

/// Dispatch one inbound text frame. Only terminal failures are returned.
pub(crate) fn route_message(
    text: &str,
    scheduler: &mut AudioPlaybackScheduler,
    output: &mut dyn AudioOutput,
    status: &StatusCell,
) -> Result<()> {
    let msg = match ControlMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Skipping malformed message: {}", e);
            return Ok(());
        }
    };

    match msg {
        ControlMessage::ResponseCreated => {
            if scheduler.on_response_created() {
                status.set_speaking(true);
            }
        }
        ControlMessage::ResponseAudioDelta { delta } => {
            match scheduler.handle_delta(&delta, output) {
                Ok(_) => {}
                Err(e) if !e.is_terminal() => warn!("Skipping audio delta: {}", e),
                Err(e) => return Err(e),
            }
        }
        ControlMessage::ResponseDone => {
            if scheduler.on_response_done() {
                status.set_speaking(false);
            }
        }
        ControlMessage::ServiceError { error } => {
            warn!(
                "Upstream reported error ({}): {}",
                error.code.as_deref().unwrap_or("unknown"),
                error.message
            );
        }
        other => trace!("Ignoring {}", other.type_name()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::encode_base64;
    use crate::audio::playback::tests::ManualOutput;

    fn status() -> (StatusCell, tokio::sync::broadcast::Receiver<CoachEvent>) {
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        (StatusCell::new(events), rx)
    }

    #[test]
    fn test_router_handles_response_lifecycle() {
        let (status, mut events) = status();
        let mut scheduler = AudioPlaybackScheduler::new(24000);
        let mut output = ManualOutput::default();

        route_message(
            r#"{"type":"response.created","response":{}}"#,
            &mut scheduler,
            &mut output,
            &status,
        )
        .unwrap();
        assert!(status.speaking());

        let delta = format!(
            r#"{{"type":"response.audio.delta","delta":"{}"}}"#,
            encode_base64(&[0.1; 240])
        );
        route_message(&delta, &mut scheduler, &mut output, &status).unwrap();
        route_message(
            r#"{"type":"response.audio.delta","delta":"AQI"}"#,
            &mut scheduler,
            &mut output,
            &status,
        )
        .unwrap();
        route_message(&delta, &mut scheduler, &mut output, &status).unwrap();

        route_message(r#"{"type":"response.done"}"#, &mut scheduler, &mut output, &status)
            .unwrap();
        assert!(!status.speaking());

        let submitted = output.submitted.lock();
        assert_eq!(submitted.len(), 2);
        assert!((submitted[1].start - submitted[0].end()).abs() < 1e-9);

        assert_eq!(
            events.try_recv().unwrap(),
            CoachEvent::SpeakingChanged { speaking: true }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            CoachEvent::SpeakingChanged { speaking: false }
        );
    }

    #[test]
    fn test_router_skips_noise() {
        let (status, _events) = status();
        let mut scheduler = AudioPlaybackScheduler::new(24000);
        let mut output = ManualOutput::default();

        for text in [
            "not json",
            r#"{"type":"session.created","session":{}}"#,
            r#"{"type":"error","error":{"message":"rate limited"}}"#,
            r#"{"type":"response.audio.delta"}"#,
        ] {
            assert!(route_message(text, &mut scheduler, &mut output, &status).is_ok());
        }
        assert!(!status.speaking());
        assert!(output.submitted.lock().is_empty());
    }

    #[test]
    fn test_policy_close_maps_to_configuration() {
        let err = closed_by_peer(Some(CloseReason::new(
            close_code::POLICY_VIOLATION,
            "Server configuration error",
        )));
        assert!(matches!(err, AppError::Configuration(_)));

        let err = closed_by_peer(Some(CloseReason::new(close_code::INTERNAL_ERROR, "x")));
        assert!(matches!(err, AppError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_audio_sink_drops_when_gate_closed() {
        let events = Arc::new(EventBus::new());
        let mut dropped = events.subscribe();
        let gate = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::channel(1);
        let sink = OutboundAudio {
            gate: gate.clone(),
            outbound: tx,
            events,
        };

        sink.on_frame(vec![0, 0]);
        sink.on_frame(vec![0, 0]);
        gate.store(false, Ordering::SeqCst);
        sink.on_frame(vec![0, 0]);

        match rx.recv().await {
            Some(Frame::Text(text)) => {
                assert!(text.contains("input_audio_buffer.append"));
                assert!(text.contains("\"audio\":\"AAA=\""));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(
            dropped.try_recv().unwrap(),
            CoachEvent::FrameDropped {
                reason: "outbound full".to_string()
            }
        );
        assert_eq!(
            dropped.try_recv().unwrap(),
            CoachEvent::FrameDropped {
                reason: "outbound closed".to_string()
            }
        );
    }
}
