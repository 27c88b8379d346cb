//! Client-side voice coaching pipeline
//!
//! `VoiceCoach` wires microphone capture, the relay channel and playback
//! together, one [`Connection`] per enable cycle. There is no retry: a
//! terminal failure tears the connection down, publishes
//! [`CoachEvent::Error`] once, and leaves re-enabling to the caller.

mod connection;
pub mod context;
pub mod state;
pub mod transport;

pub use context::{ActiveCard, SessionContextManager};
pub use state::{ConnectionState, StatusCell};
pub use transport::{Connector, WsConnector};

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::audio::{
    AudioCapturer, AudioPlaybackScheduler, CaptureSettings, MicrophoneBackend, SpeakerBackend,
};
use crate::config::{AudioConfig, CoachConfig, SAMPLE_RATE};
use crate::error::{AppError, Result};
use crate::events::{CoachEvent, EventBus};
use connection::Connection;

/// Handle to the client pipeline. Cheap to clone.
#[derive(Clone)]
pub struct VoiceCoach {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    microphone: Arc<dyn MicrophoneBackend>,
    speaker: Arc<dyn SpeakerBackend>,
    capture: CaptureSettings,
    events: Arc<EventBus>,
    status: Arc<StatusCell>,
    context: Mutex<SessionContextManager>,
    slot: tokio::sync::Mutex<Option<Connection>>,
    epoch: AtomicU64,
    accept_timeout: Duration,
}

impl VoiceCoach {
    pub fn new(
        connector: Arc<dyn Connector>,
        microphone: Arc<dyn MicrophoneBackend>,
        speaker: Arc<dyn SpeakerBackend>,
        coach: CoachConfig,
        audio: &AudioConfig,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        Self {
            inner: Arc::new(Inner {
                connector,
                microphone,
                speaker,
                capture: CaptureSettings {
                    frame_samples: audio.frame_samples as usize,
                    read_chunk: audio.period_frames as usize,
                },
                status: Arc::new(StatusCell::new(events.clone())),
                events,
                context: Mutex::new(SessionContextManager::new(coach)),
                slot: tokio::sync::Mutex::new(None),
                epoch: AtomicU64::new(0),
                accept_timeout: connection::ACCEPT_TIMEOUT,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoachEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.state()
    }

    pub fn speaking(&self) -> bool {
        self.inner.status.speaking()
    }

    pub fn active_card(&self) -> Option<ActiveCard> {
        self.inner.context.lock().card().cloned()
    }

    /// Connect, configure the session and start streaming.
    ///
    /// The microphone is only opened once the relay has answered the
    /// session, so a relay refusing for lack of an upstream credential fails
    /// here with `AppError::Configuration`. On failure everything acquired so far is released and the state is
    /// back to `Disconnected` before the error is returned.
    pub async fn enable(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        if slot.is_some() {
            return Err(AppError::InvalidState(
                "Voice coach is already enabled".to_string(),
            ));
        }

        self.inner.status.advance(ConnectionState::Connecting)?;
        match self.inner.open().await {
            Ok(conn) => {
                *slot = Some(conn);
                info!("Voice coach enabled");
                Ok(())
            }
            Err(e) => {
                error!("Failed to enable voice coach: {}", e);
                self.inner.status.reset();
                Err(e)
            }
        }
    }

    /// Tear down the active connection. No-op when not enabled.
    pub async fn disable(&self) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        let Some(conn) = slot.take() else {
            return Ok(());
        };

        self.inner.status.advance(ConnectionState::Disconnecting)?;
        conn.shutdown().await;
        self.inner.status.set_speaking(false);
        self.inner.status.advance(ConnectionState::Disconnected)?;
        info!("Voice coach disabled");
        Ok(())
    }

    /// Make `card` the active card. Returns whether a context message was
    /// sent, which happens only while connected.
    pub async fn set_card(&self, card: ActiveCard) -> Result<bool> {
        let control = {
            let slot = self.inner.slot.lock().await;
            let connected =
                slot.is_some() && self.inner.status.state() == ConnectionState::Connected;
            let inject = self.inner.context.lock().set_card(card, connected);
            match (inject, slot.as_ref()) {
                (Some(msg), Some(conn)) => Some((msg, conn.control())),
                _ => None,
            }
        };

        // Sent outside the slot lock so a stalled writer cannot block disable
        match control {
            Some((msg, control)) => {
                control.send(&msg).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Replace the coach configuration used by the next `session.update`
    pub fn set_coach_config(&self, config: CoachConfig) {
        self.inner.context.lock().set_config(config);
    }
}

impl Inner {
    async fn open(self: &Arc<Self>) -> Result<Connection> {
        let (sink, stream) = self.connector.connect().await?;
        self.status.advance(ConnectionState::Connected)?;

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (mut conn, failures) = Connection::new(epoch, sink, stream);

        if let Err(e) = self.start_pipeline(&mut conn).await {
            conn.shutdown().await;
            return Err(e);
        }

        self.supervise(epoch, conn.cancel_token(), failures);
        Ok(conn)
    }

    async fn start_pipeline(&self, conn: &mut Connection) -> Result<()> {
        let (session_update, initial_context) = {
            let context = self.context.lock();
            (context.session_update(), context.current_context())
        };
        conn.send_control(&session_update).await?;
        conn.await_accept(self.accept_timeout).await?;

        let capturer = AudioCapturer::start(
            self.microphone.clone(),
            self.capture,
            conn.audio_sink(self.events.clone()),
        )
        .await?;
        conn.attach_capturer(capturer);

        let speaker = self.speaker.clone();
        let output = tokio::task::spawn_blocking(move || speaker.open())
            .await
            .map_err(|e| AppError::Internal(format!("Speaker open task failed: {}", e)))??;
        conn.start_router(
            output,
            AudioPlaybackScheduler::new(SAMPLE_RATE),
            self.status.clone(),
        )?;

        if let Some(msg) = initial_context {
            conn.send_control(&msg).await?;
        }
        Ok(())
    }

    fn supervise(
        self: &Arc<Self>,
        epoch: u64,
        cancel: CancellationToken,
        mut failures: mpsc::UnboundedReceiver<AppError>,
    ) {
        let inner: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            let failure = tokio::select! {
                _ = cancel.cancelled() => return,
                failure = failures.recv() => match failure {
                    Some(failure) => failure,
                    None => return,
                },
            };
            if let Some(inner) = inner.upgrade() {
                inner.terminate(epoch, failure).await;
            }
        });
    }

    async fn terminate(&self, epoch: u64, failure: AppError) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().map(|c| c.epoch) != Some(epoch) {
            return;
        }
        let Some(conn) = slot.take() else {
            return;
        };

        error!("Voice coach connection failed: {}", failure);
        self.events.publish(CoachEvent::Error {
            message: failure.to_string(),
        });

        let _ = self.status.advance(ConnectionState::Disconnecting);
        conn.shutdown().await;
        self.status.set_speaking(false);
        let _ = self.status.advance(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::encode_base64;
    use crate::audio::playback::tests::ManualOutput;
    use crate::audio::{AudioOutput, SampleSource, ScheduledBuffer};
    use crate::protocol::ControlMessage;
    use crate::relay::{BoxFrameSink, BoxFrameStream, Frame};
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use futures::{SinkExt, StreamExt};
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::task::{Context, Poll};

    const WAIT: Duration = Duration::from_secs(2);

    /// Relay end of an in-memory channel
    struct Peer {
        to_client: fmpsc::UnboundedSender<Result<Frame>>,
        from_client: fmpsc::UnboundedReceiver<Frame>,
    }

    impl Peer {
        async fn next_message(&mut self) -> Option<ControlMessage> {
            loop {
                match tokio::time::timeout(WAIT, self.from_client.next()).await.ok()?? {
                    Frame::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
                    _ => continue,
                }
            }
        }

        /// Next message that is not captured audio
        async fn next_control(&mut self) -> Option<ControlMessage> {
            loop {
                match self.next_message().await? {
                    ControlMessage::AudioAppend { .. } => continue,
                    other => return Some(other),
                }
            }
        }

        fn send(&self, text: &str) {
            self.to_client
                .unbounded_send(Ok(Frame::Text(text.to_string())))
                .unwrap();
        }
    }

    const SESSION_CREATED: &str = r#"{"type":"session.created","session":{}}"#;

    struct MemoryConnector {
        peers: Mutex<Vec<Peer>>,
        attempts: AtomicUsize,
        /// First frame the relay sends on every connection
        greeting: Frame,
    }

    impl MemoryConnector {
        fn new() -> Arc<Self> {
            Self::with_greeting(Frame::Text(SESSION_CREATED.to_string()))
        }

        fn with_greeting(greeting: Frame) -> Arc<Self> {
            Arc::new(Self {
                peers: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                greeting,
            })
        }

        fn take_peer(&self) -> Peer {
            self.peers.lock().remove(0)
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<(BoxFrameSink, BoxFrameStream)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let (to_client, rx) = fmpsc::unbounded::<Result<Frame>>();
            let (tx, from_client) = fmpsc::unbounded::<Frame>();
            to_client.unbounded_send(Ok(self.greeting.clone())).unwrap();
            self.peers.lock().push(Peer {
                to_client,
                from_client,
            });
            Ok((
                Box::pin(tx.sink_map_err(|e| AppError::Upstream(e.to_string()))),
                Box::pin(rx),
            ))
        }
    }

    /// Transport whose outbound side never accepts a frame
    struct StalledSink;

    impl futures::Sink<Frame> for StalledSink {
        type Error = AppError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }

        fn start_send(self: Pin<&mut Self>, _item: Frame) -> Result<()> {
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
            Poll::Pending
        }
    }

    /// Relay that greets the session but never reads what the client sends
    #[derive(Default)]
    struct StalledConnector {
        keep_open: Mutex<Vec<fmpsc::UnboundedSender<Result<Frame>>>>,
    }

    #[async_trait]
    impl Connector for StalledConnector {
        async fn connect(&self) -> Result<(BoxFrameSink, BoxFrameStream)> {
            let (to_client, rx) = fmpsc::unbounded::<Result<Frame>>();
            to_client
                .unbounded_send(Ok(Frame::Text(SESSION_CREATED.to_string())))
                .unwrap();
            self.keep_open.lock().push(to_client);
            Ok((Box::pin(StalledSink), Box::pin(rx)))
        }
    }

    /// Endless tone; each read blocks briefly like a device period
    struct ToneSource {
        released: Arc<AtomicBool>,
    }

    impl SampleSource for ToneSource {
        fn read(&mut self, buf: &mut [f32]) -> Result<usize> {
            std::thread::sleep(Duration::from_millis(2));
            let n = buf.len().min(64);
            buf[..n].fill(0.25);
            Ok(n)
        }
    }

    impl Drop for ToneSource {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeMic {
        fail: bool,
        opened: AtomicUsize,
        released: Arc<AtomicBool>,
    }

    impl MicrophoneBackend for FakeMic {
        fn open(&self) -> Result<Box<dyn SampleSource>> {
            if self.fail {
                return Err(AppError::Hardware("microphone access denied".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            self.released.store(false, Ordering::SeqCst);
            Ok(Box::new(ToneSource {
                released: self.released.clone(),
            }))
        }
    }

    struct FakeSpeakerOutput {
        inner: ManualOutput,
        released: Arc<AtomicBool>,
    }

    impl AudioOutput for FakeSpeakerOutput {
        fn now(&self) -> f64 {
            self.inner.now()
        }

        fn submit(&mut self, buffer: ScheduledBuffer) -> Result<()> {
            self.inner.submit(buffer)
        }
    }

    impl Drop for FakeSpeakerOutput {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeSpeaker {
        output: ManualOutput,
        released: Arc<AtomicBool>,
    }

    impl SpeakerBackend for FakeSpeaker {
        fn open(&self) -> Result<Box<dyn AudioOutput>> {
            self.released.store(false, Ordering::SeqCst);
            Ok(Box::new(FakeSpeakerOutput {
                inner: self.output.clone(),
                released: self.released.clone(),
            }))
        }
    }

    struct Harness {
        coach: VoiceCoach,
        connector: Arc<MemoryConnector>,
        mic: Arc<FakeMic>,
        speaker: Arc<FakeSpeaker>,
    }

    fn harness(mic: FakeMic) -> Harness {
        harness_with(MemoryConnector::new(), mic)
    }

    fn harness_with(connector: Arc<MemoryConnector>, mic: FakeMic) -> Harness {
        let mic = Arc::new(mic);
        let speaker = Arc::new(FakeSpeaker::default());
        let coach = VoiceCoach::new(
            connector.clone(),
            mic.clone(),
            speaker.clone(),
            CoachConfig::default(),
            &test_audio(),
        );
        Harness {
            coach,
            connector,
            mic,
            speaker,
        }
    }

    fn test_audio() -> AudioConfig {
        AudioConfig {
            frame_samples: 128,
            period_frames: 64,
            ..Default::default()
        }
    }

    fn card(title: &str) -> ActiveCard {
        ActiveCard::new(title, format!("{} description", title), "Arrays")
    }

    async fn wait_for_state(coach: &VoiceCoach, state: ConnectionState) {
        tokio::time::timeout(WAIT, async {
            while coach.state() != state {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_enable_sends_session_update_first() {
        let h = harness(FakeMic::default());
        let mut events = h.coach.subscribe();
        h.coach.set_card(card("Two Sum")).await.unwrap();

        h.coach.enable().await.unwrap();
        assert_eq!(h.coach.state(), ConnectionState::Connected);

        let mut peer = h.connector.take_peer();
        match peer.next_message().await {
            Some(ControlMessage::SessionUpdate { session }) => {
                assert_eq!(session.voice, "alloy")
            }
            other => panic!("first message was {:?}", other),
        }
        match peer.next_control().await {
            Some(ControlMessage::ContextInject { item }) => assert!(item.text().contains("Two Sum")),
            other => panic!("unexpected {:?}", other),
        }
        // Captured audio follows
        let audio = loop {
            match peer.next_message().await {
                Some(ControlMessage::AudioAppend { audio }) => break audio,
                Some(_) => continue,
                None => panic!("no captured audio arrived"),
            }
        };
        assert_eq!(audio.len(), encode_base64(&[0.0; 128]).len());

        assert_eq!(
            events.recv().await.unwrap(),
            CoachEvent::StateChanged {
                state: ConnectionState::Connecting
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            CoachEvent::StateChanged {
                state: ConnectionState::Connected
            }
        );

        assert!(matches!(
            h.coach.enable().await,
            Err(AppError::InvalidState(_))
        ));
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 1);

        h.coach.disable().await.unwrap();
    }

    #[tokio::test]
    async fn test_microphone_failure_aborts_enable() {
        let h = harness(FakeMic {
            fail: true,
            ..Default::default()
        });

        let result = h.coach.enable().await;
        assert!(matches!(result, Err(AppError::Hardware(_))));
        assert_eq!(h.coach.state(), ConnectionState::Disconnected);

        // The channel opened for this attempt is closed again
        let mut peer = h.connector.take_peer();
        let mut saw_close = false;
        while let Ok(Some(frame)) = tokio::time::timeout(WAIT, peer.from_client.next()).await {
            saw_close |= matches!(frame, Frame::Close(_));
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_card_change_injects_once_only_when_connected() {
        let h = harness(FakeMic::default());

        assert!(!h.coach.set_card(card("A")).await.unwrap());

        h.coach.enable().await.unwrap();
        let mut peer = h.connector.take_peer();
        assert!(matches!(
            peer.next_control().await,
            Some(ControlMessage::SessionUpdate { .. })
        ));
        match peer.next_control().await {
            Some(ControlMessage::ContextInject { item }) => {
                assert!(item.text().contains("\"A\""))
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(h.coach.set_card(card("B")).await.unwrap());
        match peer.next_control().await {
            Some(ControlMessage::ContextInject { item }) => {
                assert!(item.text().contains("\"B\""))
            }
            other => panic!("unexpected {:?}", other),
        }
        h.coach.disable().await.unwrap();

        // Exactly one inject per change
        while let Some(msg) = peer.next_control().await {
            assert!(
                !matches!(msg, ControlMessage::ContextInject { .. }),
                "unexpected inject {:?}",
                msg
            );
        }

        assert!(!h.coach.set_card(card("C")).await.unwrap());
        assert_eq!(h.coach.active_card().unwrap().title, "C");
    }

    #[tokio::test]
    async fn test_nothing_sent_after_disable_returns() {
        let h = harness(FakeMic::default());
        h.coach.enable().await.unwrap();
        let mut peer = h.connector.take_peer();

        // Session is up
        assert!(matches!(
            peer.next_message().await,
            Some(ControlMessage::SessionUpdate { .. })
        ));
        h.coach.disable().await.unwrap();
        assert_eq!(h.coach.state(), ConnectionState::Disconnected);
        assert!(h.mic.released.load(Ordering::SeqCst));
        assert!(h.speaker.released.load(Ordering::SeqCst));

        let mut frames = Vec::new();
        while let Some(frame) = peer.from_client.next().await {
            frames.push(frame);
        }
        // Writer is gone and closed the channel last
        assert!(matches!(frames.last(), Some(Frame::Close(_))));
        let close_at = frames.iter().position(|f| matches!(f, Frame::Close(_)));
        assert_eq!(close_at, Some(frames.len() - 1));
    }

    #[tokio::test]
    async fn test_inbound_audio_and_speaking() {
        let h = harness(FakeMic::default());
        h.coach.enable().await.unwrap();
        let peer = h.connector.take_peer();
        *h.speaker.output.clock.lock() = 3.0;

        peer.send(r#"{"type":"response.created"}"#);
        let delta = encode_base64(&[0.5; 2400]);
        peer.send(&format!(r#"{{"type":"response.audio.delta","delta":"{}"}}"#, delta));
        peer.send(r#"{"type":"response.audio.delta","delta":"@@@"}"#);
        peer.send(&format!(r#"{{"type":"response.audio.delta","delta":"{}"}}"#, delta));

        tokio::time::timeout(WAIT, async {
            while h.speaker.output.submitted.lock().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(h.coach.speaking());

        {
            let submitted = h.speaker.output.submitted.lock();
            assert!(submitted[0].start >= 3.0);
            assert!((submitted[1].start - submitted[0].end()).abs() < 1e-9);
        }

        peer.send(r#"{"type":"response.done"}"#);
        tokio::time::timeout(WAIT, async {
            while h.coach.speaking() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(h.coach.state(), ConnectionState::Connected);

        h.coach.disable().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_close_is_terminal() {
        let h = harness(FakeMic::default());
        let mut events = h.coach.subscribe();
        h.coach.enable().await.unwrap();
        let peer = h.connector.take_peer();

        peer.to_client
            .unbounded_send(Ok(Frame::close(1011, "Upstream connection error")))
            .unwrap();

        wait_for_state(&h.coach, ConnectionState::Disconnected).await;
        assert!(h.mic.released.load(Ordering::SeqCst));
        assert!(h.speaker.released.load(Ordering::SeqCst));

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if let CoachEvent::Error { message } = event {
                assert!(message.contains("1011"));
                errors += 1;
            }
        }
        assert_eq!(errors, 1);

        // A fresh enable cycle works
        h.coach.enable().await.unwrap();
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.mic.opened.load(Ordering::SeqCst), 2);
        h.coach.disable().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_refusal_fails_enable_with_configuration_error() {
        let h = harness_with(
            MemoryConnector::with_greeting(Frame::close(1008, "Server configuration error")),
            FakeMic::default(),
        );

        let result = h.coach.enable().await;
        assert!(matches!(result, Err(AppError::Configuration(_))));
        assert_eq!(h.coach.state(), ConnectionState::Disconnected);
        assert_eq!(h.mic.opened.load(Ordering::SeqCst), 0);

        // Nothing is left running to report the refusal a second time
        assert!(matches!(
            h.coach.enable().await,
            Err(AppError::Configuration(_))
        ));
        assert_eq!(h.connector.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_disable_returns_on_stalled_transport() {
        let mic = Arc::new(FakeMic::default());
        let speaker = Arc::new(FakeSpeaker::default());
        let coach = VoiceCoach::new(
            Arc::new(StalledConnector::default()),
            mic.clone(),
            speaker.clone(),
            CoachConfig::default(),
            &test_audio(),
        );

        coach.enable().await.unwrap();

        // Blocks on the full outbound queue without holding up disable
        let pending = {
            let coach = coach.clone();
            tokio::spawn(async move {
                for title in ["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"] {
                    if coach.set_card(card(title)).await.is_err() {
                        break;
                    }
                }
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(5), coach.disable())
            .await
            .expect("disable must not wait on a stalled transport")
            .unwrap();
        assert_eq!(coach.state(), ConnectionState::Disconnected);
        assert!(mic.released.load(Ordering::SeqCst));
        assert!(speaker.released.load(Ordering::SeqCst));

        tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    }
}
