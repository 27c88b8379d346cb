//! Relay between a client WebSocket and the upstream realtime service
//!
//! The relay never inspects payloads. It resolves the upstream credential,
//! dials upstream, and pumps frames until either side ends.

pub mod bridge;
pub mod frame;
pub mod registry;
pub mod upstream;

pub use bridge::{bridge, BridgeOutcome, RelayCounters};
pub use frame::{split_axum, split_tungstenite, BoxFrameSink, BoxFrameStream, CloseReason, Frame};
pub use registry::{RelayGuard, RelayRegistry, RelaySnapshot};
pub use upstream::{RealtimeConnector, UpstreamConnector};

use futures::{Sink, Stream};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::UpstreamConfig;
use crate::error::{AppError, Result};

/// Server-side relay: one `run` call per accepted client channel
pub struct RelayBridge {
    connector: Arc<dyn UpstreamConnector>,
    registry: RelayRegistry,
}

impl RelayBridge {
    pub fn new(connector: Arc<dyn UpstreamConnector>) -> Self {
        Self {
            connector,
            registry: RelayRegistry::new(),
        }
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }

    /// Bridge one accepted client channel to upstream.
    ///
    /// Returns once both channels are closed.
    pub async fn run<CT, CR>(
        &self,
        upstream: &UpstreamConfig,
        mut client_tx: CT,
        client_rx: CR,
    ) -> BridgeOutcome
    where
        CT: Sink<Frame, Error = AppError> + Unpin,
        CR: Stream<Item = Result<Frame>> + Unpin,
    {
        let Some(credential) = upstream.credential() else {
            warn!(
                "Upstream credential not configured (env {} unset, no stored key)",
                upstream.api_key_env
            );
            let outcome = BridgeOutcome::MissingCredential;
            bridge::close_sink(&mut client_tx, outcome.client_close()).await;
            return outcome;
        };

        let (upstream_tx, upstream_rx) = match self.connector.connect(upstream, &credential).await
        {
            Ok(halves) => halves,
            Err(e) => {
                error!("Upstream connect failed: {}", e);
                let outcome = BridgeOutcome::ConnectFailed(e.to_string());
                bridge::close_sink(&mut client_tx, outcome.client_close()).await;
                return outcome;
            }
        };

        let guard = self.registry.register();
        info!("Relay {} started", guard.id());

        let outcome = bridge(
            client_rx,
            client_tx,
            upstream_rx,
            upstream_tx,
            guard.counters(),
        )
        .await;

        let (up, down) = guard.counters().snapshot();
        info!(
            "Relay {} ended: {:?} ({} frames up, {} frames down)",
            guard.id(),
            outcome,
            up,
            down
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::channel::mpsc;
    use futures::{SinkExt, StreamExt};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::protocol::close_code;

    /// Connector handing out a pre-built in-memory upstream
    struct FakeConnector {
        attempts: AtomicUsize,
        fail: bool,
        upstream: Mutex<Option<(BoxFrameSink, BoxFrameStream)>>,
        seen_credential: Mutex<Option<String>>,
    }

    impl FakeConnector {
        fn new(fail: bool) -> (Arc<Self>, mpsc::UnboundedSender<Result<Frame>>, mpsc::UnboundedReceiver<Frame>) {
            let (peer_tx, rx) = mpsc::unbounded::<Result<Frame>>();
            let (tx, peer_rx) = mpsc::unbounded::<Frame>();
            let tx: BoxFrameSink =
                Box::pin(tx.sink_map_err(|e| AppError::Upstream(e.to_string())));
            let rx: BoxFrameStream = Box::pin(rx);
            let connector = Arc::new(Self {
                attempts: AtomicUsize::new(0),
                fail,
                upstream: Mutex::new(Some((tx, rx))),
                seen_credential: Mutex::new(None),
            });
            (connector, peer_tx, peer_rx)
        }
    }

    #[async_trait]
    impl UpstreamConnector for FakeConnector {
        async fn connect(
            &self,
            _config: &UpstreamConfig,
            credential: &str,
        ) -> Result<(BoxFrameSink, BoxFrameStream)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            *self.seen_credential.lock() = Some(credential.to_string());
            if self.fail {
                return Err(AppError::Upstream("connection refused".into()));
            }
            self.upstream
                .lock()
                .take()
                .ok_or_else(|| AppError::Upstream("already used".into()))
        }
    }

    fn client() -> (
        BoxFrameSink,
        BoxFrameStream,
        mpsc::UnboundedSender<Result<Frame>>,
        mpsc::UnboundedReceiver<Frame>,
    ) {
        let (peer_tx, rx) = mpsc::unbounded::<Result<Frame>>();
        let (tx, peer_rx) = mpsc::unbounded::<Frame>();
        (
            Box::pin(tx.sink_map_err(|e| AppError::Internal(e.to_string()))),
            Box::pin(rx),
            peer_tx,
            peer_rx,
        )
    }

    fn upstream_config(api_key: Option<&str>) -> UpstreamConfig {
        UpstreamConfig {
            api_key_env: "VOICE_COACH_TEST_UNSET_KEY".to_string(),
            api_key: api_key.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_missing_credential_closes_without_dialing() {
        let (connector, _up_tx, _up_rx) = FakeConnector::new(false);
        let relay = RelayBridge::new(connector.clone());
        let (tx, rx, _peer_tx, mut peer_rx) = client();

        let outcome = relay.run(&upstream_config(None), tx, rx).await;

        assert_eq!(outcome, BridgeOutcome::MissingCredential);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(
            peer_rx.next().await,
            Some(Frame::close(
                close_code::POLICY_VIOLATION,
                "Server configuration error"
            ))
        );
        assert_eq!(relay.registry().active_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_with_1011() {
        let (connector, _up_tx, _up_rx) = FakeConnector::new(true);
        let relay = RelayBridge::new(connector.clone());
        let (tx, rx, _peer_tx, mut peer_rx) = client();

        let outcome = relay.run(&upstream_config(Some("sk-test")), tx, rx).await;

        assert!(matches!(outcome, BridgeOutcome::ConnectFailed(_)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
        match peer_rx.next().await {
            Some(Frame::Close(Some(reason))) => {
                assert_eq!(reason.code, close_code::INTERNAL_ERROR)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relays_until_client_closes() {
        let (connector, up_peer_tx, mut up_peer_rx) = FakeConnector::new(false);
        let relay = Arc::new(RelayBridge::new(connector.clone()));
        let (tx, rx, mut client_peer_tx, mut client_peer_rx) = client();

        let task = {
            let relay = relay.clone();
            tokio::spawn(async move { relay.run(&upstream_config(Some("sk-test")), tx, rx).await })
        };

        client_peer_tx
            .send(Ok(Frame::Text(r#"{"type":"session.update"}"#.into())))
            .await
            .unwrap();
        assert_eq!(
            up_peer_rx.next().await,
            Some(Frame::Text(r#"{"type":"session.update"}"#.into()))
        );
        assert_eq!(relay.registry().active_count(), 1);

        up_peer_tx
            .unbounded_send(Ok(Frame::Text(r#"{"type":"response.done"}"#.into())))
            .unwrap();
        assert_eq!(
            client_peer_rx.next().await,
            Some(Frame::Text(r#"{"type":"response.done"}"#.into()))
        );

        client_peer_tx.send(Ok(Frame::Close(None))).await.unwrap();
        assert_eq!(task.await.unwrap(), BridgeOutcome::ClientClosed);
        assert_eq!(relay.registry().active_count(), 0);
        assert_eq!(connector.seen_credential.lock().as_deref(), Some("sk-test"));
    }
}
