//! Bidirectional frame pump between the client and upstream channels
//!
//! Frames are forwarded opaquely in both directions until either side
//! closes or fails. The first side to end decides the outcome; the other
//! pump is dropped and both channels are closed afterwards.

use futures::{Sink, SinkExt, Stream, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use super::frame::{CloseReason, Frame};
use crate::error::{AppError, Result};
use crate::protocol::close_code;

/// Upper bound on delivering a close frame to a peer that stopped reading
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Reason text sent to the client when the upstream side fails
pub const UPSTREAM_ERROR_REASON: &str = "Upstream connection error";
/// Reason text sent to the client when no upstream credential is configured
pub const CONFIGURATION_ERROR_REASON: &str = "Server configuration error";
/// Reason text sent to the client when upstream closes without a usable code
pub const UPSTREAM_CLOSED_REASON: &str = "Upstream connection closed";

/// Frame counters for one relay, updated as frames are forwarded
#[derive(Debug, Default)]
pub struct RelayCounters {
    pub client_to_upstream: AtomicU64,
    pub upstream_to_client: AtomicU64,
}

impl RelayCounters {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.client_to_upstream.load(Ordering::Relaxed),
            self.upstream_to_client.load(Ordering::Relaxed),
        )
    }
}

/// How a bridged session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeOutcome {
    /// Client closed its channel; upstream was closed normally
    ClientClosed,
    /// Client channel failed; upstream was closed normally
    ClientFailed(String),
    /// Upstream closed; the client got the carried code (or 1000)
    UpstreamClosed(CloseReason),
    /// Upstream failed; the client got 1011
    UpstreamFailed(String),
    /// No upstream credential; the client got 1008 and upstream was never dialed
    MissingCredential,
    /// Upstream could not be reached; the client got 1011
    ConnectFailed(String),
}

impl BridgeOutcome {
    /// Relay-side failure behind this outcome, if any
    pub fn failure(&self) -> Option<AppError> {
        match self {
            BridgeOutcome::UpstreamFailed(e) | BridgeOutcome::ConnectFailed(e) => {
                Some(AppError::Upstream(e.clone()))
            }
            BridgeOutcome::MissingCredential => Some(AppError::Configuration(
                "Upstream credential not configured".to_string(),
            )),
            _ => None,
        }
    }

    /// Close frame the client receives for this outcome, if any
    pub fn client_close(&self) -> Option<CloseReason> {
        match self {
            BridgeOutcome::ClientClosed | BridgeOutcome::ClientFailed(_) => None,
            BridgeOutcome::UpstreamClosed(reason) => Some(reason.clone()),
            _ => self.failure().map(|e| {
                let reason = match e {
                    AppError::Configuration(_) => CONFIGURATION_ERROR_REASON,
                    _ => UPSTREAM_ERROR_REASON,
                };
                CloseReason::new(e.close_code(), reason)
            }),
        }
    }
}

enum PumpEnd {
    SourceClosed(Option<CloseReason>),
    SourceFailed(String),
    SinkFailed(String),
}

enum Ended {
    Client(PumpEnd),
    Upstream(PumpEnd),
}

async fn pump<R, T>(rx: &mut R, tx: &mut T, counter: &AtomicU64) -> PumpEnd
where
    R: Stream<Item = Result<Frame>> + Unpin,
    T: Sink<Frame, Error = AppError> + Unpin,
{
    loop {
        match rx.next().await {
            Some(Ok(Frame::Close(reason))) => return PumpEnd::SourceClosed(reason),
            Some(Ok(frame)) => {
                trace!("Forwarding {} frame ({} bytes)", frame.kind(), frame.len());
                if let Err(e) = tx.send(frame).await {
                    return PumpEnd::SinkFailed(e.to_string());
                }
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(e)) => return PumpEnd::SourceFailed(e.to_string()),
            None => return PumpEnd::SourceClosed(None),
        }
    }
}

/// Send a close frame and shut the sink. Failures are ignored since the
/// peer may already be gone, and a peer that stops reading is abandoned
/// after [`CLOSE_TIMEOUT`].
pub(crate) async fn close_sink<T>(tx: &mut T, reason: Option<CloseReason>)
where
    T: Sink<Frame, Error = AppError> + Unpin,
{
    let close = async {
        if let Err(e) = tx.send(Frame::Close(reason)).await {
            trace!("Close frame not delivered: {}", e);
        }
        let _ = tx.close().await;
    };
    if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
        debug!("Timed out closing channel");
    }
}

fn mirror_upstream_close(reason: Option<CloseReason>) -> CloseReason {
    match reason {
        Some(reason) if close_code::is_sendable(reason.code) => reason,
        _ => CloseReason::new(close_code::NORMAL, UPSTREAM_CLOSED_REASON),
    }
}

/// Run the bridge until one side ends. Returns how the session ended.
pub async fn bridge<CR, CT, UR, UT>(
    mut client_rx: CR,
    mut client_tx: CT,
    mut upstream_rx: UR,
    mut upstream_tx: UT,
    counters: &RelayCounters,
) -> BridgeOutcome
where
    CR: Stream<Item = Result<Frame>> + Unpin,
    CT: Sink<Frame, Error = AppError> + Unpin,
    UR: Stream<Item = Result<Frame>> + Unpin,
    UT: Sink<Frame, Error = AppError> + Unpin,
{
    let ended = tokio::select! {
        end = pump(&mut client_rx, &mut upstream_tx, &counters.client_to_upstream) => Ended::Client(end),
        end = pump(&mut upstream_rx, &mut client_tx, &counters.upstream_to_client) => Ended::Upstream(end),
    };

    let outcome = match ended {
        Ended::Client(PumpEnd::SourceClosed(_)) => BridgeOutcome::ClientClosed,
        Ended::Client(PumpEnd::SourceFailed(e)) => BridgeOutcome::ClientFailed(e),
        Ended::Client(PumpEnd::SinkFailed(e)) => BridgeOutcome::UpstreamFailed(e),
        Ended::Upstream(PumpEnd::SourceClosed(reason)) => {
            BridgeOutcome::UpstreamClosed(mirror_upstream_close(reason))
        }
        Ended::Upstream(PumpEnd::SourceFailed(e)) => BridgeOutcome::UpstreamFailed(e),
        Ended::Upstream(PumpEnd::SinkFailed(e)) => BridgeOutcome::ClientFailed(e),
    };

    debug!("Bridge ended: {:?}", outcome);

    match &outcome {
        BridgeOutcome::ClientClosed | BridgeOutcome::ClientFailed(_) => {
            close_sink(&mut upstream_tx, Some(CloseReason::normal())).await;
            close_sink(&mut client_tx, None).await;
        }
        _ => {
            close_sink(&mut client_tx, outcome.client_close()).await;
            close_sink(&mut upstream_tx, None).await;
        }
    }

    outcome
}
