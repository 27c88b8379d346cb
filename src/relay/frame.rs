//! Transport-neutral WebSocket frame
//!
//! Both the axum (client-facing) socket and the tungstenite (upstream)
//! socket are adapted to `Frame` so the bridge and the coach pipeline
//! only ever see one message type.

use axum::extract::ws::{CloseFrame as AxumCloseFrame, Message as AxumMessage, WebSocket};
use bytes::Bytes;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::borrow::Cow;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::{AppError, Result};
use crate::protocol::close_code;

/// Boxed inbound half of a channel
pub type BoxFrameStream = Pin<Box<dyn Stream<Item = Result<Frame>> + Send>>;
/// Boxed outbound half of a channel
pub type BoxFrameSink = Pin<Box<dyn Sink<Frame, Error = AppError> + Send>>;

/// Close code and reason carried by a close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    pub fn normal() -> Self {
        Self::new(close_code::NORMAL, "")
    }
}

/// One WebSocket message. Text and binary stay distinct end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

impl Frame {
    pub fn close(code: u16, reason: impl Into<String>) -> Self {
        Frame::Close(Some(CloseReason::new(code, reason)))
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
            Frame::Ping(_) => "ping",
            Frame::Pong(_) => "pong",
            Frame::Close(_) => "close",
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) | Frame::Ping(data) | Frame::Pong(data) => data.len(),
            Frame::Close(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert from a tungstenite message. Raw frames have no counterpart.
    pub fn from_tungstenite(msg: TungsteniteMessage) -> Option<Self> {
        match msg {
            TungsteniteMessage::Text(text) => Some(Frame::Text(text)),
            TungsteniteMessage::Binary(data) => Some(Frame::Binary(Bytes::from(data))),
            TungsteniteMessage::Ping(data) => Some(Frame::Ping(Bytes::from(data))),
            TungsteniteMessage::Pong(data) => Some(Frame::Pong(Bytes::from(data))),
            TungsteniteMessage::Close(frame) => Some(Frame::Close(frame.map(|f| CloseReason {
                code: u16::from(f.code),
                reason: f.reason.into_owned(),
            }))),
            TungsteniteMessage::Frame(_) => None,
        }
    }

    pub fn into_tungstenite(self) -> TungsteniteMessage {
        match self {
            Frame::Text(text) => TungsteniteMessage::Text(text),
            Frame::Binary(data) => TungsteniteMessage::Binary(data.to_vec()),
            Frame::Ping(data) => TungsteniteMessage::Ping(data.to_vec()),
            Frame::Pong(data) => TungsteniteMessage::Pong(data.to_vec()),
            Frame::Close(reason) => {
                TungsteniteMessage::Close(reason.map(|r| TungsteniteCloseFrame {
                    code: r.code.into(),
                    reason: Cow::Owned(r.reason),
                }))
            }
        }
    }
}

impl From<AxumMessage> for Frame {
    fn from(msg: AxumMessage) -> Self {
        match msg {
            AxumMessage::Text(text) => Frame::Text(text),
            AxumMessage::Binary(data) => Frame::Binary(Bytes::from(data)),
            AxumMessage::Ping(data) => Frame::Ping(Bytes::from(data)),
            AxumMessage::Pong(data) => Frame::Pong(Bytes::from(data)),
            AxumMessage::Close(frame) => Frame::Close(frame.map(|f| CloseReason {
                code: f.code,
                reason: f.reason.into_owned(),
            })),
        }
    }
}

impl From<Frame> for AxumMessage {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => AxumMessage::Text(text),
            Frame::Binary(data) => AxumMessage::Binary(data.to_vec()),
            Frame::Ping(data) => AxumMessage::Ping(data.to_vec()),
            Frame::Pong(data) => AxumMessage::Pong(data.to_vec()),
            Frame::Close(reason) => AxumMessage::Close(reason.map(|r| AxumCloseFrame {
                code: r.code,
                reason: Cow::Owned(r.reason),
            })),
        }
    }
}

/// Split an axum socket (the client-facing side of the relay) into frame halves
pub fn split_axum(socket: WebSocket) -> (BoxFrameSink, BoxFrameStream) {
    let (tx, rx) = socket.split();

    let tx = tx
        .sink_map_err(|e| AppError::Internal(format!("Client socket send failed: {}", e)))
        .with(|frame: Frame| future::ready(Ok::<_, AppError>(AxumMessage::from(frame))));
    let rx = rx.map(|msg| {
        msg.map(Frame::from)
            .map_err(|e| AppError::Internal(format!("Client socket receive failed: {}", e)))
    });

    (Box::pin(tx), Box::pin(rx))
}

/// Split a tungstenite socket into frame halves. Errors surface as `Upstream`.
pub fn split_tungstenite<S>(ws: WebSocketStream<S>) -> (BoxFrameSink, BoxFrameStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = ws.split();

    let tx = tx
        .sink_map_err(|e| AppError::Upstream(format!("Send failed: {}", e)))
        .with(|frame: Frame| future::ready(Ok::<_, AppError>(frame.into_tungstenite())));
    let rx = rx.filter_map(|msg| {
        future::ready(match msg {
            Ok(msg) => Frame::from_tungstenite(msg).map(Ok),
            Err(e) => Some(Err(AppError::Upstream(format!("Receive failed: {}", e)))),
        })
    });

    (Box::pin(tx), Box::pin(rx))
}
