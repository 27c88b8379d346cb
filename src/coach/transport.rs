//! Client-side channel to the relay

use async_trait::async_trait;
use tracing::info;

use crate::error::{AppError, Result};
use crate::relay::{split_tungstenite, BoxFrameSink, BoxFrameStream};

/// Opens the bridged channel
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<(BoxFrameSink, BoxFrameStream)>;
}

/// Dials the relay's WebSocket endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<(BoxFrameSink, BoxFrameStream)> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| {
                AppError::Upstream(format!("Failed to connect to relay {}: {}", self.url, e))
            })?;
        info!("Connected to relay {}", self.url);
        Ok(split_tungstenite(ws))
    }
}
