//! Upstream realtime endpoint connector

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tracing::{debug, info};

use super::frame::{split_tungstenite, BoxFrameSink, BoxFrameStream};
use crate::config::UpstreamConfig;
use crate::error::{AppError, Result};

/// Opens an authenticated channel to the upstream service
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(
        &self,
        config: &UpstreamConfig,
        credential: &str,
    ) -> Result<(BoxFrameSink, BoxFrameStream)>;
}

/// Connector for the OpenAI realtime WebSocket endpoint
#[derive(Debug, Default)]
pub struct RealtimeConnector;

#[async_trait]
impl UpstreamConnector for RealtimeConnector {
    async fn connect(
        &self,
        config: &UpstreamConfig,
        credential: &str,
    ) -> Result<(BoxFrameSink, BoxFrameStream)> {
        let endpoint = config.endpoint();
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| AppError::Configuration(format!("Invalid upstream URL: {}", e)))?;

        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", credential))
                .map_err(|e| AppError::Configuration(format!("Invalid credential: {}", e)))?,
        );
        if !config.beta_header.is_empty() {
            headers.insert(
                "openai-beta",
                HeaderValue::from_str(&config.beta_header)
                    .map_err(|e| AppError::Configuration(format!("Invalid beta header: {}", e)))?,
            );
        }

        debug!("Connecting upstream: {}", endpoint);
        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| AppError::Upstream(format!("Failed to connect upstream: {}", e)))?;
        info!("Upstream connected (HTTP {})", response.status());

        Ok(split_tungstenite(ws))
    }
}
