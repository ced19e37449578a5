//! Relay HTTP surface: id acquisition, peer listing and message POSTs

use peerlink_core::{id::random_token, SignalMessage};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::config::SignalingConfig;
use crate::error::{Result, TransportError};

/// Client for the relay's request/response endpoints
#[derive(Clone)]
pub struct HttpApi {
    config: SignalingConfig,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(config: SignalingConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.config
    }

    pub(crate) fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Ask the relay for a fresh peer id
    pub async fn retrieve_id(&self) -> Result<String> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let url = format!(
            "{}/id?ts={}{}",
            self.config.http_base()?,
            ts,
            random_token()
        );

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status().as_u16()));
        }
        let id = response.text().await?.trim().to_string();
        debug!(id = %id, "retrieved id from relay");
        Ok(id)
    }

    /// List the ids of every peer connected to the relay under our key.
    ///
    /// A 401 is returned as `HttpStatus(401)`; any other non-success status
    /// yields an empty list.
    pub async fn list_peers(&self) -> Result<Vec<String>> {
        let url = format!("{}/peers", self.config.http_base()?);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TransportError::HttpStatus(status.as_u16()));
        }
        if !status.is_success() {
            warn!(status = status.as_u16(), "peer listing failed");
            return Ok(Vec::new());
        }
        Ok(response.json().await?)
    }

    /// POST one signaling message to `{session}/{type}`
    pub async fn post_message(&self, id: &str, token: &str, message: &SignalMessage) -> Result<()> {
        let url = format!(
            "{}/{}",
            self.config.session_base(id, token)?,
            message.kind.as_str().to_lowercase()
        );
        let response = self.client.post(&url).json(message).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}
