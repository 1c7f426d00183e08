//! HTTP and WebSocket access to a fleet presence server

use fleetcast_shared::{
    ChannelMessage, PositionReport, PresenceView, ReportResponse, ReportStatus, CHANNEL_PATH,
    REPORT_PATH, USERS_PATH,
};
use futures_util::StreamExt;
use log::{debug, info, warn};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("report rejected: {0}")]
    Rejected(String),

    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Builds the WebSocket URL of the realtime channel from an HTTP base URL.
pub fn channel_url(base: &str) -> Result<String> {
    let base = base.trim_end_matches('/');
    let rest = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(ClientError::InvalidUrl(base.to_string()));
    };
    Ok(format!("{}{}", rest, CHANNEL_PATH))
}

pub struct FleetClient {
    base_url: String,
    http: reqwest::Client,
}

impl FleetClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Posts one report. A rejection by the server is returned as
    /// [`ClientError::Rejected`] carrying the server's message.
    pub async fn report(&self, report: &PositionReport) -> Result<()> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, REPORT_PATH))
            .json(report)
            .send()
            .await?;

        let status = response.status();
        let body: ReportResponse = response.json().await?;
        debug!("Report answered with {} {:?}", status, body.status);

        match body.status {
            ReportStatus::Success => Ok(()),
            ReportStatus::Error => Err(ClientError::Rejected(
                body.message.unwrap_or_else(|| status.to_string()),
            )),
        }
    }

    pub async fn list(&self) -> Result<Vec<PresenceView>> {
        let users = self
            .http
            .get(format!("{}{}", self.base_url, USERS_PATH))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(users)
    }

    /// Streams realtime channel messages into `on_message` until the server
    /// closes the connection or `on_message` returns false.
    pub async fn watch<F>(&self, mut on_message: F) -> Result<()>
    where
        F: FnMut(ChannelMessage) -> bool,
    {
        let url = channel_url(&self.base_url)?;
        let (mut stream, _) = connect_async(url.as_str()).await?;
        info!("Connected to {}", url);

        while let Some(frame) = stream.next().await {
            match frame? {
                Message::Text(text) => match ChannelMessage::from_json(&text) {
                    Ok(message) => {
                        if !on_message(message) {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring unexpected channel message: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }

        info!("Channel closed");
        Ok(())
    }
}
