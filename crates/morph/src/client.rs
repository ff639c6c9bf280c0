//! HTTP client for the distbuild controller.
//!
//! The initiator side of the controller API: submit build requests,
//! query and cancel them, and follow the status/log event stream.

use futures::StreamExt;
use morph_core::protocol::{BuildInfo, BuildRequest, Message};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(
        "controller not reachable at {addr}\n  → start it with: morphd serve\n  → or set controller-initiator-address/port in the config"
    )]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("build not found: {0}")]
    BuildNotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: e.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Deserialize)]
pub struct CreateBuildResponse {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct ListBuildsResponse {
    builds: Vec<BuildInfo>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Initiator-side controller client.
pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    async fn check<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
        id_for_404: Option<&str>,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| ClientError::InvalidResponse(e.to_string()));
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        match status.as_u16() {
            404 => Err(ClientError::BuildNotFound(
                id_for_404.unwrap_or("unknown").to_string(),
            )),
            409 => Err(ClientError::InvalidOperation(message)),
            code => Err(ClientError::HttpError {
                status: code,
                message,
            }),
        }
    }

    /// Submit a build request; returns the build id to attach to or
    /// come back with later.
    pub async fn submit_build(&self, request: &BuildRequest) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/1.0/builds", self.base_url))
            .json(request)
            .send()
            .await?;
        let created: CreateBuildResponse = self.check(response, None).await?;
        Ok(created.id)
    }

    pub async fn get_build(&self, id: &str) -> Result<BuildInfo> {
        let response = self
            .http
            .get(format!("{}/1.0/builds/{id}", self.base_url))
            .send()
            .await?;
        self.check(response, Some(id)).await
    }

    pub async fn list_builds(&self) -> Result<Vec<BuildInfo>> {
        let response = self
            .http
            .get(format!("{}/1.0/builds", self.base_url))
            .send()
            .await?;
        let list: ListBuildsResponse = self.check(response, None).await?;
        Ok(list.builds)
    }

    pub async fn cancel_build(&self, id: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/1.0/builds/{id}/cancel", self.base_url))
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response
            .json::<ErrorBody>()
            .await
            .map(|body| body.error)
            .unwrap_or_else(|_| status.to_string());
        match status.as_u16() {
            404 => Err(ClientError::BuildNotFound(id.to_string())),
            409 => Err(ClientError::InvalidOperation(message)),
            code => Err(ClientError::HttpError {
                status: code,
                message,
            }),
        }
    }

    /// Follow the controller's event stream, handing each decoded
    /// message to the callback, until the build reaches a terminal
    /// message or the stream ends.
    pub async fn stream_events<F>(&self, id: &str, mut on_message: F) -> Result<()>
    where
        F: FnMut(&Message),
    {
        let response = self
            .http
            .get(format!("{}/1.0/builds/{id}/events", self.base_url))
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(ClientError::BuildNotFound(id.to_string()));
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);
                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                let Ok(message) = serde_json::from_str::<Message>(data.trim()) else {
                    continue;
                };
                let terminal = matches!(
                    message,
                    Message::BuildComplete { .. } | Message::BuildFailed { .. }
                );
                on_message(&message);
                if terminal {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
