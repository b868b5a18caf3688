//! HTTP connector
//!
//! Talks to the backend's REST endpoints with reqwest and reads the event
//! channel as server-sent events.

use std::time::Duration;

use async_trait::async_trait;
use chatsync_protocol::terminal::{CreateTerminalRequest, TerminalInput, TerminalSession, TerminalSize};
use chatsync_protocol::{
    MessageWithParts, PermissionRequest, QuestionRequest, SessionInfo, SessionStatusMap,
};
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::sse::decode_stream;
use crate::{Backend, ConnectorError, EventSource, EventStream, TerminalBackend};

/// Timeout for request/response calls. The event channel has none.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    healthy: bool,
}

/// Backend reached over HTTP
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    directory: Option<String>,
}

impl HttpBackend {
    /// `directory` scopes every request to one project on multi-project servers.
    pub fn new(base_url: &str, directory: Option<String>) -> Result<Self, ConnectorError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ConnectorError::InvalidUrl(format!("{base_url}: {e}")))?;
        Ok(Self {
            client: Client::new(),
            base_url,
            directory,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ConnectorError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|e| ConnectorError::InvalidUrl(format!("{path}: {e}")))?;
        let mut builder = self.client.request(method, url);
        if let Some(directory) = &self.directory {
            builder = builder.query(&[("directory", directory.as_str())]);
        }
        Ok(builder)
    }

    async fn send(builder: RequestBuilder) -> Result<reqwest::Response, ConnectorError> {
        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, ConnectorError> {
        let response = Self::send(builder.timeout(REQUEST_TIMEOUT)).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl EventSource for HttpBackend {
    async fn subscribe(&self) -> Result<EventStream, ConnectorError> {
        let builder = self
            .request(Method::GET, "/event")?
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = Self::send(builder).await?;
        debug!(
            component = "http_connector",
            event = "http.event_stream.opened",
            url = %self.base_url,
            "Event stream opened"
        );
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(ConnectorError::from));
        Ok(decode_stream(bytes))
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn list_pending_permissions(&self) -> Result<Vec<PermissionRequest>, ConnectorError> {
        self.get_json(self.request(Method::GET, "/permission")?).await
    }

    async fn list_pending_questions(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<QuestionRequest>, ConnectorError> {
        let mut builder = self.request(Method::GET, "/question")?;
        if let Some(session_id) = session_id {
            builder = builder.query(&[("sessionID", session_id)]);
        }
        let questions: Vec<QuestionRequest> = self.get_json(builder).await?;
        Ok(match session_id {
            Some(session_id) => questions
                .into_iter()
                .filter(|q| q.session_id == session_id)
                .collect(),
            None => questions,
        })
    }

    async fn get_session(&self, session_id: &str) -> Result<SessionInfo, ConnectorError> {
        self.get_json(self.request(Method::GET, &format!("/session/{session_id}"))?)
            .await
    }

    async fn get_global_session_status(&self) -> Result<SessionStatusMap, ConnectorError> {
        self.get_json(self.request(Method::GET, "/session/status")?)
            .await
    }

    async fn check_health(&self) -> bool {
        let builder = match self.request(Method::GET, "/global/health") {
            Ok(builder) => builder.timeout(HEALTH_TIMEOUT),
            Err(_) => return false,
        };
        match Self::send(builder).await {
            Ok(response) => response
                .json::<HealthResponse>()
                .await
                .map(|h| h.healthy)
                .unwrap_or(false),
            Err(e) => {
                warn!(
                    component = "http_connector",
                    event = "http.health.failed",
                    error = %e,
                    "Health probe failed"
                );
                false
            }
        }
    }

    async fn load_messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageWithParts>, ConnectorError> {
        let mut builder = self.request(Method::GET, &format!("/session/{session_id}/message"))?;
        if let Some(limit) = limit {
            builder = builder.query(&[("limit", limit)]);
        }
        self.get_json(builder).await
    }
}

#[async_trait]
impl TerminalBackend for HttpBackend {
    async fn create_session(&self, cwd: &str) -> Result<String, ConnectorError> {
        let builder = self.request(Method::POST, "/pty")?.json(&CreateTerminalRequest {
            cwd: cwd.to_string(),
        });
        let session: TerminalSession = self.get_json(builder).await?;
        Ok(session.session_id)
    }

    async fn send_input(&self, session_id: &str, text: &str) -> Result<(), ConnectorError> {
        let builder = self
            .request(Method::POST, &format!("/pty/{session_id}/input"))?
            .json(&TerminalInput {
                data: text.to_string(),
            });
        Self::send(builder.timeout(REQUEST_TIMEOUT)).await?;
        Ok(())
    }

    async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), ConnectorError> {
        let builder = self
            .request(Method::PUT, &format!("/pty/{session_id}"))?
            .json(&TerminalSize { cols, rows });
        Self::send(builder.timeout(REQUEST_TIMEOUT)).await?;
        Ok(())
    }

    async fn close(&self, session_id: &str) -> Result<(), ConnectorError> {
        let builder = self.request(Method::DELETE, &format!("/pty/{session_id}"))?;
        Self::send(builder.timeout(REQUEST_TIMEOUT)).await?;
        Ok(())
    }
}
