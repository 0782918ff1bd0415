//! HTTP client for the sandbox backend.

use super::{
    ExecuteRequest, ExecuteResponse, FileContents, HealthResponse, SessionFiles,
    UpdateFileRequest, WorkspaceApi,
};
use crate::config::ClientConfig;
use crate::errors::{SessionError, SessionResult};
use crate::session::SessionId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Response, StatusCode};
use tracing::debug;
use url::Url;

#[derive(Clone)]
pub struct HttpWorkspaceClient {
    http: Client,
    config: ClientConfig,
}

impl HttpWorkspaceClient {
    pub fn new(config: &ClientConfig) -> SessionResult<Self> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SessionError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> Url {
        self.config.endpoint(path)
    }

    /// `download/{session}/{filename}` with each part percent-encoded as
    /// one path segment.
    fn download_url(&self, session: &SessionId, filename: &str) -> Result<Url> {
        let mut url = self.url("download");
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Backend address cannot carry a path"))?
            .push(session.as_str())
            .push(filename);
        Ok(url)
    }
}

/// Turn a non-2xx response into an error carrying the status and body.
async fn ensure_success(resp: Response) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    anyhow::bail!("Server returned {}: {}", status, body.trim())
}

#[async_trait]
impl WorkspaceApi for HttpWorkspaceClient {
    async fn update_file(&self, session: &SessionId, filename: &str, content: &str) -> Result<()> {
        let url = self.url(&format!("update-file/{}", session));
        debug!(
            session_id = %session,
            filename = %filename,
            bytes = content.len(),
            "Pushing workspace file"
        );

        let body = UpdateFileRequest {
            filename,
            content,
            session_id: session.as_str(),
        };
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .context("Failed to connect to server")?;
        ensure_success(resp).await?;
        Ok(())
    }

    async fn execute(&self, session: &SessionId, source: &str) -> Result<ExecuteResponse> {
        let url = self.url("execute");
        debug!(session_id = %session, bytes = source.len(), "Submitting execute request");

        let body = ExecuteRequest {
            source_code: source,
            identity: &self.config.identity,
        };
        let resp = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .context("Failed to connect to server")?;
        let resp = ensure_success(resp).await?;
        let data: ExecuteResponse = resp.json().await.context("Failed to parse response")?;
        Ok(data)
    }

    async fn health(&self) -> Result<HealthResponse> {
        let resp = self
            .http
            .get(self.url("health"))
            .send()
            .await
            .context("Failed to connect to server")?;
        let resp = ensure_success(resp).await?;
        resp.json().await.context("Failed to parse response")
    }

    async fn list_files(&self, session: &SessionId) -> Result<Option<SessionFiles>> {
        let resp = self
            .http
            .get(self.url(&format!("files/{}", session)))
            .send()
            .await
            .context("Failed to connect to server")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp).await?;
        let listing: SessionFiles = resp.json().await.context("Failed to parse response")?;
        Ok(Some(listing))
    }

    async fn download_file(
        &self,
        session: &SessionId,
        filename: &str,
    ) -> Result<Option<FileContents>> {
        let url = self.download_url(session, filename)?;
        debug!(session_id = %session, filename = %filename, "Downloading workspace file");

        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Failed to connect to server")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp).await?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = resp.bytes().await.context("Failed to read response body")?;
        Ok(Some(FileContents {
            content_type,
            bytes: bytes.to_vec(),
        }))
    }
}
