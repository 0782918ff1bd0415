//! Remote collaborator interfaces.
//!
//! Two seams separate the controller from the network:
//! - [`WorkspaceApi`]: request/response calls (file push, execute, health,
//!   file listing). Production implementation: [`HttpWorkspaceClient`].
//! - [`ShellConnector`]: opens the duplex interactive shell channel.
//!   Production implementation: [`WsShellConnector`].

mod http;
mod ws;

pub use http::HttpWorkspaceClient;
pub use ws::{find_utf8_boundary, WsShellConnector};

use crate::session::SessionId;
use async_trait::async_trait;
use futures::{Sink, Stream};
use serde::{Deserialize, Deserializer, Serialize};
use std::pin::Pin;

/// Caller identity carried on execute requests and shell commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl CallerIdentity {
    pub fn email(email: impl Into<String>) -> Self {
        Self {
            email: Some(email.into()),
        }
    }
}

/// Body of `POST update-file/{session_id}`.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateFileRequest<'a> {
    pub filename: &'a str,
    pub content: &'a str,
    pub session_id: &'a str,
}

/// Body of `POST execute`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest<'a> {
    #[serde(rename = "sourceCode")]
    pub source_code: &'a str,
    #[serde(flatten)]
    pub identity: &'a CallerIdentity,
}

/// Response of `POST execute`. Absent or null fields read as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecuteResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    pub run: RunOutput,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<RemoteFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RunOutput {
    #[serde(default, deserialize_with = "null_as_default")]
    pub stdout: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub stderr: String,
    /// Process exit code, when the backend reports one.
    #[serde(default)]
    pub code: Option<i32>,
}

/// A generated file as it travels on the wire (base64 content).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    pub name: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub mime_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
}

/// Response of `GET health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_available: Option<bool>,
}

/// Response of `GET files/{session_id}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFiles {
    pub session_id: String,
    #[serde(default)]
    pub files: Vec<WorkspaceFile>,
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceFile {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    /// Modification time (Unix epoch seconds)
    #[serde(default)]
    pub modified: i64,
    #[serde(default)]
    pub download_url: String,
}

/// Body of `GET download/{session_id}/{filename}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContents {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Outbound shell message: one input chunk plus the caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShellCommand {
    pub command: String,
    #[serde(flatten)]
    pub identity: CallerIdentity,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Request/response calls against the sandbox backend.
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// Replace `filename` in the session workspace with `content`.
    async fn update_file(
        &self,
        session: &SessionId,
        filename: &str,
        content: &str,
    ) -> anyhow::Result<()>;

    /// Execute `source` and capture its output and generated files.
    async fn execute(&self, session: &SessionId, source: &str) -> anyhow::Result<ExecuteResponse>;

    async fn health(&self) -> anyhow::Result<HealthResponse>;

    /// List the session workspace. `None` when the backend has no workspace
    /// for this session yet.
    async fn list_files(&self, session: &SessionId) -> anyhow::Result<Option<SessionFiles>>;

    /// Fetch one workspace file. `None` when the session or the file does
    /// not exist.
    async fn download_file(
        &self,
        session: &SessionId,
        filename: &str,
    ) -> anyhow::Result<Option<FileContents>>;
}

pub type ShellSink = Pin<Box<dyn Sink<ShellCommand, Error = anyhow::Error> + Send>>;
pub type ShellStream = Pin<Box<dyn Stream<Item = anyhow::Result<String>> + Send>>;

/// One physical shell connection, split into its outbound and inbound halves.
/// Dropping both halves closes the connection.
pub struct ShellLink {
    pub sink: ShellSink,
    pub stream: ShellStream,
}

/// Opens duplex shell connections addressed by session id.
#[async_trait]
pub trait ShellConnector: Send + Sync {
    async fn connect(&self, session: &SessionId) -> anyhow::Result<ShellLink>;
}
