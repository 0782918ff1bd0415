//! Per-session composition root.
//!
//! A [`SessionController`] owns everything scoped to one editing session:
//! the buffer, its sync channel, the run pipeline, the artifacts of the
//! last run and the interactive terminal. The presentation layer reads a
//! [`SessionState`] snapshot and never touches the components directly.

use crate::api::{
    HealthResponse, HttpWorkspaceClient, SessionFiles, ShellConnector, WorkspaceApi,
    WsShellConnector,
};
use crate::artifacts::{ArtifactStore, Download};
use crate::config::ClientConfig;
use crate::errors::{describe, SessionError, SessionResult};
use crate::execution::{ExecutionRequestPipeline, RunDisplay, RunReport};
use crate::session::{Buffer, SessionId};
use crate::sync::FileSyncChannel;
use crate::terminal::{ConnectionState, RenderSurface, TerminalChannel};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Everything the presentation layer needs to draw the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub session_id: SessionId,
    pub last_run: Option<RunDisplay>,
    pub running: bool,
    pub artifacts: Vec<String>,
    pub sync_warning: Option<String>,
    pub terminal: ConnectionState,
}

pub struct SessionController {
    session: SessionId,
    api: Arc<dyn WorkspaceApi>,
    buffer: Arc<Buffer>,
    sync: FileSyncChannel,
    pipeline: ExecutionRequestPipeline,
    artifacts: ArtifactStore,
    terminal: TerminalChannel,
}

impl SessionController {
    pub fn new(
        session: SessionId,
        config: &ClientConfig,
        api: Arc<dyn WorkspaceApi>,
        connector: Arc<dyn ShellConnector>,
        surface: Arc<dyn RenderSurface>,
    ) -> Self {
        let buffer = Arc::new(Buffer::new(config.filename.clone()));
        let sync = FileSyncChannel::new(api.clone());
        let artifacts = ArtifactStore::new();
        let pipeline = ExecutionRequestPipeline::new(
            api.clone(),
            sync.clone(),
            artifacts.clone(),
            config.filename.clone(),
        );
        let terminal = TerminalChannel::new(
            session.clone(),
            connector,
            sync.clone(),
            buffer.clone(),
            surface,
        )
        .with_identity(config.identity.clone())
        .with_reconnect(config.reconnect);

        Self {
            session,
            api,
            buffer,
            sync,
            pipeline,
            artifacts,
            terminal,
        }
    }

    /// Controller talking to a real backend over HTTP and WebSocket.
    pub fn connect(
        session: SessionId,
        config: &ClientConfig,
        surface: Arc<dyn RenderSurface>,
    ) -> SessionResult<Self> {
        let api = Arc::new(HttpWorkspaceClient::new(config)?);
        let connector = Arc::new(WsShellConnector::new(config));
        Ok(Self::new(session, config, api, connector, surface))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session
    }

    /// Record a buffer edit and push it in the background. Returns the push
    /// task, or `None` when the text did not change.
    pub fn on_buffer_changed(
        &self,
        text: impl Into<String>,
    ) -> Option<JoinHandle<SessionResult<()>>> {
        let text = text.into();
        if !self.buffer.replace(text.clone()) {
            return None;
        }
        Some(self.sync.push_detached(
            self.session.clone(),
            self.buffer.filename().to_string(),
            text,
        ))
    }

    /// Push an arbitrary file into the session workspace and wait for it.
    pub async fn push_file(&self, filename: &str, content: &str) -> SessionResult<()> {
        self.sync.push(&self.session, filename, content).await
    }

    /// Run the current buffer. `Ok(None)` when the buffer is blank.
    ///
    /// The pipeline records the display of the run before it reports
    /// itself idle, so [`state`](Self::state) never shows `running: false`
    /// next to the display of an older run.
    pub async fn run_requested(&self) -> SessionResult<Option<RunReport>> {
        let source = self.buffer.text();
        self.pipeline.run(&self.session, &source).await
    }

    /// Start the terminal channel.
    pub fn start(&self) -> SessionResult<()> {
        info!(session_id = %self.session, "Starting session");
        self.terminal.start()
    }

    /// Stop the terminal channel. A run in flight is left to finish.
    pub async fn stop(&self) {
        info!(session_id = %self.session, "Stopping session");
        self.terminal.stop().await;
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            session_id: self.session.clone(),
            last_run: self.pipeline.last_display(),
            running: self.pipeline.is_running(),
            artifacts: self.artifacts.names(),
            sync_warning: self.sync.last_warning(),
            terminal: self.terminal.connection_state(),
        }
    }

    pub fn prepare_download(&self, name: &str) -> SessionResult<Download> {
        self.artifacts.prepare_download(name)
    }

    /// Fetch a file from the session workspace for a local save.
    pub async fn download_workspace_file(&self, name: &str) -> SessionResult<Download> {
        let contents = self
            .api
            .download_file(&self.session, name)
            .await
            .map_err(|e| SessionError::ChannelUnreachable(describe(&e)))?
            .ok_or_else(|| SessionError::ArtifactNotFound(name.to_string()))?;
        debug!(
            session_id = %self.session,
            filename = %name,
            bytes = contents.bytes.len(),
            "Downloaded workspace file"
        );
        Ok(Download::from_workspace(name, contents))
    }

    pub fn send_terminal_input(&self, data: &str) -> SessionResult<()> {
        self.terminal.send_input(data)
    }

    pub fn terminal(&self) -> &TerminalChannel {
        &self.terminal
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub async fn health(&self) -> SessionResult<HealthResponse> {
        self.api
            .health()
            .await
            .map_err(|e| SessionError::ChannelUnreachable(describe(&e)))
    }

    /// Files in the session workspace, `None` if the backend has none yet.
    pub async fn list_files(&self) -> SessionResult<Option<SessionFiles>> {
        let files = self
            .api
            .list_files(&self.session)
            .await
            .map_err(|e| SessionError::ChannelUnreachable(describe(&e)))?;
        debug!(
            session_id = %self.session,
            count = files.as_ref().map(|f| f.count).unwrap_or(0),
            "Listed workspace files"
        );
        Ok(files)
    }
}
