//! In-memory transports for unit tests.

use crate::api::{
    ExecuteResponse, FileContents, HealthResponse, SessionFiles, ShellCommand, ShellConnector,
    ShellLink, WorkspaceApi,
};
use crate::session::SessionId;
use async_trait::async_trait;
use futures::SinkExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRecord {
    pub session: String,
    pub filename: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Push(PushRecord),
    Execute { session: String, source: String },
}

/// Records every call in order; execute can be held open to simulate a slow
/// sandbox, and a push of chosen content can be stalled.
#[derive(Default)]
pub struct MockWorkspace {
    calls: Mutex<Vec<MockCall>>,
    fail_pushes: AtomicBool,
    stalled_content: Mutex<Option<String>>,
    push_stalled: Notify,
    release_stalled: Notify,
    execute_result: Mutex<Option<Result<ExecuteResponse, String>>>,
    hold_execute: AtomicBool,
    execute_started: Notify,
    release_execute: Notify,
}

impl MockWorkspace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_pushes(&self, fail: bool) {
        self.fail_pushes.store(fail, Ordering::SeqCst);
    }

    /// Pushes of exactly `content` block until
    /// [`release_stalled_push`](Self::release_stalled_push) and then fail.
    pub fn stall_push_of(&self, content: &str) {
        *self.stalled_content.lock() = Some(content.to_string());
    }

    pub async fn push_stalled(&self) {
        self.push_stalled.notified().await;
    }

    pub fn release_stalled_push(&self) {
        self.release_stalled.notify_one();
    }

    pub fn respond_with(&self, response: ExecuteResponse) {
        *self.execute_result.lock() = Some(Ok(response));
    }

    pub fn fail_execute(&self, message: &str) {
        *self.execute_result.lock() = Some(Err(message.to_string()));
    }

    /// Make the next execute calls wait for [`release`](Self::release).
    pub fn hold_execute(&self) {
        self.hold_execute.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.hold_execute.store(false, Ordering::SeqCst);
        self.release_execute.notify_one();
    }

    pub async fn execute_started(&self) {
        self.execute_started.notified().await;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn pushes(&self) -> Vec<PushRecord> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::Push(record) => Some(record.clone()),
                MockCall::Execute { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl WorkspaceApi for MockWorkspace {
    async fn update_file(
        &self,
        session: &SessionId,
        filename: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        let stalled = self.stalled_content.lock().as_deref() == Some(content);
        if stalled {
            self.push_stalled.notify_one();
            self.release_stalled.notified().await;
            anyhow::bail!("Server returned 504 Gateway Timeout: upstream stalled");
        }
        if self.fail_pushes.load(Ordering::SeqCst) {
            anyhow::bail!("Server returned 503 Service Unavailable: sandbox busy");
        }
        self.calls.lock().push(MockCall::Push(PushRecord {
            session: session.to_string(),
            filename: filename.to_string(),
            content: content.to_string(),
        }));
        Ok(())
    }

    async fn execute(&self, session: &SessionId, source: &str) -> anyhow::Result<ExecuteResponse> {
        self.calls.lock().push(MockCall::Execute {
            session: session.to_string(),
            source: source.to_string(),
        });
        self.execute_started.notify_one();
        if self.hold_execute.load(Ordering::SeqCst) {
            self.release_execute.notified().await;
        }
        match self.execute_result.lock().clone() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(ExecuteResponse::default()),
        }
    }

    async fn health(&self) -> anyhow::Result<HealthResponse> {
        Ok(HealthResponse {
            status: "healthy".to_string(),
            service: Some("mock".to_string()),
            docker_available: Some(true),
        })
    }

    async fn list_files(&self, session: &SessionId) -> anyhow::Result<Option<SessionFiles>> {
        Ok(Some(SessionFiles {
            session_id: session.to_string(),
            files: Vec::new(),
            count: 0,
        }))
    }

    /// Serves back the newest pushed content of `filename`.
    async fn download_file(
        &self,
        session: &SessionId,
        filename: &str,
    ) -> anyhow::Result<Option<FileContents>> {
        let content = self.pushes().into_iter().rev().find_map(|record| {
            (record.session == session.as_str() && record.filename == filename)
                .then_some(record.content)
        });
        Ok(content.map(|content| FileContents {
            content_type: Some("text/plain".to_string()),
            bytes: content.into_bytes(),
        }))
    }
}

/// Server side of one mock shell connection. Dropping `output` simulates the
/// remote end closing the connection.
pub struct RemoteEnd {
    pub output: futures::channel::mpsc::UnboundedSender<anyhow::Result<String>>,
    pub commands: futures::channel::mpsc::UnboundedReceiver<ShellCommand>,
}

impl RemoteEnd {
    pub fn say(&self, text: &str) {
        let _ = self.output.unbounded_send(Ok(text.to_string()));
    }
}

pub struct MockShell {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    failures_left: AtomicUsize,
    connects: AtomicUsize,
}

impl MockShell {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        let shell = Arc::new(Self {
            remotes,
            failures_left: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        });
        (shell, rx)
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ShellConnector for MockShell {
    async fn connect(&self, _session: &SessionId) -> anyhow::Result<ShellLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            anyhow::bail!("connection refused");
        }

        let (output_tx, output_rx) = futures::channel::mpsc::unbounded();
        let (command_tx, command_rx) = futures::channel::mpsc::unbounded();
        let _ = self.remotes.send(RemoteEnd {
            output: output_tx,
            commands: command_rx,
        });
        Ok(ShellLink {
            sink: Box::pin(command_tx.sink_map_err(anyhow::Error::new)),
            stream: Box::pin(output_rx),
        })
    }
}
