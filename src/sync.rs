//! Best-effort push of the editor buffer into the remote workspace.
//!
//! Every push is a full-file replace, so racing pushes can only leave the
//! remote file at some version the user actually typed. Failures are logged
//! and remembered as a warning; the next push is an independent attempt.
//! Each push is numbered when it starts, and only the newest push that has
//! finished decides the warning.

use crate::api::WorkspaceApi;
use crate::errors::{describe, SessionError, SessionResult};
use crate::session::SessionId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outcome of the newest push that has finished.
#[derive(Debug, Default)]
struct SyncStatus {
    seq: u64,
    warning: Option<String>,
}

impl SyncStatus {
    /// Returns false when a newer push already settled the status.
    fn settle(&mut self, seq: u64, warning: Option<String>) -> bool {
        if seq < self.seq {
            return false;
        }
        self.seq = seq;
        self.warning = warning;
        true
    }
}

#[derive(Clone)]
pub struct FileSyncChannel {
    api: Arc<dyn WorkspaceApi>,
    next_seq: Arc<AtomicU64>,
    status: Arc<RwLock<SyncStatus>>,
}

impl FileSyncChannel {
    pub fn new(api: Arc<dyn WorkspaceApi>) -> Self {
        Self {
            api,
            next_seq: Arc::new(AtomicU64::new(1)),
            status: Arc::new(RwLock::new(SyncStatus::default())),
        }
    }

    /// Replace `filename` in the session workspace with `content`.
    pub async fn push(
        &self,
        session: &SessionId,
        filename: &str,
        content: &str,
    ) -> SessionResult<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        match self.api.update_file(session, filename, content).await {
            Ok(()) => {
                debug!(session_id = %session, filename = %filename, seq, "Workspace file synced");
                self.settle(seq, None);
                Ok(())
            }
            Err(e) => {
                let message = describe(&e);
                warn!(
                    session_id = %session,
                    filename = %filename,
                    seq,
                    error = %message,
                    "Failed to sync workspace file"
                );
                self.settle(seq, Some(message.clone()));
                Err(SessionError::SyncFailure(message))
            }
        }
    }

    fn settle(&self, seq: u64, warning: Option<String>) {
        if !self.status.write().settle(seq, warning) {
            debug!(seq, "Ignoring outcome of a superseded push");
        }
    }

    /// Fire-and-forget variant of [`push`](Self::push). The returned handle
    /// may be awaited or dropped.
    pub fn push_detached(
        &self,
        session: SessionId,
        filename: String,
        content: String,
    ) -> JoinHandle<SessionResult<()>> {
        let channel = self.clone();
        tokio::spawn(async move { channel.push(&session, &filename, &content).await })
    }

    /// Message of the failed push, if the newest finished push failed.
    pub fn last_warning(&self) -> Option<String> {
        self.status.read().warning.clone()
    }
}
