//! One-shot "run this buffer" requests.
//!
//! A run pushes the exact source it is about to execute, asks the sandbox to
//! execute it, and folds stdout/stderr/artifacts into a single display state.
//! Only one run may be in flight per pipeline; overlapping calls get `Busy`.

use crate::api::{ExecuteResponse, WorkspaceApi};
use crate::artifacts::{Artifact, ArtifactStore};
use crate::errors::{describe, SessionError, SessionResult};
use crate::session::SessionId;
use crate::sync::FileSyncChannel;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const ARTIFACTS_ONLY_NOTICE: &str = "Code executed successfully. Check generated files below.";
pub const NO_OUTPUT_NOTICE: &str = "No output";

/// Normalized outcome of one execute request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub artifacts: Vec<Artifact>,
}

impl From<ExecuteResponse> for RunResult {
    fn from(response: ExecuteResponse) -> Self {
        Self {
            stdout: response.run.stdout,
            stderr: response.run.stderr,
            exit_code: response.run.code,
            artifacts: response.files.into_iter().map(Artifact::from).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayKind {
    Stdout,
    Stderr,
    ArtifactsOnly,
    NoOutput,
    Failed,
}

/// What the output area shows after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunDisplay {
    pub kind: DisplayKind,
    pub text: String,
    pub is_error: bool,
}

impl RunDisplay {
    /// Program output wins over diagnostics: stdout, then stderr, then a
    /// generic notice.
    pub fn classify(result: &RunResult) -> Self {
        if !result.stdout.trim().is_empty() {
            Self {
                kind: DisplayKind::Stdout,
                text: result.stdout.clone(),
                is_error: false,
            }
        } else if !result.stderr.trim().is_empty() {
            Self {
                kind: DisplayKind::Stderr,
                text: result.stderr.clone(),
                is_error: true,
            }
        } else if !result.artifacts.is_empty() {
            Self {
                kind: DisplayKind::ArtifactsOnly,
                text: ARTIFACTS_ONLY_NOTICE.to_string(),
                is_error: false,
            }
        } else {
            Self {
                kind: DisplayKind::NoOutput,
                text: NO_OUTPUT_NOTICE.to_string(),
                is_error: false,
            }
        }
    }

    pub fn failed(message: &str) -> Self {
        Self {
            kind: DisplayKind::Failed,
            text: format!("Execution failed: {}", message),
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub result: RunResult,
    pub display: RunDisplay,
}

/// Releases the in-flight slot when the run finishes or is dropped.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ExecutionRequestPipeline {
    api: Arc<dyn WorkspaceApi>,
    sync: FileSyncChannel,
    artifacts: ArtifactStore,
    filename: String,
    in_flight: Arc<AtomicBool>,
    last_display: Arc<RwLock<Option<RunDisplay>>>,
}

impl ExecutionRequestPipeline {
    pub fn new(
        api: Arc<dyn WorkspaceApi>,
        sync: FileSyncChannel,
        artifacts: ArtifactStore,
        filename: impl Into<String>,
    ) -> Self {
        Self {
            api,
            sync,
            artifacts,
            filename: filename.into(),
            in_flight: Arc::new(AtomicBool::new(false)),
            last_display: Arc::new(RwLock::new(None)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Display of the last run that completed or failed.
    ///
    /// Written before the in-flight flag is released, so once `is_running`
    /// reads false this already reflects the run that just ended.
    pub fn last_display(&self) -> Option<RunDisplay> {
        self.last_display.read().clone()
    }

    /// Run `source` in the sandbox.
    ///
    /// Returns `Ok(None)` without any remote call when `source` is blank.
    /// On failure the artifact store is cleared so stale files from an
    /// earlier run are never shown next to a failed one. A blank source or
    /// a `Busy` rejection leaves the last display untouched.
    pub async fn run(&self, session: &SessionId, source: &str) -> SessionResult<Option<RunReport>> {
        if source.trim().is_empty() {
            debug!(session_id = %session, "Skipping run of blank buffer");
            return Ok(None);
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!(session_id = %session, "Run rejected, another run is in flight");
            return Err(SessionError::Busy);
        };

        match self.execute(session, source).await {
            Ok(result) => {
                let run_display = RunDisplay::classify(&result);
                info!(
                    session_id = %session,
                    kind = ?run_display.kind,
                    exit_code = ?result.exit_code,
                    artifacts = result.artifacts.len(),
                    "Run completed"
                );
                self.artifacts.replace_all(result.artifacts.clone());
                *self.last_display.write() = Some(run_display.clone());
                Ok(Some(RunReport {
                    result,
                    display: run_display,
                }))
            }
            Err(e) => {
                warn!(session_id = %session, error = %e, "Run failed");
                self.artifacts.clear();
                let message = match &e {
                    SessionError::Execution(message) => message.clone(),
                    other => other.to_string(),
                };
                *self.last_display.write() = Some(RunDisplay::failed(&message));
                Err(e)
            }
        }
    }

    async fn execute(&self, session: &SessionId, source: &str) -> SessionResult<RunResult> {
        // The remote copy must match what is about to run.
        self.sync
            .push(session, &self.filename, source)
            .await
            .map_err(|e| match e {
                SessionError::SyncFailure(message) => SessionError::Execution(message),
                other => other,
            })?;

        let response = self
            .api
            .execute(session, source)
            .await
            .map_err(|e| SessionError::Execution(describe(&e)))?;
        Ok(RunResult::from(response))
    }
}
