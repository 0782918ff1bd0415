//! cmux-session: client-side controller for a remote code execution sandbox
//!
//! This crate provides:
//! - `SessionController`: one editing session bound to a `SessionId`
//! - `FileSyncChannel`: best-effort push of the edited buffer to the workspace
//! - `ExecutionRequestPipeline`: push-then-execute runs with output classification
//! - `ArtifactStore`: generated files of the last run, decoded on demand
//! - `TerminalChannel`: interactive shell with automatic reconnect
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cmux_session::{ClientConfig, Scrollback, SessionController, SessionId};
//!
//! # async fn demo() -> Result<(), cmux_session::SessionError> {
//! let config = ClientConfig::from_env()?;
//! let controller = SessionController::connect(
//!     SessionId::generate(),
//!     &config,
//!     Arc::new(Scrollback::new()),
//! )?;
//!
//! controller.on_buffer_changed("print(6 * 7)");
//! if let Some(report) = controller.run_requested().await? {
//!     println!("{}", report.display.text);
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod artifacts;
pub mod config;
pub mod controller;
pub mod errors;
pub mod execution;
pub mod session;
pub mod sync;
pub mod terminal;

#[cfg(test)]
mod testing;

pub use api::{CallerIdentity, HttpWorkspaceClient, ShellConnector, WorkspaceApi, WsShellConnector};
pub use artifacts::{Artifact, ArtifactStore, Download};
pub use config::{ClientConfig, ReconnectPolicy};
pub use controller::{SessionController, SessionState};
pub use errors::{SessionError, SessionResult};
pub use execution::{DisplayKind, ExecutionRequestPipeline, RunDisplay, RunReport, RunResult};
pub use session::{Buffer, SessionId};
pub use sync::FileSyncChannel;
pub use terminal::{
    ConnectionState, RenderSurface, Scrollback, StdoutSurface, TerminalChannel, TerminalEvent,
    TerminalSession,
};
