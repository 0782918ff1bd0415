//! Generated files of the most recent run.
//!
//! Payloads are kept exactly as received (base64) and decoded only when a
//! caller asks for the bytes, so artifacts that are never downloaded cost
//! nothing beyond their encoded text.

use crate::api::{FileContents, RemoteFile};
use crate::errors::{SessionError, SessionResult};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// A named, typed, base64-encoded file produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub mime_type: String,
    /// Base64 (standard alphabet) encoded content
    pub payload: String,
}

impl Artifact {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            payload: payload.into(),
        }
    }

    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// `data:` URI suitable for inline previews.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.payload)
    }
}

impl From<RemoteFile> for Artifact {
    fn from(file: RemoteFile) -> Self {
        Self {
            name: file.name,
            mime_type: file.mime_type,
            payload: file.content,
        }
    }
}

/// What the platform save primitive needs for one user-initiated download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Download {
    pub filename: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Download {
    /// Download of a file fetched from the session workspace. The server's
    /// content type wins; otherwise it is guessed from the extension.
    pub fn from_workspace(filename: impl Into<String>, contents: FileContents) -> Self {
        let filename = filename.into();
        let mime_type = contents
            .content_type
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| guess_mime_type(&filename).to_string());
        Self {
            filename,
            mime_type,
            bytes: contents.bytes,
        }
    }

    /// Write the bytes into `dir` under the artifact's base name.
    pub async fn save_into(&self, dir: &Path) -> std::io::Result<PathBuf> {
        let name = Path::new(&self.filename)
            .file_name()
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("artifact name has no file component: {}", self.filename),
                )
            })?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, &self.bytes).await?;
        Ok(path)
    }
}

/// Media type the backend uses for a workspace file name.
pub fn guess_mime_type(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Decode an artifact's payload into raw bytes. Pure; never touches a store.
pub fn decode(artifact: &Artifact) -> SessionResult<Vec<u8>> {
    BASE64_STANDARD
        .decode(artifact.payload.trim())
        .map_err(|e| SessionError::ArtifactDecode {
            name: artifact.name.clone(),
            reason: e.to_string(),
        })
}

/// Holds the artifacts of the latest completed run. `replace_all` is the only
/// mutator and swaps the whole set at once.
#[derive(Clone, Default)]
pub struct ArtifactStore {
    artifacts: Arc<RwLock<Vec<Artifact>>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored set. Later duplicates of a name are dropped so
    /// names stay unique.
    pub fn replace_all(&self, artifacts: Vec<Artifact>) {
        let mut unique: Vec<Artifact> = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            if unique.iter().any(|existing| existing.name == artifact.name) {
                debug!(name = %artifact.name, "Dropping duplicate artifact name");
                continue;
            }
            unique.push(artifact);
        }
        *self.artifacts.write() = unique;
    }

    pub fn clear(&self) {
        self.replace_all(Vec::new());
    }

    pub fn resolve(&self, name: &str) -> SessionResult<Artifact> {
        self.artifacts
            .read()
            .iter()
            .find(|artifact| artifact.name == name)
            .cloned()
            .ok_or_else(|| SessionError::ArtifactNotFound(name.to_string()))
    }

    pub fn decode(&self, artifact: &Artifact) -> SessionResult<Vec<u8>> {
        decode(artifact)
    }

    /// Resolve and decode `name` for a local save.
    pub fn prepare_download(&self, name: &str) -> SessionResult<Download> {
        let artifact = self.resolve(name)?;
        let bytes = decode(&artifact)?;
        Ok(Download {
            filename: artifact.name,
            mime_type: artifact.mime_type,
            bytes,
        })
    }

    pub fn list(&self) -> Vec<Artifact> {
        self.artifacts.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.artifacts
            .read()
            .iter()
            .map(|artifact| artifact.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.read().is_empty()
    }
}
