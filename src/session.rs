//! Session identity and the editor buffer.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Default logical filename of the edited script.
pub const DEFAULT_FILENAME: &str = "script.py";

/// Opaque token scoping every remote call of one editing session.
///
/// Constructed once by the caller and passed explicitly to every component;
/// the value never changes for the lifetime of the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh id in the editor's `create_<random>` form.
    pub fn generate() -> Self {
        Self(format!("create_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A copy of the buffer at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferSnapshot {
    pub filename: String,
    pub text: String,
}

impl BufferSnapshot {
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// The single source file being edited: a fixed filename plus its current
/// text. Every mutation replaces the previous text wholesale.
pub struct Buffer {
    filename: String,
    text: RwLock<String>,
}

impl Buffer {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            text: RwLock::new(String::new()),
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Replace the text, returning whether it differed from the old value.
    pub fn replace(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        let mut current = self.text.write();
        if *current == text {
            return false;
        }
        *current = text;
        true
    }

    pub fn text(&self) -> String {
        self.text.read().clone()
    }

    pub fn snapshot(&self) -> BufferSnapshot {
        BufferSnapshot {
            filename: self.filename.clone(),
            text: self.text(),
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(DEFAULT_FILENAME)
    }
}
