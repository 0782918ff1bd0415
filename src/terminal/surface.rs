//! Where terminal output ends up.

use parking_lot::RwLock;
use std::io::Write;

/// Maximum scrollback kept by [`Scrollback`], in bytes.
const MAX_SCROLLBACK: usize = 100_000;

const CLEAR_SEQUENCE: &str = "\x1b[2J\x1b[3J\x1b[H";

/// A local render target for shell output and connection notices.
pub trait RenderSurface: Send + Sync {
    fn write(&self, text: &str);
    fn clear(&self);
}

/// In-memory surface keeping the tail of everything written to it.
#[derive(Default)]
pub struct Scrollback {
    buffer: RwLock<String>,
}

impl Scrollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer.read().clone()
    }
}

impl RenderSurface for Scrollback {
    fn write(&self, text: &str) {
        let mut scrollback = self.buffer.write();
        scrollback.push_str(text);
        if scrollback.len() > MAX_SCROLLBACK {
            let mut start = scrollback.len() - MAX_SCROLLBACK;
            while start < scrollback.len() && !scrollback.is_char_boundary(start) {
                start += 1;
            }
            scrollback.drain(..start);
        }
    }

    fn clear(&self) {
        self.buffer.write().clear();
    }
}

/// Writes straight to the process stdout. Used by the CLI in raw mode.
#[derive(Default)]
pub struct StdoutSurface;

impl RenderSurface for StdoutSurface {
    fn write(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn clear(&self) {
        self.write(CLEAR_SEQUENCE);
    }
}
