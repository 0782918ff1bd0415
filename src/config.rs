//! Client configuration.

use crate::api::CallerIdentity;
use crate::errors::{SessionError, SessionResult};
use crate::session::DEFAULT_FILENAME;
use std::time::Duration;
use url::Url;

pub const DEFAULT_API_ADDRESS: &str = "http://127.0.0.1:8000";
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the terminal channel waits before each reconnect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// Constant delay between attempts, forever.
    Fixed(Duration),
    /// Doubling delay starting at `initial`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed(delay) => delay,
            ReconnectPolicy::Exponential { initial, max } => {
                let factor = 1u32
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u32::MAX);
                initial.saturating_mul(factor).min(max)
            }
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the sandbox backend (`http://host:port`).
    pub api_base_url: Url,
    /// Identity attached to execute requests and shell commands.
    pub identity: CallerIdentity,
    /// Logical filename of the edited buffer.
    pub filename: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ClientConfig {
    pub fn new(api_address: &str) -> SessionResult<Self> {
        Ok(Self {
            api_base_url: parse_api_address(api_address)?,
            identity: CallerIdentity::default(),
            filename: DEFAULT_FILENAME.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        })
    }

    /// Build from `CMUX_API_ADDRESS`, `CMUX_USER_EMAIL`, `CMUX_SCRIPT_NAME`
    /// and `CMUX_RECONNECT_DELAY_MS`.
    pub fn from_env() -> SessionResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SessionResult<Self> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let address = non_empty("CMUX_API_ADDRESS")
            .or_else(|| non_empty("CMUX_API_URL"))
            .unwrap_or_else(|| DEFAULT_API_ADDRESS.to_string());
        let mut config = Self::new(&address)?;

        if let Some(email) = non_empty("CMUX_USER_EMAIL") {
            config.identity = CallerIdentity::email(email);
        }
        if let Some(filename) = non_empty("CMUX_SCRIPT_NAME") {
            config.filename = filename;
        }
        if let Some(raw) = non_empty("CMUX_RECONNECT_DELAY_MS") {
            let millis: u64 = raw.trim().parse().map_err(|_| {
                SessionError::Config(format!("CMUX_RECONNECT_DELAY_MS is not a number: {raw}"))
            })?;
            config.reconnect = ReconnectPolicy::Fixed(Duration::from_millis(millis));
        }
        Ok(config)
    }

    pub fn with_api_address(mut self, api_address: &str) -> SessionResult<Self> {
        self.api_base_url = parse_api_address(api_address)?;
        Ok(self)
    }

    pub fn with_identity(mut self, identity: CallerIdentity) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = filename.into();
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// HTTP endpoint for `path` below the API base.
    pub fn endpoint(&self, path: &str) -> Url {
        join_path(&self.api_base_url, path)
    }

    /// WebSocket endpoint for `path`, switching `http(s)` to `ws(s)`.
    pub fn ws_endpoint(&self, path: &str) -> SessionResult<Url> {
        let mut url = join_path(&self.api_base_url, path);
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme)
            .map_err(|_| SessionError::Config(format!("cannot derive websocket url from {url}")))?;
        Ok(url)
    }
}

/// Accept `host:port`, `http://host:port` or `https://host/prefix/`.
fn parse_api_address(address: &str) -> SessionResult<Url> {
    let trimmed = address.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SessionError::Config("api address is empty".to_string()));
    }
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&with_scheme)
        .map_err(|e| SessionError::Config(format!("invalid api address {address}: {e}")))?;
    if url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(SessionError::Config(format!("invalid api address {address}")));
    }
    Ok(url)
}

fn join_path(base: &Url, path: &str) -> Url {
    let mut url = base.clone();
    let base_path = base.path().trim_end_matches('/');
    let (raw_path, raw_query) = match path.split_once('?') {
        Some((path_part, query_part)) => (path_part, Some(query_part)),
        None => (path, None),
    };
    let trimmed_path = raw_path.trim_start_matches('/');
    let joined_path = if base_path.is_empty() || base_path == "/" {
        format!("/{}", trimmed_path)
    } else {
        format!("{}/{}", base_path, trimmed_path)
    };
    url.set_path(&joined_path);
    url.set_query(raw_query);
    url.set_fragment(None);
    url
}
