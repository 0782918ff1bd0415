//! WebSocket connector for the interactive shell channel.

use super::{ShellCommand, ShellConnector, ShellLink};
use crate::config::ClientConfig;
use crate::session::SessionId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to `ws(s)://<api>/ws/{session_id}`.
#[derive(Clone)]
pub struct WsShellConnector {
    config: ClientConfig,
}

impl WsShellConnector {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl ShellConnector for WsShellConnector {
    async fn connect(&self, session: &SessionId) -> Result<ShellLink> {
        let url = self.config.ws_endpoint(&format!("/ws/{}", session))?;
        debug!(session_id = %session, url = %url, "Opening shell websocket");

        let (ws, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(url.as_str()))
            .await
            .context("Timed out connecting to WebSocket")?
            .context("Failed to connect to WebSocket")?;
        try_set_ws_nodelay(&ws);

        let (ws_sink, ws_stream) = ws.split();
        let sink = ws_sink.with(|command: ShellCommand| async move {
            let payload = serde_json::to_string(&command)?;
            Ok::<Message, anyhow::Error>(Message::Text(payload))
        });

        Ok(ShellLink {
            sink: Box::pin(sink),
            stream: Box::pin(decode_frames(ws_stream)),
        })
    }
}

/// Turn websocket frames into text chunks. Binary frames may split a
/// multibyte character; the incomplete tail is carried into the next frame.
fn decode_frames(
    ws_stream: futures::stream::SplitStream<WsStream>,
) -> impl futures::Stream<Item = Result<String>> + Send {
    futures::stream::unfold(
        (ws_stream, Vec::<u8>::new(), false),
        |(mut ws, mut carry, done)| async move {
            if done {
                return None;
            }
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => return Some((Ok(text), (ws, carry, false))),
                    Some(Ok(Message::Binary(data))) => {
                        carry.extend_from_slice(&data);
                        let valid_up_to = find_utf8_boundary(&carry);
                        if valid_up_to > 0 {
                            let chunk = String::from_utf8_lossy(&carry[..valid_up_to]).into_owned();
                            carry.drain(..valid_up_to);
                            return Some((Ok(chunk), (ws, carry, false)));
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if carry.is_empty() {
                            return None;
                        }
                        let chunk = String::from_utf8_lossy(&carry).into_owned();
                        return Some((Ok(chunk), (ws, Vec::new(), true)));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Some((
                            Err(anyhow::Error::new(e).context("WebSocket read failed")),
                            (ws, carry, true),
                        ))
                    }
                }
            }
        },
    )
}

fn try_set_ws_nodelay(ws: &WsStream) {
    match ws.get_ref() {
        MaybeTlsStream::Plain(stream) => {
            if let Err(err) = stream.set_nodelay(true) {
                debug!(error = %err, "Failed to enable TCP_NODELAY for shell websocket");
            }
        }
        _ => {
            debug!("Skipping TCP_NODELAY for TLS shell websocket");
        }
    }
}

/// Find the last valid UTF-8 boundary in a byte slice.
///
/// Only a trailing incomplete sequence is held back. Invalid bytes anywhere
/// are left in place for the lossy conversion to replace.
pub fn find_utf8_boundary(bytes: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&bytes[start..]) {
            Ok(_) => return bytes.len(),
            Err(e) => match e.error_len() {
                // Input ends inside a sequence that may still complete
                None => return start + e.valid_up_to(),
                Some(invalid) => start += e.valid_up_to() + invalid,
            },
        }
    }
}
