//! Realtime push channel.
//!
//! The server speaks socket.io v4 over a WebSocket. Only the handful of
//! packet types the coordinator needs are handled: engine.io open/ping and
//! socket.io namespace connect and events.

use crate::error::{ConverseError, ConverseResult};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub const CONVERSATION_MESSAGE: &str = "conversations.message";
pub const CONVERSATION_UPDATED: &str = "conversations.updated";
pub const AI_THINKING: &str = "ai-thinking";

/// Server-to-client events the coordinator reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    ConversationMessage { conversation_id: Option<String> },
    ConversationUpdated { conversation_id: Option<String> },
    /// Incremental status string for the display-only thinking log.
    AiThinking(String),
}

impl RealtimeEvent {
    pub fn from_parts(name: &str, data: &Value) -> Option<Self> {
        let conversation_id = || {
            data.get("conversationId")
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        match name {
            CONVERSATION_MESSAGE => Some(Self::ConversationMessage {
                conversation_id: conversation_id(),
            }),
            CONVERSATION_UPDATED => Some(Self::ConversationUpdated {
                conversation_id: conversation_id(),
            }),
            AI_THINKING => match data {
                Value::String(step) => Some(Self::AiThinking(step.clone())),
                Value::Null => None,
                other => Some(Self::AiThinking(other.to_string())),
            },
            _ => None,
        }
    }

    /// Parse a socket.io event packet (`42["name", data]`, optionally with a
    /// `/namespace,` prefix) or a plain `{"event": .., "data": ..}` envelope.
    pub fn parse_frame(text: &str) -> Option<Self> {
        if let Some(rest) = text.strip_prefix("42") {
            let payload = match rest.strip_prefix('/') {
                Some(ns) => ns.split_once(',').map(|(_, p)| p)?,
                None => rest,
            };
            // An ack id may sit between the packet type and the array.
            let payload = payload.trim_start_matches(|c: char| c.is_ascii_digit());
            let args: Vec<Value> = serde_json::from_str(payload).ok()?;
            let name = args.first()?.as_str()?;
            let data = args.get(1).cloned().unwrap_or(Value::Null);
            return Self::from_parts(name, &data);
        }

        let envelope: Value = serde_json::from_str(text).ok()?;
        let name = envelope.get("event")?.as_str()?;
        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        Self::from_parts(name, &data)
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            Self::ConversationMessage { conversation_id }
            | Self::ConversationUpdated { conversation_id } => conversation_id.as_deref(),
            Self::AiThinking(_) => None,
        }
    }
}

/// Turn an `http(s)://host` base into the socket.io WebSocket endpoint.
/// `ws://` and `wss://` URLs are used as given.
pub fn socket_io_url(base: &str) -> String {
    if base.starts_with("ws://") || base.starts_with("wss://") {
        return base.to_string();
    }
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        format!("ws://{}", base)
    };
    format!("{}/socket.io/?EIO=4&transport=websocket", ws.trim_end_matches('/'))
}

/// A live socket.io connection forwarding parsed events.
pub struct RealtimeFeed {
    task: JoinHandle<()>,
}

impl RealtimeFeed {
    /// Connect and start forwarding events to `sink`.
    pub async fn connect(url: &str, sink: mpsc::UnboundedSender<RealtimeEvent>) -> ConverseResult<Self> {
        let url = socket_io_url(url);
        let (ws, _resp) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| ConverseError::Transport(format!("realtime connect failed: {}", e)))?;
        info!("📡 Realtime feed connected: {}", url);

        let task = tokio::spawn(async move {
            let (mut write, mut read) = ws.split();
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        debug!("Realtime feed closed by server: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Realtime feed error: {}", e);
                        break;
                    }
                };

                let reply = match text.as_str() {
                    // engine.io open: join the default namespace.
                    t if t.starts_with('0') => Some("40"),
                    "2" => Some("3"),
                    _ => None,
                };
                if let Some(reply) = reply {
                    if write.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                    continue;
                }

                if let Some(event) = RealtimeEvent::parse_frame(&text) {
                    if sink.send(event).is_err() {
                        break;
                    }
                }
            }
            info!("📡 Realtime feed ended");
        });

        Ok(Self { task })
    }

    pub fn close(&self) {
        self.task.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RealtimeFeed {
    fn drop(&mut self) {
        self.task.abort();
    }
}
