//! The realtime voice-session transport seam.
//!
//! The coordinator never talks to a vendor SDK directly; it opens an opaque
//! session through [`VoiceTransport`], receives `message`/`vadScore` callbacks
//! as [`TransportEvent`]s on a channel, and pushes microphone frames back.

use crate::error::ConverseResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Who produced a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentSource {
    User,
    #[serde(alias = "ai", alias = "agent")]
    System,
}

/// Events pushed by an open voice session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A piece of transcribed speech.
    Message { text: String, source: FragmentSource },
    /// Voice-activity score, 0.0 (silence) to 1.0 (speech).
    VadScore { score: f32 },
}

/// Opaque handle of an open voice session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub String);

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parameters for opening a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub agent_id: String,
    pub connection_mode: String,
}

/// An established session: its handle plus the callback stream.
pub struct OpenedSession {
    pub handle: SessionHandle,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// A realtime voice-session provider.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Open a session. Resolves once the handshake completes.
    async fn start(&self, request: &SessionRequest) -> ConverseResult<OpenedSession>;

    /// Close a session. Must tolerate handles that are already closed.
    async fn end(&self, handle: &SessionHandle) -> ConverseResult<()>;

    /// Forward one microphone frame (16-bit PCM, mono) to the session.
    fn send_frame(&self, handle: &SessionHandle, frame: &[i16]) -> ConverseResult<()>;
}
