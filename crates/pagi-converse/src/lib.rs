//! # PAGI Converse - Voice/Text Session Coordination
//!
//! Arbitrates between a live voice session (streaming transcript fragments and
//! voice-activity scores) and discrete text turns. Exactly one turn is in flight
//! at a time, events that arrive after a session ended are discarded, and the
//! assistant's spoken reply never overlaps microphone capture.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Conversation                          │
//! │  ┌──────────────┐  frames  ┌──────────────┐  fragments/vad     │
//! │  │ Capture      │────────→ │ Event Source │───────────┐        │
//! │  │ (cpal)       │          │ (transport)  │           ↓        │
//! │  └──────────────┘          └──────────────┘   ┌──────────────┐ │
//! │         ↑ mute                                │ Session Mode │ │
//! │  ┌──────────────┐  spoken reply  ┌──────────┐ │  Controller  │ │
//! │  │ Playback     │←───────────────│   Turn   │←└──────────────┘ │
//! │  │ (rodio)      │                │ Submitter│  utterance       │
//! │  └──────────────┘                └──────────┘                  │
//! │                                       ↕ POST /agent/plan       │
//! │   realtime feed (socket.io) ──→ refresh GET /conversation/{id} │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod backend;
pub mod capture;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event_source;
pub mod playback;
pub mod realtime;
pub mod session;
pub mod submitter;
pub mod transcript;
pub mod transport;

pub use backend::{AgentBackend, HttpAgentBackend, PlanRequest, PlanResponse, UploadedImage};
pub use capture::{
    AudioCapturePipeline, AudioChunk, CaptureConfig, CpalMicrophone, FrameSegmenter, FrameSink,
    LiveStream, Microphone, SpectrumAnalyzer, SpectrumFrame, StreamGuard,
};
pub use config::{ConverseConfig, FragmentSubmitPolicy};
pub use conversation::{ConverseEvent, Conversation, MediaSlot};
pub use error::{ConverseError, ConverseResult};
pub use event_source::{OpenOutcome, SourcePhase, TranscriptEventSource};
pub use playback::{AudioOutput, PlaybackController, PlaybackState, RodioOutput};
pub use realtime::{RealtimeEvent, RealtimeFeed};
pub use session::{CaptureGate, SessionEvent, SessionModeController, StartOutcome, VoicePhase};
pub use submitter::{Submission, SubmitReceipt, TurnSubmitter};
pub use transcript::{AttachedMedia, Role, Transcript, Turn, TurnId, UploadState};
pub use transport::{
    FragmentSource, OpenedSession, SessionHandle, SessionRequest, TransportEvent, VoiceTransport,
};

use std::sync::{Mutex, MutexGuard};

/// Lock a std mutex, recovering the data if a previous holder panicked.
/// Guards are never held across an `.await`.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
