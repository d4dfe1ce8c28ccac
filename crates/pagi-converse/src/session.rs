//! **Session Mode Controller**: the single owner of "are we in voice mode".
//!
//! Voice mode is the phase of one state machine (`Closed | Opening | Open`);
//! nothing outside this module can set it. Every transition flips the phase
//! synchronously before the matching async effect (session open/close,
//! microphone acquire/release) is requested, and every resumption after an
//! `.await` rechecks the phase before acting. Transport events carry the epoch
//! of the session that produced them and are dropped once that epoch is over.
//!
//! ```text
//!   start()                     open ok + mic ok
//! Closed ───────→ Opening{epoch} ─────────────────→ Open{epoch}
//!   ↑                  │ end() / open failed / mic denied   │
//!   └──────────────────┴────────────────────────────────────┘ end()
//! ```

use crate::capture::AudioCapturePipeline;
use crate::config::{ConverseConfig, FragmentSubmitPolicy};
use crate::error::ConverseResult;
use crate::event_source::{OpenOutcome, SourcePhase, TranscriptEventSource};
use crate::lock;
use crate::playback::PlaybackState;
use crate::transport::{FragmentSource, SessionHandle, SessionRequest, TransportEvent};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Externally visible voice-mode phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicePhase {
    Closed,
    Opening,
    Open,
}

/// The live session while voice mode is `Open`.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSession {
    pub handle: SessionHandle,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Opening { epoch: u64 },
    Open { epoch: u64, session: VoiceSession },
}

/// Emitted towards the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started(SessionHandle),
    Ended,
    StartFailed(String),
    /// A finished user utterance to submit as a voice-originated turn.
    Utterance(String),
    /// Activity fell below the silence threshold; the pending text was dropped.
    PauseDetected { pending: String },
}

/// How a `start` call settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
    /// Playback or an outstanding submission holds capture off.
    CaptureDisabled,
    /// The previous session, or an earlier `start` that `end` cancelled, is
    /// still unwinding.
    PreviousClosing,
    /// `end` was called before the session finished opening.
    Cancelled,
}

/// Whether the microphone may be opened right now: not while the assistant is
/// speaking and not while a submission is outstanding.
#[derive(Clone)]
pub struct CaptureGate {
    playback: watch::Receiver<PlaybackState>,
    busy: watch::Receiver<bool>,
}

impl CaptureGate {
    pub fn new(playback: watch::Receiver<PlaybackState>, busy: watch::Receiver<bool>) -> Self {
        Self { playback, busy }
    }

    /// A gate that never closes.
    pub fn always_open() -> Self {
        let (_, playback) = watch::channel(PlaybackState::Idle);
        let (_, busy) = watch::channel(false);
        Self { playback, busy }
    }

    pub fn is_open(&self) -> bool {
        *self.playback.borrow() != PlaybackState::Playing && !*self.busy.borrow()
    }
}

struct Inner {
    phase: Phase,
    pending: Option<String>,
    epoch: u64,
    // Set while a `start` future is running, cancelled or not. Capture and
    // source are shared, so only one start may touch them at a time.
    starting: bool,
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        match self.phase {
            Phase::Closed => false,
            Phase::Opening { epoch: e } | Phase::Open { epoch: e, .. } => e == epoch,
        }
    }

    fn close(&mut self) -> bool {
        let was_active = !matches!(self.phase, Phase::Closed);
        self.phase = Phase::Closed;
        self.pending = None;
        was_active
    }
}

/// Clears `starting` when a `start` future finishes or is dropped, and reverts
/// a phase left in `Opening` by a dropped future.
struct StartInProgress {
    inner: Arc<Mutex<Inner>>,
    epoch: u64,
}

impl Drop for StartInProgress {
    fn drop(&mut self) {
        let mut inner = lock(&self.inner);
        inner.starting = false;
        if matches!(inner.phase, Phase::Opening { epoch } if epoch == self.epoch) {
            inner.close();
        }
    }
}

#[derive(Clone)]
pub struct SessionModeController {
    inner: Arc<Mutex<Inner>>,
    source: Arc<TranscriptEventSource>,
    capture: Arc<AudioCapturePipeline>,
    gate: CaptureGate,
    events: mpsc::UnboundedSender<SessionEvent>,
    request: SessionRequest,
    silence_threshold: f32,
    policy: FragmentSubmitPolicy,
    pump: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SessionModeController {
    pub fn new(
        source: Arc<TranscriptEventSource>,
        capture: Arc<AudioCapturePipeline>,
        gate: CaptureGate,
        config: &ConverseConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = Self {
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Closed,
                pending: None,
                epoch: 0,
                starting: false,
            })),
            source,
            capture,
            gate,
            events,
            request: SessionRequest {
                agent_id: config.agent_id.clone(),
                connection_mode: config.connection_mode.clone(),
            },
            silence_threshold: config.silence_threshold,
            policy: config.fragment_submit_policy,
            pump: Arc::new(Mutex::new(None)),
        };
        (controller, rx)
    }

    pub fn voice_mode(&self) -> bool {
        !matches!(lock(&self.inner).phase, Phase::Closed)
    }

    pub fn phase(&self) -> VoicePhase {
        match lock(&self.inner).phase {
            Phase::Closed => VoicePhase::Closed,
            Phase::Opening { .. } => VoicePhase::Opening,
            Phase::Open { .. } => VoicePhase::Open,
        }
    }

    pub fn session(&self) -> Option<VoiceSession> {
        match &lock(&self.inner).phase {
            Phase::Open { session, .. } => Some(session.clone()),
            _ => None,
        }
    }

    pub fn pending_utterance(&self) -> Option<String> {
        lock(&self.inner).pending.clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Enter voice mode: open the session, then start capture.
    pub async fn start(&self) -> ConverseResult<StartOutcome> {
        let in_progress = {
            let mut inner = lock(&self.inner);
            if !matches!(inner.phase, Phase::Closed) {
                info!("Voice session already active; start ignored");
                return Ok(StartOutcome::AlreadyActive);
            }
            if !self.gate.is_open() {
                info!("Capture disabled (playback or submission in progress); start ignored");
                return Ok(StartOutcome::CaptureDisabled);
            }
            if inner.starting || self.source.phase() != SourcePhase::Closed {
                info!("Previous voice session still closing; start ignored");
                return Ok(StartOutcome::PreviousClosing);
            }
            inner.epoch += 1;
            inner.phase = Phase::Opening { epoch: inner.epoch };
            inner.pending = None;
            inner.starting = true;
            StartInProgress {
                inner: Arc::clone(&self.inner),
                epoch: inner.epoch,
            }
        };
        let epoch = in_progress.epoch;
        info!("🎙️ Voice mode on; opening session (epoch {})", epoch);

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = match self.source.open(&self.request, tx).await {
            Ok(OpenOutcome::Opened(handle)) => handle,
            Ok(OpenOutcome::Cancelled) => {
                info!("Voice session cancelled during handshake");
                return Ok(StartOutcome::Cancelled);
            }
            Err(e) => {
                self.revert(epoch);
                warn!("Voice session failed to start: {}", e);
                self.emit(SessionEvent::StartFailed(e.to_string()));
                return Err(e);
            }
        };

        let current = lock(&self.inner).is_current(epoch);
        if !current {
            // end() may have raced the handshake before the source saw it.
            info!("Voice mode ended while opening; closing session {}", handle);
            self.source.close().await?;
            return Ok(StartOutcome::Cancelled);
        }

        let pump = {
            let controller = self.clone();
            tokio::spawn(async move { controller.pump(epoch, rx).await })
        };
        if let Some(old) = lock(&self.pump).replace(pump) {
            old.abort();
        }

        let Some(sink) = self.source.frame_sink() else {
            self.revert(epoch);
            return Ok(StartOutcome::Cancelled);
        };
        if let Err(e) = self.capture.start(sink).await {
            self.revert(epoch);
            warn!("Microphone unavailable, leaving voice mode: {}", e);
            if let Err(close_err) = self.source.close().await {
                warn!("Failed to close session after capture error: {}", close_err);
            }
            self.emit(SessionEvent::StartFailed(e.to_string()));
            return Err(e);
        }

        let opened = {
            let mut inner = lock(&self.inner);
            if inner.is_current(epoch) {
                inner.phase = Phase::Open {
                    epoch,
                    session: VoiceSession {
                        handle: handle.clone(),
                        started_at: Utc::now(),
                    },
                };
                true
            } else {
                false
            }
        };
        if !opened {
            info!("Voice mode ended while acquiring the microphone; releasing");
            self.capture.release();
            self.source.close().await?;
            return Ok(StartOutcome::Cancelled);
        }

        info!("✅ Voice session open ({})", handle);
        self.emit(SessionEvent::Started(handle));
        Ok(StartOutcome::Started)
    }

    fn revert(&self, epoch: u64) {
        let mut inner = lock(&self.inner);
        if inner.is_current(epoch) {
            inner.close();
        }
    }

    /// Leave voice mode. Safe to call repeatedly or when nothing is active.
    pub async fn end(&self) -> ConverseResult<()> {
        let was_active = lock(&self.inner).close();
        if !was_active {
            debug!("Voice session end: nothing active");
        }

        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.capture.release();
        let closed = self.source.close().await;

        if was_active {
            info!("🔇 Voice mode off");
            self.emit(SessionEvent::Ended);
        }
        closed
    }

    /// Leave voice mode without awaiting, for teardown from `Drop`. The
    /// microphone is released at once; the remote session is ended on the
    /// current runtime when there is one.
    pub fn end_now(&self) {
        let was_active = lock(&self.inner).close();
        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }
        self.capture.release();

        if self.source.phase() != SourcePhase::Closed {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    let source = Arc::clone(&self.source);
                    runtime.spawn(async move {
                        if let Err(e) = source.close().await {
                            warn!("Failed to end voice session on teardown: {}", e);
                        }
                    });
                }
                Err(_) => warn!("No runtime available; voice session left to the transport"),
            }
        }

        if was_active {
            info!("🔇 Voice mode off (teardown)");
            self.emit(SessionEvent::Ended);
        }
    }

    async fn pump(&self, epoch: u64, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            let current = lock(&self.inner).is_current(epoch);
            if !current {
                debug!("Dropping event from ended session (epoch {})", epoch);
                continue;
            }
            match event {
                TransportEvent::Message { text, source } => {
                    self.on_fragment(&text, source);
                }
                TransportEvent::VadScore { score } => self.on_activity_score(score),
            }
        }
    }

    /// Handle one transcript fragment. Returns true when it produced an utterance.
    pub fn on_fragment(&self, text: &str, source: FragmentSource) -> bool {
        let utterance = {
            let mut inner = lock(&self.inner);
            if matches!(inner.phase, Phase::Closed) {
                debug!("Discarding fragment after voice mode ended");
                return false;
            }
            if source != FragmentSource::User {
                debug!("Ignoring {:?} fragment", source);
                return false;
            }
            let text = text.trim();
            if text.is_empty() {
                return false;
            }
            match self.policy {
                FragmentSubmitPolicy::EachFragment => {
                    inner.pending = Some(text.to_string());
                    Some(text.to_string())
                }
                FragmentSubmitPolicy::DebounceUntilSilence => {
                    let pending = inner.pending.get_or_insert_with(String::new);
                    if !pending.is_empty() {
                        pending.push(' ');
                    }
                    pending.push_str(text);
                    None
                }
            }
        };

        match utterance {
            Some(text) => {
                info!("🗣️ User utterance: {}", text);
                self.emit(SessionEvent::Utterance(text));
                true
            }
            None => false,
        }
    }

    /// Handle one voice-activity score.
    pub fn on_activity_score(&self, score: f32) {
        let pending = {
            let mut inner = lock(&self.inner);
            if matches!(inner.phase, Phase::Closed) {
                return;
            }
            if score >= self.silence_threshold {
                return;
            }
            match inner.pending.take() {
                Some(pending) => pending,
                None => return,
            }
        };

        match self.policy {
            FragmentSubmitPolicy::EachFragment => {
                info!("⏸️ Pause detected (score {:.2}); clearing pending utterance", score);
                self.emit(SessionEvent::PauseDetected { pending });
            }
            FragmentSubmitPolicy::DebounceUntilSilence => {
                info!("⏸️ Pause detected (score {:.2}); submitting: {}", score, pending);
                self.emit(SessionEvent::Utterance(pending));
            }
        }
    }
}

impl std::fmt::Debug for SessionModeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionModeController")
            .field("phase", &self.phase())
            .field("policy", &self.policy)
            .finish()
    }
}
