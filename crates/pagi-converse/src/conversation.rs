//! The conversation facade: one transcript, one voice controller, one
//! submitter, one playback channel, scoped to a single conversation id.
//!
//! Construct inside a tokio runtime; background tasks route session events to
//! submissions, mute capture while a reply is playing, and apply realtime
//! refreshes.

use crate::backend::AgentBackend;
use crate::capture::{AudioCapturePipeline, CaptureConfig, Microphone, SpectrumFrame};
use crate::config::ConverseConfig;
use crate::error::{ConverseError, ConverseResult};
use crate::event_source::TranscriptEventSource;
use crate::lock;
use crate::playback::{AudioOutput, PlaybackController, PlaybackState};
use crate::realtime::{RealtimeEvent, RealtimeFeed};
use crate::session::{CaptureGate, SessionEvent, SessionModeController, StartOutcome};
use crate::submitter::{Submission, SubmitReceipt, TurnSubmitter};
use crate::transcript::{AttachedMedia, Transcript, Turn, TurnId, UploadState};
use crate::transport::VoiceTransport;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything an embedding UI needs to render.
#[derive(Debug, Clone, PartialEq)]
pub enum ConverseEvent {
    TurnAppended(Turn),
    TurnRolledBack(TurnId),
    TranscriptRefreshed { conversation_id: String, turns: usize },
    /// The conversation view should switch to this id.
    Navigate { conversation_id: String },
    ConversationUpdated { conversation_id: String },
    /// Dismissible, user-facing message.
    Notice(String),
    ThinkingStep { request_id: Uuid, step: String },
    BusyChanged(bool),
    PlaybackChanged(PlaybackState),
    VoiceModeChanged(bool),
    AttachmentChanged(MediaSlot),
}

/// The single image attachment waiting for the next turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MediaSlot {
    #[default]
    Empty,
    Pending { file_name: String },
    Ready(AttachedMedia),
}

struct Shared {
    backend: Arc<dyn AgentBackend>,
    transcript: Arc<Mutex<Transcript>>,
    submitter: TurnSubmitter,
    controller: SessionModeController,
    playback: Arc<PlaybackController>,
    capture: Arc<AudioCapturePipeline>,
    events: broadcast::Sender<ConverseEvent>,
    conversation_id: Mutex<Option<String>>,
    media: Mutex<MediaSlot>,
    upload_seq: AtomicU64,
    refresh_deferred: AtomicBool,
    closed: AtomicBool,
}

pub struct Conversation {
    shared: Arc<Shared>,
    config: ConverseConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    feed: Mutex<Option<RealtimeFeed>>,
}

impl Conversation {
    const EVENT_CAPACITY: usize = 256;

    pub fn new(
        config: ConverseConfig,
        backend: Arc<dyn AgentBackend>,
        transport: Arc<dyn VoiceTransport>,
        microphone: Arc<dyn Microphone>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        let (events, _) = broadcast::channel(Self::EVENT_CAPACITY);
        let transcript = Arc::new(Mutex::new(Transcript::new()));
        let playback = Arc::new(PlaybackController::new(output));
        let submitter = TurnSubmitter::new(
            Arc::clone(&backend),
            Arc::clone(&playback),
            Arc::clone(&transcript),
            events.clone(),
            config.clone(),
        );
        let capture = Arc::new(AudioCapturePipeline::new(
            microphone,
            CaptureConfig {
                sample_rate: config.sample_rate,
                frame_size: config.frame_size,
                fft_size: config.analyzer_fft_size,
            },
        ));
        let gate = CaptureGate::new(playback.subscribe(), submitter.busy_signal());
        let source = Arc::new(TranscriptEventSource::new(transport));
        let (controller, session_rx) =
            SessionModeController::new(source, Arc::clone(&capture), gate, &config);

        let shared = Arc::new(Shared {
            backend,
            transcript,
            submitter,
            controller,
            playback,
            capture,
            events,
            conversation_id: Mutex::new(None),
            media: Mutex::new(MediaSlot::Empty),
            upload_seq: AtomicU64::new(0),
            refresh_deferred: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let tasks = vec![
            tokio::spawn(route_session_events(Arc::clone(&shared), session_rx)),
            tokio::spawn(mute_capture_while_playing(
                Arc::clone(&shared),
                shared.playback.subscribe(),
            )),
        ];

        info!("💬 Conversation ready (backend {})", config.api_base_url);
        Self {
            shared,
            config,
            tasks: Mutex::new(tasks),
            feed: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConverseConfig {
        &self.config
    }

    /// Scope to an existing conversation and load its transcript. Refused
    /// with `Busy` while a reply is pending. Returns the number of turns
    /// fetched; when a submission starts during the fetch, the transcript is
    /// replaced once it settles.
    pub async fn open_conversation(&self, conversation_id: &str) -> ConverseResult<usize> {
        let shared = &self.shared;
        if shared.submitter.is_busy() {
            info!("Cannot switch to {} while a reply is pending", conversation_id);
            return Err(ConverseError::Busy);
        }
        *lock(&shared.conversation_id) = Some(conversation_id.to_string());
        let fetched = shared.backend.fetch_conversation(conversation_id).await;

        let still_scoped = lock(&shared.conversation_id).as_deref() == Some(conversation_id);
        if !still_scoped {
            debug!("Switched away from {} while loading it; dropping result", conversation_id);
            return fetched.map(|turns| turns.len());
        }
        if shared.submitter.is_busy() {
            debug!("Load of {} deferred until the submission settles", conversation_id);
            shared.refresh_deferred.store(true, Ordering::SeqCst);
            return fetched.map(|turns| turns.len());
        }

        match fetched {
            Ok(turns) => {
                let count = turns.len();
                lock(&shared.transcript).replace(turns);
                shared.emit(ConverseEvent::TranscriptRefreshed {
                    conversation_id: conversation_id.to_string(),
                    turns: count,
                });
                Ok(count)
            }
            Err(e) => {
                warn!("Failed to load conversation {}: {}", conversation_id, e);
                lock(&shared.transcript).replace(Vec::new());
                Err(e)
            }
        }
    }

    pub fn conversation_id(&self) -> Option<String> {
        lock(&self.shared.conversation_id).clone()
    }

    pub fn transcript(&self) -> Vec<Turn> {
        lock(&self.shared.transcript).turns().to_vec()
    }

    /// Submit typed text as a turn.
    pub async fn submit_text(&self, text: &str) -> ConverseResult<SubmitReceipt> {
        self.shared.submit(text, false).await
    }

    pub async fn start_voice_session(&self) -> ConverseResult<StartOutcome> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ConverseError::SessionStartFailed("conversation is shut down".to_string()));
        }
        self.shared.controller.start().await
    }

    pub async fn end_voice_session(&self) -> ConverseResult<()> {
        self.shared.controller.end().await
    }

    pub fn voice_mode(&self) -> bool {
        self.shared.controller.voice_mode()
    }

    pub fn controller(&self) -> &SessionModeController {
        &self.shared.controller
    }

    /// Upload an image to ride along with the next turn.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        mime: &str,
    ) -> ConverseResult<AttachedMedia> {
        let shared = &self.shared;
        if !mime.starts_with("image/") {
            let e = ConverseError::UploadFailed(format!("{} is not an image", mime));
            shared.emit(ConverseEvent::Notice(e.to_string()));
            return Err(e);
        }

        let seq = shared.upload_seq.fetch_add(1, Ordering::SeqCst) + 1;
        shared.set_media(MediaSlot::Pending {
            file_name: file_name.to_string(),
        });
        info!("📎 Uploading {} ({} bytes)", file_name, bytes.len());

        let result = shared.backend.upload_image(bytes, file_name, mime).await;
        let current = shared.upload_seq.load(Ordering::SeqCst) == seq;
        match result {
            Ok(uploaded) => {
                let media = AttachedMedia {
                    id: uploaded.id,
                    artifact_id: uploaded.artifact_id,
                    url: uploaded.image_url,
                    upload_state: UploadState::Ready,
                };
                if current {
                    shared.set_media(MediaSlot::Ready(media.clone()));
                }
                Ok(media)
            }
            Err(e) => {
                let e = match e {
                    ConverseError::UploadFailed(_) => e,
                    other => ConverseError::UploadFailed(other.to_string()),
                };
                if current {
                    shared.set_media(MediaSlot::Empty);
                }
                warn!("Image upload failed: {}", e);
                shared.emit(ConverseEvent::Notice(format!("Failed to upload image: {}", e)));
                Err(e)
            }
        }
    }

    pub fn attachment(&self) -> MediaSlot {
        lock(&self.shared.media).clone()
    }

    pub fn clear_attachment(&self) {
        self.shared.upload_seq.fetch_add(1, Ordering::SeqCst);
        self.shared.set_media(MediaSlot::Empty);
    }

    /// True while a submission is outstanding; the input surface should be disabled.
    pub fn is_busy(&self) -> bool {
        self.shared.submitter.is_busy()
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.playback.is_speaking()
    }

    pub fn stop_playback(&self) {
        self.shared.playback.stop();
    }

    pub fn thinking_steps(&self) -> Vec<String> {
        self.shared.submitter.thinking_steps()
    }

    pub fn spectrum(&self) -> watch::Receiver<SpectrumFrame> {
        self.shared.capture.spectrum()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConverseEvent> {
        self.shared.events.subscribe()
    }

    /// Events as a `Stream`; lagged receivers see `Err(Lagged)` items.
    pub fn event_stream(&self) -> BroadcastStream<ConverseEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Apply one realtime push event.
    pub async fn handle_realtime(&self, event: RealtimeEvent) {
        self.shared.handle_realtime(event).await;
    }

    /// Consume realtime events from any producer.
    pub fn attach_realtime(&self, rx: mpsc::UnboundedReceiver<RealtimeEvent>) {
        let task = tokio::spawn(route_realtime_events(Arc::clone(&self.shared), rx));
        lock(&self.tasks).push(task);
    }

    /// Connect the socket.io feed at `realtime_url`, if configured.
    pub async fn connect_realtime(&self) -> ConverseResult<bool> {
        let Some(url) = self.config.realtime_url.clone() else {
            debug!("No realtime_url configured; push events disabled");
            return Ok(false);
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let feed = RealtimeFeed::connect(&url, tx).await?;
        self.attach_realtime(rx);
        if let Some(old) = lock(&self.feed).replace(feed) {
            old.close();
        }
        Ok(true)
    }

    /// End voice mode, stop playback, release capture and stop background
    /// routing. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let first = !self.shared.closed.swap(true, Ordering::SeqCst);
        if let Err(e) = self.shared.controller.end().await {
            warn!("Error ending voice session during shutdown: {}", e);
        }
        self.shared.playback.stop();
        self.shared.capture.release();
        if let Some(feed) = lock(&self.feed).take() {
            feed.close();
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if first {
            info!("👋 Conversation shut down");
        }
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.controller.end_now();
        self.shared.playback.stop();
        if let Some(feed) = lock(&self.feed).take() {
            feed.close();
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl Shared {
    fn emit(&self, event: ConverseEvent) {
        let _ = self.events.send(event);
    }

    fn set_media(&self, slot: MediaSlot) {
        *lock(&self.media) = slot.clone();
        self.emit(ConverseEvent::AttachmentChanged(slot));
    }

    fn take_ready_media(&self) -> Option<AttachedMedia> {
        let taken = {
            let mut slot = lock(&self.media);
            match std::mem::take(&mut *slot) {
                MediaSlot::Ready(media) => Some(media),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if taken.is_some() {
            self.emit(ConverseEvent::AttachmentChanged(MediaSlot::Empty));
        }
        taken
    }

    fn restore_media(&self, media: AttachedMedia) {
        let mut slot = lock(&self.media);
        if *slot == MediaSlot::Empty {
            *slot = MediaSlot::Ready(media);
        }
    }

    async fn submit(&self, text: &str, originated_from_voice: bool) -> ConverseResult<SubmitReceipt> {
        if text.trim().is_empty() {
            return Err(ConverseError::EmptyUtterance);
        }
        if self.submitter.is_busy() {
            info!("Ignoring send while a reply is pending");
            return Err(ConverseError::Busy);
        }

        let media = self.take_ready_media();
        let submission = Submission {
            text: text.to_string(),
            conversation_id: lock(&self.conversation_id).clone(),
            media: media.clone(),
            originated_from_voice,
        };
        let result = self.submitter.submit(submission).await;

        match &result {
            Ok(receipt) => {
                if let Some(id) = &receipt.conversation_id {
                    self.adopt_conversation(id);
                }
            }
            // Lost the race for the in-flight slot; nothing was sent.
            Err(ConverseError::Busy) => {
                if let Some(media) = media {
                    self.restore_media(media);
                }
            }
            Err(_) => {}
        }

        if self.refresh_deferred.swap(false, Ordering::SeqCst) {
            let current = lock(&self.conversation_id).clone();
            if let Some(id) = current {
                debug!("Applying deferred refresh for {}", id);
                self.refresh(&id).await;
            }
        }
        result
    }

    fn adopt_conversation(&self, id: &str) {
        let changed = {
            let mut current = lock(&self.conversation_id);
            let changed = current.as_deref() != Some(id);
            *current = Some(id.to_string());
            changed
        };
        if changed {
            info!("🧭 Conversation is now {}", id);
            self.emit(ConverseEvent::Navigate {
                conversation_id: id.to_string(),
            });
        }
        self.emit(ConverseEvent::ConversationUpdated {
            conversation_id: id.to_string(),
        });
    }

    async fn refresh(&self, conversation_id: &str) {
        if self.submitter.is_busy() {
            debug!("Refresh of {} deferred until the submission settles", conversation_id);
            self.refresh_deferred.store(true, Ordering::SeqCst);
            return;
        }
        let turns = match self.backend.fetch_conversation(conversation_id).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!("Failed to refresh conversation {}: {}", conversation_id, e);
                return;
            }
        };

        let still_scoped = lock(&self.conversation_id).as_deref() == Some(conversation_id);
        if !still_scoped {
            debug!("Conversation changed during refresh of {}; dropping result", conversation_id);
            return;
        }
        if self.submitter.is_busy() {
            self.refresh_deferred.store(true, Ordering::SeqCst);
            return;
        }
        let count = turns.len();
        lock(&self.transcript).replace(turns);
        self.emit(ConverseEvent::TranscriptRefreshed {
            conversation_id: conversation_id.to_string(),
            turns: count,
        });
    }

    async fn handle_realtime(&self, event: RealtimeEvent) {
        match event {
            RealtimeEvent::AiThinking(step) => {
                self.submitter.record_thinking(step);
            }
            other => {
                let scoped = lock(&self.conversation_id).clone();
                match (other.conversation_id(), scoped) {
                    (Some(id), Some(current)) if id == current => self.refresh(&current).await,
                    (id, _) => debug!("Ignoring realtime event for conversation {:?}", id),
                }
            }
        }
    }
}

async fn route_session_events(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            SessionEvent::Utterance(text) => {
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    match shared.submit(&text, true).await {
                        Ok(_) => {}
                        Err(ConverseError::Busy) => {
                            info!("Utterance dropped: a reply is pending");
                            shared.emit(ConverseEvent::Notice(format!(
                                "Still answering your last message; \"{}\" was not sent",
                                text
                            )));
                        }
                        Err(e) => debug!("Voice submission failed: {}", e),
                    }
                });
            }
            SessionEvent::Started(_) => shared.emit(ConverseEvent::VoiceModeChanged(true)),
            SessionEvent::Ended => shared.emit(ConverseEvent::VoiceModeChanged(false)),
            SessionEvent::StartFailed(reason) => {
                shared.emit(ConverseEvent::Notice(format!("Could not start voice mode: {}", reason)));
                shared.emit(ConverseEvent::VoiceModeChanged(false));
            }
            SessionEvent::PauseDetected { pending } => {
                debug!("Pause after: {}", pending);
            }
        }
    }
}

async fn mute_capture_while_playing(shared: Arc<Shared>, mut rx: watch::Receiver<PlaybackState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        shared.capture.set_muted(state == PlaybackState::Playing);
        shared.emit(ConverseEvent::PlaybackChanged(state));
    }
}

async fn route_realtime_events(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<RealtimeEvent>) {
    while let Some(event) = rx.recv().await {
        shared.handle_realtime(event).await;
    }
}
