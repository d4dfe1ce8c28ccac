//! Integration tests for the conversation coordinator
//!
//! Everything external (voice transport, microphone, agent backend, speaker)
//! is scripted in memory, so these run without audio hardware or network.

use async_trait::async_trait;
use pagi_converse::{
    AgentBackend, AudioChunk, AudioOutput, CaptureConfig, ConverseConfig, ConverseError,
    ConverseEvent, ConverseResult, Conversation, FragmentSource, LiveStream, Microphone,
    OpenedSession, PlanRequest, PlanResponse, RealtimeEvent, Role, SessionHandle, SessionRequest,
    StartOutcome, StreamGuard, TransportEvent, Turn, UploadedImage, VoiceTransport,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Scripted collaborators
// ----------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedTransport {
    gate: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    starts: AtomicUsize,
    ends: AtomicUsize,
    frames: AtomicUsize,
    upstream: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl ScriptedTransport {
    fn gated() -> (Arc<Self>, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel();
        let transport = Self {
            gate: tokio::sync::Mutex::new(Some(rx)),
            ..Default::default()
        };
        (Arc::new(transport), tx)
    }

    fn upstream(&self) -> mpsc::UnboundedSender<TransportEvent> {
        self.upstream
            .lock()
            .unwrap()
            .clone()
            .expect("session was opened")
    }

    fn say(&self, text: &str) {
        let _ = self.upstream().send(TransportEvent::Message {
            text: text.to_string(),
            source: FragmentSource::User,
        });
    }
}

#[async_trait]
impl VoiceTransport for ScriptedTransport {
    async fn start(&self, _request: &SessionRequest) -> ConverseResult<OpenedSession> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(rx) = self.gate.lock().await.take() {
            let _ = rx.await;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.upstream.lock().unwrap() = Some(tx);
        Ok(OpenedSession {
            handle: SessionHandle(format!("session-{}", n)),
            events: rx,
        })
    }

    async fn end(&self, _handle: &SessionHandle) -> ConverseResult<()> {
        self.ends.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn send_frame(&self, _handle: &SessionHandle, _frame: &[i16]) -> ConverseResult<()> {
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Counts how often the microphone tracks were stopped.
struct CountingGuard(Arc<AtomicUsize>);

impl StreamGuard for CountingGuard {
    fn stop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct ScriptedMicrophone {
    /// While set, `acquire` waits here like an unanswered permission prompt.
    prompt: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    acquired: AtomicUsize,
    stops: Arc<AtomicUsize>,
    feed: Mutex<Option<mpsc::UnboundedSender<AudioChunk>>>,
}

impl ScriptedMicrophone {
    fn speak_frame(&self, frame_size: usize) {
        if let Some(feed) = self.feed.lock().unwrap().as_ref() {
            let _ = feed.send(AudioChunk {
                samples: vec![0.25; frame_size],
                timestamp: Instant::now(),
            });
        }
    }
}

#[async_trait]
impl Microphone for ScriptedMicrophone {
    async fn acquire(&self, _config: &CaptureConfig) -> ConverseResult<LiveStream> {
        if let Some(prompt) = self.prompt.lock().await.take() {
            let _ = prompt.await;
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        Ok(LiveStream {
            chunks: rx,
            guard: Box::new(CountingGuard(Arc::clone(&self.stops))),
        })
    }
}

struct ScriptedBackend {
    /// While set, the next `plan` call waits for the test to release it.
    hold: tokio::sync::Mutex<Option<oneshot::Receiver<()>>>,
    replies: Mutex<VecDeque<ConverseResult<PlanResponse>>>,
    plans: Mutex<Vec<PlanRequest>>,
    fetches: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn new(replies: Vec<ConverseResult<PlanResponse>>) -> Arc<Self> {
        Arc::new(Self {
            hold: tokio::sync::Mutex::new(None),
            replies: Mutex::new(replies.into()),
            plans: Mutex::new(Vec::new()),
            fetches: Mutex::new(Vec::new()),
        })
    }

    fn plans(&self) -> Vec<PlanRequest> {
        self.plans.lock().unwrap().clone()
    }
}

fn reply(answer: &str, conversation_id: Option<&str>, audio: Option<&str>) -> ConverseResult<PlanResponse> {
    Ok(PlanResponse {
        answer: answer.to_string(),
        conversation_id: conversation_id.map(str::to_string),
        conversation: None,
        audio_path: audio.map(str::to_string),
    })
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn plan(&self, request: &PlanRequest) -> ConverseResult<PlanResponse> {
        self.plans.lock().unwrap().push(request.clone());
        if let Some(hold) = self.hold.lock().await.take() {
            let _ = hold.await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ConverseError::SubmissionFailed("no scripted reply".into())))
    }

    async fn upload_image(&self, bytes: Vec<u8>, _: &str, _: &str) -> ConverseResult<UploadedImage> {
        Ok(UploadedImage {
            id: "img-1".into(),
            artifact_id: "art-1".into(),
            image_url: format!("https://cdn.local/{}.png", bytes.len()),
        })
    }

    async fn fetch_conversation(&self, id: &str) -> ConverseResult<Vec<Turn>> {
        self.fetches.lock().unwrap().push(id.to_string());
        Ok(vec![
            Turn::user("earlier question", false, None),
            Turn::assistant("earlier answer", None),
        ])
    }
}

/// Speaker that keeps every clip playing until the test finishes it.
#[derive(Default)]
struct ScriptedOutput {
    clips: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    finishers: Mutex<Vec<oneshot::Sender<()>>>,
}

impl ScriptedOutput {
    fn finish_current(&self) {
        if let Some(done) = self.finishers.lock().unwrap().pop() {
            self.active.fetch_sub(1, Ordering::SeqCst);
            let _ = done.send(());
        }
    }
}

#[async_trait]
impl AudioOutput for ScriptedOutput {
    async fn start(&self, clip: &str) -> ConverseResult<oneshot::Receiver<()>> {
        self.clips.lock().unwrap().push(clip.to_string());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.finishers.lock().unwrap().push(tx);
        Ok(rx)
    }

    fn stop(&self) {
        if self.finishers.lock().unwrap().pop().is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct Rig {
    conversation: Conversation,
    transport: Arc<ScriptedTransport>,
    microphone: Arc<ScriptedMicrophone>,
    backend: Arc<ScriptedBackend>,
    output: Arc<ScriptedOutput>,
    events: broadcast::Receiver<ConverseEvent>,
}

fn rig_with(transport: Arc<ScriptedTransport>, replies: Vec<ConverseResult<PlanResponse>>) -> Rig {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let config = ConverseConfig {
        api_base_url: "https://agent.local".to_string(),
        agent_id: "agent-test".to_string(),
        ..Default::default()
    };
    let microphone = Arc::new(ScriptedMicrophone::default());
    let backend = ScriptedBackend::new(replies);
    let output = Arc::new(ScriptedOutput::default());
    let conversation = Conversation::new(
        config,
        backend.clone(),
        transport.clone(),
        microphone.clone(),
        output.clone(),
    );
    let events = conversation.subscribe();
    Rig {
        conversation,
        transport,
        microphone,
        backend,
        output,
        events,
    }
}

fn rig(replies: Vec<ConverseResult<PlanResponse>>) -> Rig {
    rig_with(Arc::new(ScriptedTransport::default()), replies)
}

async fn wait_for<F>(events: &mut broadcast::Receiver<ConverseEvent>, mut pred: F) -> ConverseEvent
where
    F: FnMut(&ConverseEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn is_assistant_turn(event: &ConverseEvent) -> bool {
    matches!(event, ConverseEvent::TurnAppended(turn) if turn.role == Role::Assistant)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_voice_fragment_is_submitted_once_and_reply_spoken() {
    let mut rig = rig(vec![reply("Hi there!", Some("c1"), Some("/audio/r1.mp3"))]);

    let outcome = rig.conversation.start_voice_session().await.unwrap();
    assert_eq!(outcome, StartOutcome::Started);
    assert!(rig.conversation.voice_mode());

    rig.transport.say("hello");
    wait_for(&mut rig.events, is_assistant_turn).await;

    let plans = rig.backend.plans();
    assert_eq!(plans.len(), 1);
    assert_eq!(plans[0].message, "hello");
    assert_eq!(plans[0].is_voice_mode, Some(true));

    wait_for(&mut rig.events, |e| {
        matches!(e, ConverseEvent::PlaybackChanged(pagi_converse::PlaybackState::Playing))
    })
    .await;
    assert!(rig.conversation.is_speaking());
    assert_eq!(
        *rig.output.clips.lock().unwrap(),
        vec!["https://agent.local/audio/r1.mp3".to_string()]
    );

    let transcript = rig.conversation.transcript();
    assert_eq!(transcript.len(), 2);
    assert!(transcript[0].originated_from_voice);
    assert_eq!(transcript[1].text, "Hi there!");
}

#[tokio::test]
async fn test_capture_is_muted_while_reply_plays() {
    let mut rig = rig(vec![reply("Sure.", Some("c1"), Some("/audio/r1.mp3"))]);
    let frame_size = rig.conversation.config().frame_size;
    rig.conversation.start_voice_session().await.unwrap();

    rig.microphone.speak_frame(frame_size);
    settle().await;
    assert_eq!(rig.transport.frames.load(Ordering::SeqCst), 1);

    rig.transport.say("what's next?");
    wait_for(&mut rig.events, |e| {
        matches!(e, ConverseEvent::PlaybackChanged(pagi_converse::PlaybackState::Playing))
    })
    .await;

    rig.microphone.speak_frame(frame_size);
    settle().await;
    assert_eq!(rig.transport.frames.load(Ordering::SeqCst), 1, "assistant voice leaked into capture");

    rig.output.finish_current();
    wait_for(&mut rig.events, |e| {
        matches!(e, ConverseEvent::PlaybackChanged(pagi_converse::PlaybackState::Idle))
    })
    .await;
    rig.microphone.speak_frame(frame_size);
    settle().await;
    assert_eq!(rig.transport.frames.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_end_before_open_resolves_never_records() {
    let (transport, release) = ScriptedTransport::gated();
    let rig = rig_with(transport, vec![]);

    let mut starting = tokio_test::task::spawn(rig.conversation.start_voice_session());
    tokio_test::assert_pending!(starting.poll());
    assert!(rig.conversation.voice_mode());

    rig.conversation.end_voice_session().await.unwrap();
    assert!(!rig.conversation.voice_mode());

    release.send(()).unwrap();
    let outcome = tokio_test::assert_ready!(starting.poll()).unwrap();
    assert_eq!(outcome, StartOutcome::Cancelled);
    drop(starting);

    assert_eq!(rig.transport.ends.load(Ordering::SeqCst), 1);
    assert_eq!(rig.microphone.acquired.load(Ordering::SeqCst), 0);

    rig.transport.say("spoken into a dead session");
    settle().await;
    assert!(rig.backend.plans().is_empty());
    assert!(rig.conversation.transcript().is_empty());
}

#[tokio::test]
async fn test_fragments_after_end_do_not_touch_transcript() {
    let rig = rig(vec![reply("unused", None, None)]);
    rig.conversation.start_voice_session().await.unwrap();
    let upstream = rig.transport.upstream();

    rig.conversation.end_voice_session().await.unwrap();
    let _ = upstream.send(TransportEvent::Message {
        text: "late fragment".into(),
        source: FragmentSource::User,
    });
    let _ = upstream.send(TransportEvent::VadScore { score: 0.01 });
    settle().await;

    assert!(rig.conversation.transcript().is_empty());
    assert!(rig.backend.plans().is_empty());
}

#[tokio::test]
async fn test_start_and_end_are_idempotent() {
    let rig = rig(vec![]);
    let c = &rig.conversation;

    c.end_voice_session().await.unwrap();
    assert_eq!(c.start_voice_session().await.unwrap(), StartOutcome::Started);
    assert_eq!(c.start_voice_session().await.unwrap(), StartOutcome::AlreadyActive);
    c.end_voice_session().await.unwrap();
    c.end_voice_session().await.unwrap();

    assert!(!c.voice_mode());
    assert_eq!(rig.transport.starts.load(Ordering::SeqCst), 1);
    assert_eq!(rig.transport.ends.load(Ordering::SeqCst), 1);
    assert_eq!(rig.microphone.acquired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_new_conversation_id_is_adopted_and_scopes_refreshes() {
    let mut rig = rig(vec![
        reply("First answer", Some("c1"), None),
        reply("Second answer", Some("c1"), None),
    ]);
    assert_eq!(rig.conversation.conversation_id(), None);

    rig.conversation.submit_text("start a plan").await.unwrap();
    let nav = wait_for(&mut rig.events, |e| matches!(e, ConverseEvent::Navigate { .. })).await;
    assert_eq!(nav, ConverseEvent::Navigate { conversation_id: "c1".into() });
    assert_eq!(rig.conversation.conversation_id().as_deref(), Some("c1"));

    rig.conversation.submit_text("continue").await.unwrap();
    let plans = rig.backend.plans();
    assert_eq!(plans[0].conversation_id, None);
    assert_eq!(plans[1].conversation_id.as_deref(), Some("c1"));

    rig.conversation
        .handle_realtime(RealtimeEvent::ConversationMessage {
            conversation_id: Some("c1".into()),
        })
        .await;
    assert_eq!(*rig.backend.fetches.lock().unwrap(), vec!["c1".to_string()]);
    assert_eq!(rig.conversation.transcript()[0].text, "earlier question");
}

#[tokio::test]
async fn test_failed_submission_rolls_back_exactly() {
    let mut rig = rig(vec![Err(ConverseError::SubmissionFailed("503".into()))]);
    rig.conversation.open_conversation("c7").await.unwrap();
    let before = rig.conversation.transcript();

    rig.conversation
        .upload_image(vec![7; 16], "chart.png", "image/png")
        .await
        .unwrap();
    let err = rig.conversation.submit_text("explain the chart").await.unwrap_err();
    assert!(matches!(err, ConverseError::SubmissionFailed(_)));

    assert_eq!(rig.conversation.transcript(), before);
    // The attachment is not offered again after a failed send.
    assert_eq!(rig.conversation.attachment(), pagi_converse::MediaSlot::Empty);
    wait_for(&mut rig.events, |e| matches!(e, ConverseEvent::Notice(_))).await;
    assert!(!rig.conversation.is_busy());
}

#[tokio::test]
async fn test_pause_clears_pending_without_extra_submission() {
    let mut rig = rig(vec![reply("Noted.", None, None)]);
    rig.conversation.start_voice_session().await.unwrap();

    rig.transport.say("partial text");
    let _ = rig.transport.upstream().send(TransportEvent::VadScore { score: 0.05 });
    wait_for(&mut rig.events, is_assistant_turn).await;
    settle().await;

    assert_eq!(rig.conversation.controller().pending_utterance(), None);
    assert_eq!(rig.backend.plans().len(), 1);
}

#[tokio::test]
async fn test_only_one_clip_plays_at_a_time() {
    let mut rig = rig(vec![
        reply("One", Some("c1"), Some("/audio/1.mp3")),
        reply("Two", Some("c1"), Some("/audio/2.mp3")),
    ]);
    rig.conversation.start_voice_session().await.unwrap();

    rig.transport.say("first");
    wait_for(&mut rig.events, is_assistant_turn).await;
    wait_for(&mut rig.events, |e| {
        matches!(e, ConverseEvent::PlaybackChanged(pagi_converse::PlaybackState::Playing))
    })
    .await;

    rig.transport.say("second");
    wait_for(&mut rig.events, is_assistant_turn).await;
    settle().await;

    assert_eq!(rig.output.clips.lock().unwrap().len(), 2);
    assert_eq!(rig.output.max_active.load(Ordering::SeqCst), 1);
    assert!(rig.conversation.is_speaking());
}

#[tokio::test]
async fn test_start_is_a_no_op_while_reply_plays() {
    let mut rig = rig(vec![reply("Listen.", Some("c1"), Some("/audio/r.mp3"))]);
    rig.conversation.start_voice_session().await.unwrap();
    rig.transport.say("read it to me");
    wait_for(&mut rig.events, |e| {
        matches!(e, ConverseEvent::PlaybackChanged(pagi_converse::PlaybackState::Playing))
    })
    .await;

    rig.conversation.end_voice_session().await.unwrap();
    assert_eq!(
        rig.conversation.start_voice_session().await.unwrap(),
        StartOutcome::CaptureDisabled
    );
    assert!(!rig.conversation.voice_mode());

    rig.conversation.stop_playback();
    assert_eq!(
        rig.conversation.start_voice_session().await.unwrap(),
        StartOutcome::Started
    );
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let rig = rig(vec![]);
    rig.conversation.start_voice_session().await.unwrap();
    rig.conversation.shutdown().await;
    rig.conversation.shutdown().await;

    assert!(!rig.conversation.voice_mode());
    assert!(!rig.conversation.is_speaking());
    assert_eq!(rig.transport.ends.load(Ordering::SeqCst), 1);
}

fn texts(conversation: &Conversation) -> Vec<String> {
    conversation.transcript().into_iter().map(|t| t.text).collect()
}

#[tokio::test]
async fn test_restart_during_microphone_prompt_keeps_new_session() {
    let rig = rig(vec![]);
    let frame_size = rig.conversation.config().frame_size;
    let (grant, prompt) = oneshot::channel();
    *rig.microphone.prompt.lock().await = Some(prompt);

    let mut first = tokio_test::task::spawn(rig.conversation.start_voice_session());
    tokio_test::assert_pending!(first.poll());
    assert_eq!(rig.transport.starts.load(Ordering::SeqCst), 1);

    rig.conversation.end_voice_session().await.unwrap();
    assert_eq!(
        rig.conversation.start_voice_session().await.unwrap(),
        StartOutcome::PreviousClosing
    );

    grant.send(()).unwrap();
    let outcome = tokio_test::assert_ready!(first.poll()).unwrap();
    assert_eq!(outcome, StartOutcome::Cancelled);
    drop(first);
    assert_eq!(rig.microphone.stops.load(Ordering::SeqCst), 1);

    assert_eq!(
        rig.conversation.start_voice_session().await.unwrap(),
        StartOutcome::Started
    );
    assert!(rig.conversation.voice_mode());
    assert_eq!(rig.transport.starts.load(Ordering::SeqCst), 2);
    assert_eq!(rig.transport.ends.load(Ordering::SeqCst), 1);
    assert_eq!(rig.microphone.acquired.load(Ordering::SeqCst), 2);
    assert_eq!(rig.microphone.stops.load(Ordering::SeqCst), 1);

    rig.microphone.speak_frame(frame_size);
    settle().await;
    assert_eq!(rig.transport.frames.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropping_conversation_releases_microphone_and_session() {
    let rig = rig(vec![]);
    assert_eq!(
        rig.conversation.start_voice_session().await.unwrap(),
        StartOutcome::Started
    );
    let Rig {
        conversation,
        transport,
        microphone,
        ..
    } = rig;

    drop(conversation);
    settle().await;

    assert_eq!(microphone.stops.load(Ordering::SeqCst), 1);
    assert_eq!(transport.ends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_switching_conversation_waits_for_pending_reply() {
    let rig = rig(vec![reply("Booked.", Some("c1"), None)]);
    let (release, hold) = oneshot::channel();
    *rig.backend.hold.lock().await = Some(hold);

    let mut sending = tokio_test::task::spawn(rig.conversation.submit_text("book a table"));
    tokio_test::assert_pending!(sending.poll());
    assert!(rig.conversation.is_busy());

    let err = rig.conversation.open_conversation("c2").await.unwrap_err();
    assert!(matches!(err, ConverseError::Busy));
    assert!(rig.backend.fetches.lock().unwrap().is_empty());
    assert_eq!(texts(&rig.conversation), vec!["book a table"]);

    release.send(()).unwrap();
    tokio_test::assert_ready!(sending.poll()).unwrap();
    drop(sending);
    assert_eq!(rig.conversation.conversation_id().as_deref(), Some("c1"));
    assert_eq!(texts(&rig.conversation), vec!["book a table", "Booked."]);

    assert_eq!(rig.conversation.open_conversation("c2").await.unwrap(), 2);
    assert_eq!(rig.conversation.conversation_id().as_deref(), Some("c2"));
    assert_eq!(texts(&rig.conversation), vec!["earlier question", "earlier answer"]);
}
