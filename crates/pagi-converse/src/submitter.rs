//! **Turn Submitter**: optimistic append, backend request, rollback on failure.
//!
//! At most one submission is outstanding. While it is, `ai-thinking` steps are
//! collected under the request's correlation id; they are cleared and the busy
//! flag dropped on every exit path when the submission settles.

use crate::backend::{AgentBackend, PlanRequest};
use crate::config::ConverseConfig;
use crate::conversation::ConverseEvent;
use crate::error::{ConverseError, ConverseResult};
use crate::lock;
use crate::playback::PlaybackController;
use crate::transcript::{AttachedMedia, Transcript, Turn, TurnId};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One outgoing user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub text: String,
    pub conversation_id: Option<String>,
    pub media: Option<AttachedMedia>,
    pub originated_from_voice: bool,
}

impl Submission {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            conversation_id: None,
            media: None,
            originated_from_voice: false,
        }
    }

    pub fn voice(text: impl Into<String>) -> Self {
        Self {
            originated_from_voice: true,
            ..Self::text(text)
        }
    }
}

/// What a successful submission produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitReceipt {
    pub request_id: Uuid,
    pub user_turn: TurnId,
    pub assistant_turn: TurnId,
    /// Conversation id reported by the backend, if any.
    pub conversation_id: Option<String>,
    /// Resolved spoken-reply URL handed to playback.
    pub spoken_reply: Option<String>,
    pub spoke: bool,
}

#[derive(Debug, Default)]
struct ThinkingLog {
    request: Option<Uuid>,
    steps: Vec<String>,
}

pub struct TurnSubmitter {
    backend: Arc<dyn AgentBackend>,
    playback: Arc<PlaybackController>,
    transcript: Arc<Mutex<Transcript>>,
    events: broadcast::Sender<ConverseEvent>,
    busy: watch::Sender<bool>,
    thinking: Mutex<ThinkingLog>,
    config: ConverseConfig,
    timeout: Duration,
}

/// Held for the lifetime of one submission; releases the busy flag on drop.
struct InFlight<'a> {
    submitter: &'a TurnSubmitter,
    request_id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        {
            let mut log = lock(&self.submitter.thinking);
            if log.request == Some(self.request_id) {
                log.request = None;
                log.steps.clear();
            }
        }
        self.submitter.busy.send_replace(false);
        let _ = self.submitter.events.send(ConverseEvent::BusyChanged(false));
        debug!("Submission {} settled", self.request_id);
    }
}

impl TurnSubmitter {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        playback: Arc<PlaybackController>,
        transcript: Arc<Mutex<Transcript>>,
        events: broadcast::Sender<ConverseEvent>,
        config: ConverseConfig,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        let timeout = config.submit_timeout();
        Self {
            backend,
            playback,
            transcript,
            events,
            busy,
            thinking: Mutex::new(ThinkingLog::default()),
            config,
            timeout,
        }
    }

    /// Override the backend deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.borrow()
    }

    pub fn busy_signal(&self) -> watch::Receiver<bool> {
        self.busy.subscribe()
    }

    /// Append a thinking step to the outstanding submission's log.
    /// Dropped when nothing is in flight.
    pub fn record_thinking(&self, step: String) -> bool {
        let request_id = {
            let mut log = lock(&self.thinking);
            let Some(request_id) = log.request else {
                debug!("Thinking step with no submission in flight: {}", step);
                return false;
            };
            log.steps.push(step.clone());
            request_id
        };
        let _ = self.events.send(ConverseEvent::ThinkingStep { request_id, step });
        true
    }

    pub fn thinking_steps(&self) -> Vec<String> {
        lock(&self.thinking).steps.clone()
    }

    fn begin(&self) -> ConverseResult<InFlight<'_>> {
        let acquired = self.busy.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        if !acquired {
            return Err(ConverseError::Busy);
        }
        let request_id = Uuid::new_v4();
        *lock(&self.thinking) = ThinkingLog {
            request: Some(request_id),
            steps: Vec::new(),
        };
        let _ = self.events.send(ConverseEvent::BusyChanged(true));
        Ok(InFlight {
            submitter: self,
            request_id,
        })
    }

    /// Submit one user turn.
    pub async fn submit(&self, submission: Submission) -> ConverseResult<SubmitReceipt> {
        let text = submission.text.trim();
        if text.is_empty() {
            return Err(ConverseError::EmptyUtterance);
        }
        let in_flight = match self.begin() {
            Ok(in_flight) => in_flight,
            Err(e) => {
                info!("Submission refused: another turn is in flight");
                return Err(e);
            }
        };
        let request_id = in_flight.request_id;
        let voice = submission.originated_from_voice;

        let user_turn = Turn::user(text, voice, submission.media.clone());
        let user_id = user_turn.id.clone();
        lock(&self.transcript).append(user_turn.clone());
        let _ = self.events.send(ConverseEvent::TurnAppended(user_turn));
        info!("📤 Submitting turn {} (voice: {}, request {})", user_id, voice, request_id);

        let request = PlanRequest {
            message: text.to_string(),
            conversation_id: submission.conversation_id.clone(),
            artifact_id: submission.media.as_ref().map(|m| m.artifact_id.clone()),
            is_voice_mode: voice.then_some(true),
        };

        let outcome = match tokio::time::timeout(self.timeout, self.backend.plan(&request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e @ ConverseError::SubmissionFailed(_))) => Err(e),
            Ok(Err(e)) => Err(ConverseError::SubmissionFailed(e.to_string())),
            Err(_) => Err(ConverseError::Timeout(self.timeout)),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                let removed = lock(&self.transcript).remove(&user_id).is_some();
                if removed {
                    let _ = self.events.send(ConverseEvent::TurnRolledBack(user_id.clone()));
                }
                warn!("Submission {} failed, rolled back {}: {}", request_id, user_id, e);
                let _ = self.events.send(ConverseEvent::Notice(format!(
                    "Failed to send message: {}",
                    e
                )));
                return Err(e);
            }
        };

        let spoken_reply = response
            .audio_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(|p| self.config.resolve_url(p));
        let assistant = Turn::assistant(response.answer.clone(), response.audio_path.clone());
        let assistant_id = assistant.id.clone();
        lock(&self.transcript).append(assistant.clone());
        let _ = self.events.send(ConverseEvent::TurnAppended(assistant));
        info!("📥 Reply received for {} (spoken: {})", user_id, spoken_reply.is_some());

        // Settle before playback: the input surface is free again once the reply is in.
        drop(in_flight);

        let mut spoke = false;
        if voice {
            if let Some(clip) = &spoken_reply {
                match self.playback.play(clip).await {
                    Ok(()) => spoke = true,
                    Err(e) => {
                        let _ = self.events.send(ConverseEvent::Notice(format!(
                            "Could not play spoken reply: {}",
                            e
                        )));
                    }
                }
            }
        }

        Ok(SubmitReceipt {
            request_id,
            user_turn: user_id,
            assistant_turn: assistant_id,
            conversation_id: response.resolved_conversation_id().map(str::to_string),
            spoken_reply,
            spoke,
        })
    }
}
