//! **Transcript Event Source**: wraps a [`VoiceTransport`] session in a
//! `Closed → Opening → Open → Closed` state machine.
//!
//! A close requested while the handshake is still in flight is deferred: once
//! the open settles the session is ended immediately, so no session is ever
//! left dangling. Fragment and activity events are forwarded only while `Open`.

use crate::capture::FrameSink;
use crate::error::{ConverseError, ConverseResult};
use crate::lock;
use crate::transport::{SessionHandle, SessionRequest, TransportEvent, VoiceTransport};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourcePhase {
    Closed,
    Opening,
    Open,
}

/// How an `open` call settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    Opened(SessionHandle),
    /// A close arrived during the handshake; the session was ended as soon as it opened.
    Cancelled,
}

#[derive(Debug)]
struct SourceState {
    phase: SourcePhase,
    handle: Option<SessionHandle>,
    close_requested: bool,
    // Bumped on every open/close so a stale pump stops forwarding.
    generation: u64,
}

pub struct TranscriptEventSource {
    transport: Arc<dyn VoiceTransport>,
    state: Arc<Mutex<SourceState>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl TranscriptEventSource {
    pub fn new(transport: Arc<dyn VoiceTransport>) -> Self {
        Self {
            transport,
            state: Arc::new(Mutex::new(SourceState {
                phase: SourcePhase::Closed,
                handle: None,
                close_requested: false,
                generation: 0,
            })),
            pump: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SourcePhase {
        lock(&self.state).phase
    }

    pub fn handle(&self) -> Option<SessionHandle> {
        lock(&self.state).handle.clone()
    }

    /// Open a session and forward its events to `sink` while it stays open.
    pub async fn open(
        &self,
        request: &SessionRequest,
        sink: mpsc::UnboundedSender<TransportEvent>,
    ) -> ConverseResult<OpenOutcome> {
        let generation = {
            let mut st = lock(&self.state);
            if st.phase != SourcePhase::Closed {
                return Err(ConverseError::SessionStartFailed(format!(
                    "transcript source is already {:?}",
                    st.phase
                )));
            }
            st.phase = SourcePhase::Opening;
            st.close_requested = false;
            st.generation += 1;
            st.generation
        };

        debug!("Transcript source opening (agent {}, {})", request.agent_id, request.connection_mode);
        let result = self.transport.start(request).await;

        let opened = {
            let mut st = lock(&self.state);
            match result {
                Err(e) => {
                    st.phase = SourcePhase::Closed;
                    st.close_requested = false;
                    return Err(match e {
                        ConverseError::SessionStartFailed(_) => e,
                        other => ConverseError::SessionStartFailed(other.to_string()),
                    });
                }
                Ok(opened) if st.close_requested => {
                    st.phase = SourcePhase::Closed;
                    st.close_requested = false;
                    st.generation += 1;
                    Err(opened.handle)
                }
                Ok(opened) => {
                    st.phase = SourcePhase::Open;
                    st.handle = Some(opened.handle.clone());
                    Ok(opened)
                }
            }
        };

        let opened = match opened {
            Ok(opened) => opened,
            Err(handle) => {
                info!("Close requested during handshake; ending session {} immediately", handle);
                if let Err(e) = self.transport.end(&handle).await {
                    warn!("Failed to end cancelled session {}: {}", handle, e);
                }
                return Ok(OpenOutcome::Cancelled);
            }
        };

        let handle = opened.handle.clone();
        let pump = tokio::spawn(pump_events(
            Arc::clone(&self.state),
            generation,
            opened.events,
            sink,
        ));
        if let Some(old) = lock(&self.pump).replace(pump) {
            old.abort();
        }

        info!("Transcript source open (session {})", handle);
        Ok(OpenOutcome::Opened(handle))
    }

    /// Close the session. Deferred while opening; a no-op when already closed.
    pub async fn close(&self) -> ConverseResult<()> {
        let handle = {
            let mut st = lock(&self.state);
            match st.phase {
                SourcePhase::Closed => return Ok(()),
                SourcePhase::Opening => {
                    debug!("Close requested while opening; deferring until handshake settles");
                    st.close_requested = true;
                    return Ok(());
                }
                SourcePhase::Open => {
                    st.phase = SourcePhase::Closed;
                    st.generation += 1;
                    st.handle.take()
                }
            }
        };

        if let Some(pump) = lock(&self.pump).take() {
            pump.abort();
        }

        match handle {
            Some(handle) => {
                info!("Transcript source closing (session {})", handle);
                self.transport.end(&handle).await
            }
            None => Ok(()),
        }
    }

    /// Sink that forwards microphone frames into the currently open session.
    pub fn frame_sink(&self) -> Option<Arc<dyn FrameSink>> {
        let handle = self.handle()?;
        Some(Arc::new(SessionFrameSink {
            transport: Arc::clone(&self.transport),
            handle,
        }))
    }
}

async fn pump_events(
    state: Arc<Mutex<SourceState>>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    sink: mpsc::UnboundedSender<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        {
            let st = lock(&state);
            if st.generation != generation || st.phase != SourcePhase::Open {
                debug!("Dropping transport event after close: {:?}", event);
                break;
            }
        }
        if sink.send(event).is_err() {
            break;
        }
    }
}

struct SessionFrameSink {
    transport: Arc<dyn VoiceTransport>,
    handle: SessionHandle,
}

impl FrameSink for SessionFrameSink {
    fn send_frame(&self, frame: &[i16]) -> ConverseResult<()> {
        self.transport.send_frame(&self.handle, frame)
    }
}
