//! **Playback Controller**: one spoken-reply clip at a time.
//!
//! State moves `Idle → Playing → Idle` on natural completion or explicit stop.
//! Starting a clip always stops the current one first. The `Playing` state is
//! published on a `watch` channel so the capture side can stay muted while the
//! assistant is speaking.

use crate::error::{ConverseError, ConverseResult};
use crate::lock;
use async_trait::async_trait;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing,
}

/// Something that can play a clip by reference.
///
/// Implementations must apply `start`/`stop` calls in the order they are made:
/// a `stop`, or a later `start`, issued after a `start` was called silences
/// that clip, even when the earlier `start` has not resolved yet.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Begin playing `clip`; resolves once audio has started. The returned
    /// receiver fires when the clip finishes on its own.
    async fn start(&self, clip: &str) -> ConverseResult<oneshot::Receiver<()>>;

    /// Silence the current clip. No-op when nothing is playing.
    fn stop(&self);
}

pub struct PlaybackController {
    output: Arc<dyn AudioOutput>,
    state_tx: Arc<watch::Sender<PlaybackState>>,
    generation: Arc<AtomicU64>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackController {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let (state_tx, _) = watch::channel(PlaybackState::Idle);
        Self {
            output,
            state_tx: Arc::new(state_tx),
            generation: Arc::new(AtomicU64::new(0)),
            watcher: Mutex::new(None),
        }
    }

    /// Stop whatever is playing, then start `clip`.
    pub async fn play(&self, clip: &str) -> ConverseResult<()> {
        self.stop();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(PlaybackState::Playing);
        info!("🔊 Playing spoken reply: {}", clip);

        match self.output.start(clip).await {
            Ok(done) => {
                if self.generation.load(Ordering::SeqCst) != generation {
                    debug!("Clip {} superseded before it started", clip);
                    return Ok(());
                }
                let current = Arc::clone(&self.generation);
                let state_tx = Arc::clone(&self.state_tx);
                let watcher = tokio::spawn(async move {
                    // A dropped sender means the output discarded the clip; same outcome.
                    let _ = done.await;
                    if current.load(Ordering::SeqCst) == generation {
                        state_tx.send_replace(PlaybackState::Idle);
                        info!("Spoken reply finished");
                    }
                });
                if let Some(old) = lock(&self.watcher).replace(watcher) {
                    old.abort();
                }
                Ok(())
            }
            Err(e) => {
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.state_tx.send_replace(PlaybackState::Idle);
                }
                warn!("Playback failed: {}", e);
                Err(match e {
                    ConverseError::PlaybackFailed(_) => e,
                    other => ConverseError::PlaybackFailed(other.to_string()),
                })
            }
        }
    }

    /// Stop playback immediately. Safe when idle.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        let was = self.state_tx.send_replace(PlaybackState::Idle);
        if was == PlaybackState::Playing {
            self.output.stop();
            info!("⏹️ Playback stopped");
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state_tx.borrow()
    }

    pub fn is_speaking(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.stop();
    }
}

enum PlayerCommand {
    Play {
        ticket: u64,
        bytes: Vec<u8>,
        started: oneshot::Sender<ConverseResult<()>>,
        done: oneshot::Sender<()>,
    },
    /// Silence the current clip if its ticket is at or below `through`.
    Stop { through: u64 },
}

/// Orders clips whose `start` suspends (fetch, decode) before they are
/// audible. Every `start` takes a ticket and cancels all older ones; `stop`
/// cancels every ticket issued so far. A clip whose ticket is cancelled by the
/// time it reaches the device is never played.
#[derive(Debug, Default)]
struct ClipTickets {
    issued: AtomicU64,
    cancelled_through: Arc<AtomicU64>,
}

impl ClipTickets {
    fn issue(&self) -> u64 {
        let ticket = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancelled_through.fetch_max(ticket - 1, Ordering::SeqCst);
        ticket
    }

    fn cancel_all(&self) -> u64 {
        let through = self.issued.load(Ordering::SeqCst);
        self.cancelled_through.fetch_max(through, Ordering::SeqCst);
        through
    }
}

/// The audible side of one clip.
trait ClipSink {
    fn halt(&self);
    fn finished(&self) -> bool;
}

impl ClipSink for Sink {
    fn halt(&self) {
        self.stop();
    }

    fn finished(&self) -> bool {
        self.empty()
    }
}

/// Command handling of the player thread.
struct Player<S> {
    cancelled_through: Arc<AtomicU64>,
    current: Option<(u64, S, oneshot::Sender<()>)>,
}

impl<S: ClipSink> Player<S> {
    fn new(cancelled_through: Arc<AtomicU64>) -> Self {
        Self {
            cancelled_through,
            current: None,
        }
    }

    fn handle(&mut self, command: PlayerCommand, open: impl FnOnce(Vec<u8>) -> ConverseResult<S>) {
        match command {
            PlayerCommand::Play {
                ticket,
                bytes,
                started,
                done,
            } => {
                if ticket <= self.cancelled_through.load(Ordering::SeqCst) {
                    // Dropping `done` tells the caller the clip was discarded.
                    debug!("Dropping cancelled clip (ticket {})", ticket);
                    let _ = started.send(Ok(()));
                    return;
                }
                self.halt_through(u64::MAX);
                match open(bytes) {
                    Ok(sink) => {
                        let _ = started.send(Ok(()));
                        self.current = Some((ticket, sink, done));
                    }
                    Err(e) => {
                        let _ = started.send(Err(e));
                    }
                }
            }
            PlayerCommand::Stop { through } => self.halt_through(through),
        }
    }

    fn halt_through(&mut self, through: u64) {
        if let Some((ticket, sink, done)) = self.current.take() {
            if ticket <= through {
                sink.halt();
            } else {
                self.current = Some((ticket, sink, done));
            }
        }
    }

    /// Report natural completion of the current clip.
    fn tick(&mut self) {
        if let Some((ticket, sink, done)) = self.current.take() {
            if sink.finished() {
                let _ = done.send(());
            } else {
                self.current = Some((ticket, sink, done));
            }
        }
    }
}

fn open_sink(handle: &OutputStreamHandle, bytes: Vec<u8>) -> ConverseResult<Sink> {
    let sink = Sink::try_new(handle).map_err(|e| ConverseError::PlaybackFailed(e.to_string()))?;
    let source = rodio::Decoder::new(Cursor::new(bytes))
        .map_err(|e| ConverseError::PlaybackFailed(format!("Decode failed: {}", e)))?;
    sink.append(source.convert_samples::<f32>());
    Ok(sink)
}

/// Rodio-backed output. Clips are fetched over HTTP and decoded on a
/// dedicated player thread (`OutputStream` is not `Send`).
pub struct RodioOutput {
    commands: std_mpsc::Sender<PlayerCommand>,
    client: reqwest::Client,
    tickets: ClipTickets,
}

impl RodioOutput {
    const POLL: Duration = Duration::from_millis(50);

    /// Open the default output device.
    pub fn new() -> ConverseResult<Self> {
        let (commands, rx) = std_mpsc::channel::<PlayerCommand>();
        let (init_tx, init_rx) = std_mpsc::channel::<ConverseResult<()>>();
        let tickets = ClipTickets::default();
        let cancelled_through = Arc::clone(&tickets.cancelled_through);

        thread::spawn(move || {
            let (_stream, handle) = match OutputStream::try_default() {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = init_tx.send(Err(ConverseError::PlaybackFailed(e.to_string())));
                    return;
                }
            };
            let _ = init_tx.send(Ok(()));
            info!("🔊 Audio output ready");

            let mut player = Player::<Sink>::new(cancelled_through);
            loop {
                match rx.recv_timeout(Self::POLL) {
                    Ok(command) => player.handle(command, |bytes| open_sink(&handle, bytes)),
                    Err(std_mpsc::RecvTimeoutError::Timeout) => player.tick(),
                    Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Audio output thread exiting");
        });

        init_rx
            .recv()
            .map_err(|_| ConverseError::PlaybackFailed("audio output thread died".to_string()))??;

        Ok(Self {
            commands,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            tickets,
        })
    }

    async fn fetch(&self, clip: &str) -> ConverseResult<Vec<u8>> {
        let res = self
            .client
            .get(clip)
            .send()
            .await
            .map_err(|e| ConverseError::PlaybackFailed(e.to_string()))?;
        if !res.status().is_success() {
            return Err(ConverseError::PlaybackFailed(format!(
                "clip fetch returned {}",
                res.status()
            )));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| ConverseError::PlaybackFailed(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl AudioOutput for RodioOutput {
    async fn start(&self, clip: &str) -> ConverseResult<oneshot::Receiver<()>> {
        let ticket = self.tickets.issue();
        let bytes = self.fetch(clip).await?;
        let (started_tx, started_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(PlayerCommand::Play {
                ticket,
                bytes,
                started: started_tx,
                done: done_tx,
            })
            .map_err(|e| ConverseError::ChannelSend(e.to_string()))?;
        started_rx
            .await
            .map_err(|_| ConverseError::PlaybackFailed("audio output thread died".to_string()))??;
        Ok(done_rx)
    }

    fn stop(&self) {
        let through = self.tickets.cancel_all();
        let _ = self.commands.send(PlayerCommand::Stop { through });
    }
}
