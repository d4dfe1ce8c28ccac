//! **Audio Capture Pipeline**: microphone acquisition, fixed-size framing and
//! forwarding into the open voice session.
//!
//! The cpal stream lives on a dedicated thread (cpal `Stream` is `!Send` on some
//! platforms); samples cross into the async side over an unbounded channel, the
//! same way the capture callback has always fed the VAD loop. A spectrum
//! analyzer taps the frame stream through a bounded queue that drops under
//! back-pressure, so visualisation never delays the transport cadence.

use crate::error::{ConverseError, ConverseResult};
use crate::lock;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capture parameters.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Samples per frame forwarded to the transport (default: 512)
    pub frame_size: usize,

    /// Analyzer FFT window (default: 256)
    pub fft_size: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_size: 512,
            fft_size: 256,
        }
    }
}

/// Raw samples delivered by the microphone callback.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Audio samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Timestamp when captured
    pub timestamp: std::time::Instant,
}

/// Destination for framed microphone audio (the open voice session).
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: &[i16]) -> ConverseResult<()>;
}

/// Keeps a microphone stream alive; `stop` ends all tracks.
pub trait StreamGuard: Send {
    fn stop(&mut self);
}

/// A live microphone stream: the sample feed plus the guard that owns the device.
pub struct LiveStream {
    pub chunks: mpsc::UnboundedReceiver<AudioChunk>,
    pub guard: Box<dyn StreamGuard>,
}

/// Microphone access. Fails with `PermissionDenied` or `DeviceUnavailable`.
#[async_trait]
pub trait Microphone: Send + Sync {
    async fn acquire(&self, config: &CaptureConfig) -> ConverseResult<LiveStream>;
}

/// Default input device via cpal.
#[derive(Debug, Default)]
pub struct CpalMicrophone;

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn acquire(&self, config: &CaptureConfig) -> ConverseResult<LiveStream> {
        info!("🎤 Requesting microphone ({}Hz, mono)", config.sample_rate);

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<ConverseResult<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let sample_rate = config.sample_rate;

        let thread = thread::spawn(move || {
            let stream = match build_input_stream(sample_rate, chunk_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            // Park until the guard stops us (or is dropped); dropping the stream releases the device.
            let _ = stop_rx.recv();
            drop(stream);
            debug!("Microphone thread exiting");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(LiveStream {
                chunks: chunk_rx,
                guard: Box::new(CpalStreamGuard {
                    stop_tx: Some(stop_tx),
                    thread: Some(thread),
                }),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ConverseError::DeviceUnavailable(
                "microphone thread exited before the stream started".to_string(),
            )),
        }
    }
}

fn build_input_stream(
    sample_rate: u32,
    chunk_tx: mpsc::UnboundedSender<AudioChunk>,
) -> ConverseResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| ConverseError::DeviceUnavailable("No input device available".to_string()))?;

    info!("📱 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    // Probing the default config surfaces privacy refusals before we build the stream.
    let default_config = device.default_input_config()?;
    debug!("Default input config: {:?}", default_config);

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let chunk = AudioChunk {
                samples: data.to_vec(),
                timestamp: std::time::Instant::now(),
            };
            if chunk_tx.send(chunk).is_err() {
                debug!("Capture consumer gone; dropping samples");
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    info!("✅ Audio capture started");
    Ok(stream)
}

struct CpalStreamGuard {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl StreamGuard for CpalStreamGuard {
    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        // Detach; the thread only drops the stream and exits.
        self.thread.take();
    }
}

impl Drop for CpalStreamGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Splits an arbitrary sample stream into fixed-size 16-bit frames.
#[derive(Debug)]
pub struct FrameSegmenter {
    frame_size: usize,
    buffer: Vec<f32>,
}

impl FrameSegmenter {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            buffer: Vec::with_capacity(frame_size),
        }
    }

    /// Feed samples; returns every frame completed by this call.
    pub fn push(&mut self, samples: &[f32]) -> Vec<Vec<i16>> {
        let mut frames = Vec::new();
        for &sample in samples {
            self.buffer.push(sample);
            if self.buffer.len() >= self.frame_size {
                frames.push(
                    self.buffer
                        .iter()
                        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
                        .collect(),
                );
                self.buffer.clear();
            }
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// One analyzer snapshot for a waveform/bar view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectrumFrame {
    /// Byte magnitudes (0-255) over `fft_size / 2` bins.
    pub bins: Vec<u8>,
    /// Mean of `bins` normalised to 0.0..=1.0.
    pub level: f32,
}

/// Windowed DFT over the most recent `fft_size` samples, scaled to bytes
/// between -100 dB and -30 dB.
#[derive(Debug)]
pub struct SpectrumAnalyzer {
    fft_size: usize,
    window: Vec<f32>,
    history: VecDeque<f32>,
}

impl SpectrumAnalyzer {
    const MIN_DB: f32 = -100.0;
    const MAX_DB: f32 = -30.0;

    pub fn new(fft_size: usize) -> Self {
        let window = (0..fft_size)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f32 / fft_size as f32).cos())
            .collect();
        Self {
            fft_size,
            window,
            history: std::iter::repeat(0.0).take(fft_size).collect(),
        }
    }

    pub fn analyze(&mut self, frame: &[i16]) -> SpectrumFrame {
        for &s in frame {
            self.history.pop_front();
            self.history.push_back(s as f32 / 32768.0);
        }

        let n = self.fft_size;
        let bins: Vec<u8> = (0..n / 2)
            .map(|k| {
                let (mut re, mut im) = (0.0f32, 0.0f32);
                for (i, (&x, &w)) in self.history.iter().zip(&self.window).enumerate() {
                    let phase = 2.0 * PI * (k * i) as f32 / n as f32;
                    re += x * w * phase.cos();
                    im -= x * w * phase.sin();
                }
                let magnitude = (re * re + im * im).sqrt() / n as f32;
                let db = 20.0 * magnitude.max(1e-12).log10();
                let scaled = 255.0 * (db - Self::MIN_DB) / (Self::MAX_DB - Self::MIN_DB);
                scaled.clamp(0.0, 255.0) as u8
            })
            .collect();

        let level = if bins.is_empty() {
            0.0
        } else {
            bins.iter().map(|&b| b as f32).sum::<f32>() / bins.len() as f32 / 255.0
        };
        SpectrumFrame { bins, level }
    }
}

struct LiveCapture {
    guard: Box<dyn StreamGuard>,
    processor: JoinHandle<()>,
    analyzer: JoinHandle<()>,
}

/// Owns the microphone while a voice session records.
pub struct AudioCapturePipeline {
    microphone: Arc<dyn Microphone>,
    config: CaptureConfig,
    live: Mutex<Option<LiveCapture>>,
    muted: Arc<AtomicBool>,
    spectrum_tx: Arc<watch::Sender<SpectrumFrame>>,
}

impl AudioCapturePipeline {
    const ANALYZER_QUEUE: usize = 4;

    pub fn new(microphone: Arc<dyn Microphone>, config: CaptureConfig) -> Self {
        let (spectrum_tx, _) = watch::channel(SpectrumFrame::default());
        Self {
            microphone,
            config,
            live: Mutex::new(None),
            muted: Arc::new(AtomicBool::new(false)),
            spectrum_tx: Arc::new(spectrum_tx),
        }
    }

    /// Request microphone access.
    pub async fn acquire(&self) -> ConverseResult<LiveStream> {
        self.microphone.acquire(&self.config).await
    }

    /// Install the frame processor on `stream`, forwarding frames to `sink`.
    /// Replaces (and releases) any previously attached stream.
    pub fn attach_processor(&self, stream: LiveStream, sink: Arc<dyn FrameSink>) {
        let LiveStream { mut chunks, guard } = stream;
        let (tap_tx, mut tap_rx) = mpsc::channel::<Vec<i16>>(Self::ANALYZER_QUEUE);

        let frame_size = self.config.frame_size;
        let muted = Arc::clone(&self.muted);
        let processor = tokio::spawn(async move {
            let mut segmenter = FrameSegmenter::new(frame_size);
            while let Some(chunk) = chunks.recv().await {
                for frame in segmenter.push(&chunk.samples) {
                    if !muted.load(Ordering::SeqCst) {
                        if let Err(e) = sink.send_frame(&frame) {
                            warn!("Failed to forward audio frame: {}", e);
                        }
                    }
                    // Visualisation only; drop when the analyzer lags.
                    let _ = tap_tx.try_send(frame);
                }
            }
            debug!("Capture processor ended");
        });

        let fft_size = self.config.fft_size;
        let spectrum_tx = Arc::clone(&self.spectrum_tx);
        let analyzer = tokio::spawn(async move {
            let mut analyzer = SpectrumAnalyzer::new(fft_size);
            while let Some(frame) = tap_rx.recv().await {
                spectrum_tx.send_replace(analyzer.analyze(&frame));
            }
        });

        let previous = lock(&self.live).replace(LiveCapture {
            guard,
            processor,
            analyzer,
        });
        if let Some(previous) = previous {
            warn!("Capture already attached; releasing the previous stream");
            Self::teardown(previous);
        }
        info!("Capture processor attached ({} samples/frame)", frame_size);
    }

    /// Acquire the microphone and start streaming frames into `sink`.
    pub async fn start(&self, sink: Arc<dyn FrameSink>) -> ConverseResult<()> {
        let stream = self.acquire().await?;
        self.attach_processor(stream, sink);
        Ok(())
    }

    /// Stop all tracks and detach the processor. Safe when nothing is attached.
    pub fn release(&self) {
        let live = lock(&self.live).take();
        match live {
            Some(live) => {
                Self::teardown(live);
                self.spectrum_tx.send_replace(SpectrumFrame::default());
                info!("🛑 Capture released");
            }
            None => debug!("Capture release: nothing attached"),
        }
    }

    fn teardown(mut live: LiveCapture) {
        live.guard.stop();
        live.processor.abort();
        live.analyzer.abort();
    }

    /// While muted, frames are still analysed but not sent to the transport.
    pub fn set_muted(&self, muted: bool) {
        if self.muted.swap(muted, Ordering::SeqCst) != muted {
            debug!("Capture {}", if muted { "muted" } else { "unmuted" });
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        lock(&self.live).is_some()
    }

    pub fn spectrum(&self) -> watch::Receiver<SpectrumFrame> {
        self.spectrum_tx.subscribe()
    }
}

impl Drop for AudioCapturePipeline {
    fn drop(&mut self) {
        if let Some(live) = lock(&self.live).take() {
            Self::teardown(live);
        }
    }
}
