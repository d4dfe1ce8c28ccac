//! Coordinator configuration loaded from TOML and environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | CONVERSE_CONFIG | config/converse | Path (without extension) of the optional TOML file. |
//! | CONVERSE__API_BASE_URL | http://localhost:3000 | Agent backend base URL. |
//! | CONVERSE__AGENT_ID | (empty) | Realtime voice agent identifier. |
//! | CONVERSE__CONNECTION_MODE | webrtc | Realtime voice connection mode. |
//! | CONVERSE__REALTIME_URL | (unset) | socket.io endpoint for `ai-thinking` / conversation events. |
//! | CONVERSE__SILENCE_THRESHOLD | 0.15 | Activity score below which the user counts as silent. |
//! | CONVERSE__SUBMIT_TIMEOUT_SECS | 60 | Upper bound on one backend submission. |

use crate::error::{ConverseError, ConverseResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How user fragments from the voice session become submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentSubmitPolicy {
    /// Every non-empty user fragment is a complete utterance and is submitted at once.
    #[default]
    EachFragment,
    /// Fragments accumulate into the pending utterance, submitted when activity drops below the silence threshold.
    DebounceUntilSilence,
}

/// Configuration for the conversation coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverseConfig {
    /// Base URL for `/agent/plan`, `/agent/upload-image` and `/conversation/{id}`.
    pub api_base_url: String,
    /// Agent identifier passed to the realtime voice session.
    #[serde(default)]
    pub agent_id: String,
    /// Realtime voice connection mode (e.g. "webrtc", "websocket").
    pub connection_mode: String,
    /// socket.io endpoint for push events. No feed is opened when unset.
    #[serde(default)]
    pub realtime_url: Option<String>,
    /// Activity score below which the user is considered silent (default 0.15).
    pub silence_threshold: f32,
    /// Upper bound for a single backend submission (default 60s).
    pub submit_timeout_secs: u64,
    /// Microphone sample rate (default 16000).
    pub sample_rate: u32,
    /// Samples per frame forwarded to the voice transport (default 512).
    pub frame_size: usize,
    /// FFT window for the visualisation analyzer (default 256; must be a power of two).
    pub analyzer_fft_size: usize,
    #[serde(default)]
    pub fragment_submit_policy: FragmentSubmitPolicy,
}

impl Default for ConverseConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            agent_id: String::new(),
            connection_mode: "webrtc".to_string(),
            realtime_url: None,
            silence_threshold: 0.15,
            submit_timeout_secs: 60,
            sample_rate: 16000,
            frame_size: 512,
            analyzer_fft_size: 256,
            fragment_submit_policy: FragmentSubmitPolicy::EachFragment,
        }
    }
}

impl ConverseConfig {
    /// Load config from file and environment. Precedence: env `CONVERSE__*` > file at `CONVERSE_CONFIG` > defaults.
    pub fn load() -> ConverseResult<Self> {
        let config_path =
            std::env::var("CONVERSE_CONFIG").unwrap_or_else(|_| "config/converse".to_string());
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("api_base_url", defaults.api_base_url)?
            .set_default("agent_id", defaults.agent_id)?
            .set_default("connection_mode", defaults.connection_mode)?
            .set_default("silence_threshold", defaults.silence_threshold as f64)?
            .set_default("submit_timeout_secs", defaults.submit_timeout_secs as i64)?
            .set_default("sample_rate", defaults.sample_rate as i64)?
            .set_default("frame_size", defaults.frame_size as i64)?
            .set_default("analyzer_fft_size", defaults.analyzer_fft_size as i64)?
            .set_default("fragment_submit_policy", "each_fragment")?;

        let builder = builder
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("CONVERSE").separator("__"));

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Load from an explicit TOML file (no environment layer).
    pub fn from_file(path: &Path) -> ConverseResult<Self> {
        let loaded: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Reject values the coordinator cannot run with.
    pub fn validate(&self) -> ConverseResult<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConverseError::Config("api_base_url must not be empty".to_string()));
        }
        if !(0.0..=1.0).contains(&self.silence_threshold) {
            return Err(ConverseError::Config(format!(
                "silence_threshold must be within 0..=1, got {}",
                self.silence_threshold
            )));
        }
        if self.frame_size == 0 {
            return Err(ConverseError::Config("frame_size must be positive".to_string()));
        }
        if !self.analyzer_fft_size.is_power_of_two() || self.analyzer_fft_size < 32 {
            return Err(ConverseError::Config(format!(
                "analyzer_fft_size must be a power of two >= 32, got {}",
                self.analyzer_fft_size
            )));
        }
        if self.submit_timeout_secs == 0 {
            return Err(ConverseError::Config("submit_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_secs(self.submit_timeout_secs)
    }

    /// Resolve a backend-relative path (e.g. an `audioPath` like `/audio/reply.mp3`) to an absolute URL.
    pub fn resolve_url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.api_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
