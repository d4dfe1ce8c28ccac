//! Error types for the PAGI Converse coordinator

use thiserror::Error;

/// Result type alias for coordinator operations
pub type ConverseResult<T> = Result<T, ConverseError>;

/// Errors that can occur while coordinating voice and text turns
#[derive(Error, Debug)]
pub enum ConverseError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Voice session start failed: {0}")]
    SessionStartFailed(String),

    #[error("Image upload failed: {0}")]
    UploadFailed(String),

    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Playback failed: {0}")]
    PlaybackFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("A submission is already in flight")]
    Busy,

    #[error("Nothing to submit")]
    EmptyUtterance,

    #[error("Voice transport error: {0}")]
    Transport(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConverseError {
    /// Errors that are surfaced to the user as a dismissible notice while the
    /// conversation stays usable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ConverseError::Config(_) | ConverseError::Io(_))
    }
}

impl From<cpal::DevicesError> for ConverseError {
    fn from(err: cpal::DevicesError) -> Self {
        ConverseError::DeviceUnavailable(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for ConverseError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                ConverseError::DeviceUnavailable(err.to_string())
            }
            other => classify_backend_message(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for ConverseError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                ConverseError::DeviceUnavailable(err.to_string())
            }
            other => classify_backend_message(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for ConverseError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::DeviceNotAvailable => {
                ConverseError::DeviceUnavailable(err.to_string())
            }
            other => classify_backend_message(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for ConverseError {
    fn from(err: reqwest::Error) -> Self {
        ConverseError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for ConverseError {
    fn from(err: serde_json::Error) -> Self {
        ConverseError::Transport(format!("malformed payload: {}", err))
    }
}

impl From<config::ConfigError> for ConverseError {
    fn from(err: config::ConfigError) -> Self {
        ConverseError::Config(err.to_string())
    }
}

/// Host backends report privacy refusals as free-form text (CoreAudio, WASAPI, PipeWire).
fn classify_backend_message(message: String) -> ConverseError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        ConverseError::PermissionDenied(message)
    } else {
        ConverseError::AudioStream(message)
    }
}
