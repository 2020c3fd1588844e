//! Error types for the voice engine.
//!
//! Each variant carries a stable error code (SCREAMING_SNAKE_CASE) available
//! through [`VoiceError::code()`]. Codes are part of the event contract with
//! the chat UI and will not change.

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// Microphone access was refused by the OS or the user.
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";

    /// No usable audio device, or the device went away.
    pub const DEVICE_UNAVAILABLE: &str = "DEVICE_UNAVAILABLE";

    /// Recording below the minimum size floor.
    pub const TOO_SHORT: &str = "TOO_SHORT";

    /// Transcription service call failed.
    pub const TRANSCRIPTION_FAILED: &str = "TRANSCRIPTION_FAILED";

    /// Synthesis service call failed for a chunk.
    pub const SYNTHESIS_FAILED: &str = "SYNTHESIS_FAILED";

    /// Decoding or rendering a chunk to the speaker failed.
    pub const PLAYBACK_FAILED: &str = "PLAYBACK_FAILED";

    /// A bounded wait elapsed.
    pub const TIMEOUT: &str = "TIMEOUT";

    /// Operation preempted on purpose.
    pub const CANCELLED: &str = "CANCELLED";

    /// Invalid configuration.
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// Filesystem I/O error.
    pub const IO_ERROR: &str = "IO_ERROR";

    /// Internal channel closed.
    pub const CHANNEL_CLOSED: &str = "CHANNEL_CLOSED";
}

/// Top-level error type for capture, transcription, synthesis and playback.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone permission refused.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// Audio device missing or unusable.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The recording was too small to be worth transcribing.
    #[error("recording too short ({size_bytes} bytes, minimum {min_bytes})")]
    TooShort { size_bytes: usize, min_bytes: usize },

    /// Transcription service error.
    #[error("transcription failed: {0}")]
    TranscriptionFailed(String),

    /// Synthesis service error for one chunk.
    #[error("synthesis failed for chunk {chunk_index}: {reason}")]
    SynthesisFailed { chunk_index: usize, reason: String },

    /// Audio decoding or output error.
    #[error("playback failed: {0}")]
    PlaybackFailed(String),

    /// A bounded operation did not finish in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The operation was preempted by a newer one.
    #[error("cancelled")]
    Cancelled,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl VoiceError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied(_) => error_codes::PERMISSION_DENIED,
            Self::DeviceUnavailable(_) => error_codes::DEVICE_UNAVAILABLE,
            Self::TooShort { .. } => error_codes::TOO_SHORT,
            Self::TranscriptionFailed(_) => error_codes::TRANSCRIPTION_FAILED,
            Self::SynthesisFailed { .. } => error_codes::SYNTHESIS_FAILED,
            Self::PlaybackFailed(_) => error_codes::PLAYBACK_FAILED,
            Self::Timeout(_) => error_codes::TIMEOUT,
            Self::Cancelled => error_codes::CANCELLED,
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::Io(_) => error_codes::IO_ERROR,
            Self::Channel(_) => error_codes::CHANNEL_CLOSED,
        }
    }

    /// True for intentional preemption, which is never shown to the user.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Single human-readable message for the chat UI.
    pub fn user_message(&self) -> String {
        match self {
            Self::PermissionDenied(_) => {
                "Could not access microphone. Please check permissions.".to_owned()
            }
            Self::DeviceUnavailable(_) => "No microphone or speaker is available.".to_owned(),
            Self::TooShort { .. } => {
                "Recording was too short or silent. Please try again.".to_owned()
            }
            Self::TranscriptionFailed(reason) => format!("Transcription failed: {reason}"),
            Self::SynthesisFailed { chunk_index: 0, reason } => {
                format!("Text-to-speech failed: {reason}")
            }
            Self::SynthesisFailed { reason, .. } => {
                format!("Text-to-speech stopped early: {reason}")
            }
            Self::PlaybackFailed(reason) => format!("Audio playback failed: {reason}"),
            Self::Timeout(what) => format!("The request timed out ({what}). Please try again."),
            Self::Cancelled => String::new(),
            other => other.to_string(),
        }
    }
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
