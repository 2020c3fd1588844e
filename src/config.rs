//! Configuration types for the voice engine.

use crate::error::{Result, VoiceError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Voices offered by the synthesis service.
pub const SUPPORTED_VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];

/// Language value meaning "let the service (or the detector) decide".
pub const AUTO_LANGUAGE: &str = "auto";

/// Top-level configuration for a voice session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Audio device settings.
    pub audio: AudioConfig,
    /// Voice activity detection settings.
    pub vad: VadConfig,
    /// Capture session limits.
    pub capture: CaptureConfig,
    /// Remote transcription service.
    pub transcription: TranscriptionConfig,
    /// Remote synthesis service and chunked playback.
    pub synthesis: SynthesisConfig,
    /// Session behaviour.
    pub session: SessionConfig,
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate recordings are resampled to, in Hz.
    pub input_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Ask the input backend for echo cancellation.
    pub echo_cancellation: bool,
    /// Ask the input backend for noise suppression.
    pub noise_suppression: bool,
    /// Ask the input backend for automatic gain control.
    pub auto_gain_control: bool,
    /// Capacity of the frame channel between the audio thread and the capture worker.
    pub frame_channel_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: 16_000,
            input_device: None,
            output_device: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            frame_channel_size: 64,
        }
    }
}

/// Voice activity detection configuration.
///
/// The defaults were tuned by ear on laptop microphones. Validate them on
/// the target hardware before relying on auto-stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Minimum RMS energy (0..1) for a reading to count as speech.
    ///
    ///   - 0.01: very sensitive (quiet rooms)
    ///   - 0.02: normal (default)
    ///   - 0.05: noisy environments, close-talking only
    pub energy_threshold: f32,
    /// Grace period after capture starts during which auto-stop is not allowed.
    pub min_recording_ms: u64,
    /// Sustained silence after speech required to auto-stop.
    pub silence_timeout_ms: u64,
    /// Delay between deciding to stop and actually stopping.
    pub debounce_ms: u64,
    /// Energy meter sampling period.
    pub tick_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.02,
            min_recording_ms: 1_000,
            silence_timeout_ms: 1_500,
            debounce_ms: 100,
            tick_ms: 100,
        }
    }
}

impl VadConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Capture session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Encoded recordings smaller than this are rejected as too short.
    pub min_audio_bytes: usize,
    /// Hard cap on a single recording; capture is force-stopped after this.
    pub max_recording_ms: u64,
    /// How long to wait for the microphone to open.
    pub acquire_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            min_audio_bytes: 2_000,
            max_recording_ms: 120_000,
            acquire_timeout_ms: 5_000,
        }
    }
}

/// Transcription service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Base URL of the chat backend exposing `/voice/transcribe`.
    pub base_url: String,
    /// Language hint, or `"auto"` to let the service detect it.
    pub language: String,
    /// Upper bound for one transcription call.
    pub timeout_ms: u64,
    /// Largest recording the service accepts.
    pub max_upload_bytes: usize,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_owned(),
            language: AUTO_LANGUAGE.to_owned(),
            timeout_ms: 30_000,
            max_upload_bytes: 25 * 1024 * 1024,
        }
    }
}

impl TranscriptionConfig {
    /// The language hint to send, if any.
    pub fn language_hint(&self) -> Option<&str> {
        language_override(&self.language)
    }
}

/// Synthesis service and chunked playback configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Base URL of the chat backend exposing `/voice/text-to-speech/chunk/{i}`.
    pub base_url: String,
    /// Voice name (see [`SUPPORTED_VOICES`]).
    pub voice: String,
    /// Speaking rate multiplier.
    pub speed: f32,
    /// Synthesis language, or `"auto"` to detect it from the text.
    pub language: String,
    /// Upper bound for fetching one chunk.
    pub chunk_timeout_ms: u64,
    /// Maximum number of trailing chunks in flight or held behind a gap.
    pub max_parallel_fetches: usize,
    /// Largest chunk count accepted from the service for one response.
    pub max_chunks: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_owned(),
            voice: "alloy".to_owned(),
            speed: 1.0,
            language: AUTO_LANGUAGE.to_owned(),
            chunk_timeout_ms: 20_000,
            max_parallel_fetches: 4,
            max_chunks: 256,
        }
    }
}

impl SynthesisConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    /// The configured language, unless it is `"auto"`.
    pub fn language_override(&self) -> Option<&str> {
        language_override(&self.language)
    }
}

/// Session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Speak assistant replies as soon as the chat collaborator returns them.
    pub auto_speak: bool,
    /// Master switch for speech output.
    pub tts_enabled: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_speak: false,
            tts_enabled: true,
        }
    }
}

fn language_override(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(AUTO_LANGUAGE) {
        None
    } else {
        Some(trimmed)
    }
}

impl VoiceConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| VoiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path, e.g. `~/.config/murmur/config.toml`.
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| std::env::temp_dir().join("murmur-config"))
            .join("murmur")
            .join("config.toml")
    }

    /// Check value ranges that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        let vad = &self.vad;
        if !(vad.energy_threshold > 0.0 && vad.energy_threshold < 1.0) {
            return Err(VoiceError::Config(format!(
                "vad.energy_threshold must be in (0, 1), got {}",
                vad.energy_threshold
            )));
        }
        if vad.tick_ms == 0 {
            return Err(VoiceError::Config("vad.tick_ms must be positive".into()));
        }
        if vad.silence_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "vad.silence_timeout_ms must be positive".into(),
            ));
        }
        if self.audio.input_sample_rate == 0 {
            return Err(VoiceError::Config(
                "audio.input_sample_rate must be positive".into(),
            ));
        }
        if self.audio.frame_channel_size == 0 {
            return Err(VoiceError::Config(
                "audio.frame_channel_size must be positive".into(),
            ));
        }
        if self.capture.max_recording_ms <= vad.min_recording_ms {
            return Err(VoiceError::Config(
                "capture.max_recording_ms must exceed vad.min_recording_ms".into(),
            ));
        }
        let synth = &self.synthesis;
        if !SUPPORTED_VOICES.contains(&synth.voice.as_str()) {
            return Err(VoiceError::Config(format!(
                "synthesis.voice '{}' is not one of {}",
                synth.voice,
                SUPPORTED_VOICES.join(", ")
            )));
        }
        if !(0.25..=4.0).contains(&synth.speed) {
            return Err(VoiceError::Config(format!(
                "synthesis.speed must be within 0.25..=4.0, got {}",
                synth.speed
            )));
        }
        if synth.max_parallel_fetches == 0 {
            return Err(VoiceError::Config(
                "synthesis.max_parallel_fetches must be positive".into(),
            ));
        }
        if synth.max_chunks == 0 {
            return Err(VoiceError::Config(
                "synthesis.max_chunks must be positive".into(),
            ));
        }
        if synth.chunk_timeout_ms == 0 || self.transcription.timeout_ms == 0 {
            return Err(VoiceError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}
