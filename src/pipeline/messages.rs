//! Message types passed between capture, transcription, synthesis and playback.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A buffer of raw microphone samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples in \[-1, 1\] at `sample_rate`.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }
}

/// One loudness sample taken by the energy meter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyReading {
    /// Offset from the start of the capture.
    pub timestamp: Duration,
    /// Root-mean-square energy normalized to \[0, 1\].
    pub rms_energy: f32,
}

impl EnergyReading {
    pub fn new(timestamp: Duration, rms_energy: f32) -> Self {
        Self {
            timestamp,
            rms_energy,
        }
    }
}

/// A finished recording, ready to be handed to the transcription client.
#[derive(Debug, Clone)]
pub struct UtteranceRecording {
    /// Encoded audio.
    pub bytes: Bytes,
    /// MIME type of `bytes`, e.g. `audio/wav`.
    pub mime_type: String,
    /// Length of the recorded audio.
    pub duration_ms: u64,
    /// Size of `bytes`.
    pub total_size_bytes: usize,
}

/// Why a capture was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The user pressed stop.
    Manual,
    /// The VAD decided the utterance ended.
    AutoDetected,
    /// The recording hit its length cap, or the microphone stream ended.
    Forced,
}

/// One indexed segment of a synthesized response.
#[derive(Debug, Clone)]
pub struct SpeechChunk {
    /// Position of this chunk, starting at 0.
    pub index: usize,
    /// Number of chunks the response was split into.
    pub total_chunks: usize,
    /// Encoded audio as returned by the synthesis service.
    pub audio_bytes: Bytes,
}

/// Text returned by the transcription service.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    /// Service confidence in \[0, 1\], when reported.
    pub confidence: Option<f32>,
    pub detected_language: Option<String>,
}

/// A transcribed utterance as handed to the chat collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceMessage {
    pub text: String,
    pub confidence: Option<f32>,
    pub detected_language: Option<String>,
    pub audio_duration_ms: u64,
}

/// Top-level state of a voice session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Capturing,
    Transcribing,
    Synthesizing,
    Speaking,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Capturing => "capturing",
            Self::Transcribing => "transcribing",
            Self::Synthesizing => "synthesizing",
            Self::Speaking => "speaking",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one top-level operation (a capture, a transcription, a speech run).
///
/// Ids only grow, so a completion tagged with an older id is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Monotonic [`RequestId`] source.
#[derive(Debug, Default)]
pub struct RequestIds {
    last: AtomicU64,
}

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> RequestId {
        RequestId(self.last.fetch_add(1, Ordering::Relaxed) + 1)
    }
}
