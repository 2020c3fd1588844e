//! Session events emitted by the coordinator for UI and observability.
//!
//! Payloads are small and `Clone` so the coordinator can broadcast them
//! without blocking on slow subscribers.

use crate::pipeline::messages::{RequestId, SessionState, StopReason, VoiceMessage};

/// What the voice session is doing "right now".
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Top-level state transition.
    StateChanged { state: SessionState },
    /// Microphone acquired, recording started.
    CaptureStarted { request_id: RequestId },
    /// The VAD heard the user start talking.
    SpeechDetected { request_id: RequestId },
    /// Recording ended and the microphone was released.
    CaptureStopped {
        request_id: RequestId,
        reason: StopReason,
    },
    /// Recording abandoned by a newer operation.
    CaptureCancelled { request_id: RequestId },
    /// Transcription abandoned by a newer operation.
    TranscriptionCancelled { request_id: RequestId },
    /// Utterance transcribed and handed to the chat collaborator.
    Transcribed {
        request_id: RequestId,
        message: VoiceMessage,
    },
    /// Assistant reply received for a voice message.
    ///
    /// `spoken` is false when auto-speak is off or the reply arrived after
    /// the user had moved on.
    AssistantReply {
        request_id: RequestId,
        text: String,
        spoken: bool,
    },
    /// Chunk `index` of `total` started playing.
    ChunkStarted {
        request_id: RequestId,
        index: usize,
        total: usize,
    },
    /// Playback is ahead of the downloads.
    WaitingForChunk { request_id: RequestId, index: usize },
    /// All chunks played.
    PlaybackFinished { request_id: RequestId },
    /// Playback stopped at a failed chunk after `played` chunks.
    PartialPlayback { request_id: RequestId, played: usize },
    /// Speech stopped by the user or preempted.
    PlaybackCancelled { request_id: RequestId },
    /// A user-facing failure. Never carries a cancellation.
    Error { code: &'static str, message: String },
}
