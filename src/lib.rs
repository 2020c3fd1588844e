//! Murmur: voice I/O engine for a document Q&A chat client.
//!
//! The engine covers the two halves of a spoken exchange:
//! Microphone → VAD → recording → transcription → chat → chunked synthesis → Speaker
//!
//! # Architecture
//!
//! - **Audio**: microphone and speaker via `cpal`, WAV encoding via `hound`,
//!   chunk decoding via `symphonia`
//! - **VAD**: energy meter plus debounced auto-stop on sustained silence
//! - **STT / TTS**: thin clients for the chat backend's voice endpoints
//! - **Pipeline**: capture session, chunked playback engine, and the
//!   coordinator actor that keeps capture and playback mutually exclusive

pub mod audio;
pub mod chat;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod runtime;
pub mod stt;
pub mod tts;
pub mod vad;

pub use chat::ChatCollaborator;
pub use config::VoiceConfig;
pub use error::{Result, VoiceError};
pub use pipeline::coordinator::{VoiceSession, VoiceSessionCoordinator};
pub use pipeline::messages::{RequestId, SessionState, StopReason, VoiceMessage};
pub use runtime::SessionEvent;
