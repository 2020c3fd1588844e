//! Text-to-speech through the chat backend's chunked synthesis endpoint.
//!
//! The backend splits a response into sentences-sized chunks and answers
//! `POST /voice/text-to-speech/chunk/{index}` with the audio for one of them,
//! advertising the chunk count in the `X-Total-Chunks` header.

pub mod language;

pub use language::{LanguageDetector, ScriptLanguageDetector};

use crate::config::SynthesisConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::SpeechChunk;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const TOTAL_CHUNKS_HEADER: &str = "X-Total-Chunks";
const CURRENT_CHUNK_HEADER: &str = "X-Current-Chunk";

/// Everything needed to synthesize one response. Chunk requests for the same
/// request must return the same content for the same index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub speed: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl SynthesisRequest {
    /// Build a request from config, resolving the language through `detector`
    /// when the config leaves it on auto.
    pub fn from_config(
        text: impl Into<String>,
        config: &SynthesisConfig,
        detector: &dyn LanguageDetector,
    ) -> Self {
        let text = text.into();
        let language = config
            .language_override()
            .map(str::to_owned)
            .or_else(|| detector.detect(&text).map(str::to_owned));
        Self {
            text,
            voice: config.voice.clone(),
            speed: config.speed,
            language,
        }
    }
}

/// Fetches synthesized audio one chunk at a time.
#[async_trait]
pub trait SynthesisClient: Send + Sync + 'static {
    /// Fetch chunk `chunk_index` of `request`.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::SynthesisFailed`] tagged with `chunk_index`.
    async fn fetch_chunk(&self, request: &SynthesisRequest, chunk_index: usize) -> Result<SpeechChunk>;
}

/// HTTP synthesis client.
pub struct HttpSynthesisClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSynthesisClient {
    /// Build a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.chunk_timeout_ms))
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl SynthesisClient for HttpSynthesisClient {
    async fn fetch_chunk(&self, request: &SynthesisRequest, chunk_index: usize) -> Result<SpeechChunk> {
        let fail = |reason: String| VoiceError::SynthesisFailed {
            chunk_index,
            reason,
        };
        let url = format!("{}/voice/text-to-speech/chunk/{chunk_index}", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    VoiceError::Timeout(format!("synthesis of chunk {chunk_index}"))
                } else {
                    fail(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(fail(format!("HTTP {}", status.as_u16())));
        }

        let (total_chunks, index) = chunk_headers(response.headers(), chunk_index);
        let audio_bytes = response
            .bytes()
            .await
            .map_err(|e| fail(format!("failed to read body: {e}")))?;
        if audio_bytes.is_empty() {
            return Err(fail("empty audio body".into()));
        }

        debug!(
            "fetched chunk {index}/{total_chunks} ({} bytes)",
            audio_bytes.len()
        );
        Ok(SpeechChunk {
            index,
            total_chunks,
            audio_bytes,
        })
    }
}

/// Read chunk position headers; a missing or unparsable total means one chunk.
fn chunk_headers(headers: &HeaderMap, requested: usize) -> (usize, usize) {
    let parse = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
    };
    let total = parse(TOTAL_CHUNKS_HEADER).filter(|&n| n > 0).unwrap_or(1);
    let current = parse(CURRENT_CHUNK_HEADER).unwrap_or(requested);
    (total, current)
}
