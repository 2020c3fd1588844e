//! Speech-to-text through the chat backend's transcription endpoint.
//!
//! The model itself is opaque; this module only speaks the
//! `POST /voice/transcribe` contract.

use crate::config::TranscriptionConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{Transcript, UtteranceRecording};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Transcribes finished recordings.
#[async_trait]
pub trait TranscriptionClient: Send + Sync + 'static {
    /// Transcribe `recording`. The recording is consumed: it is discarded
    /// after the attempt whether or not it succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::TranscriptionFailed`] on any service failure.
    async fn transcribe(
        &self,
        recording: UtteranceRecording,
        language_hint: Option<&str>,
    ) -> Result<Transcript>;
}

/// Wire shape of a successful `/voice/transcribe` response.
#[derive(Debug, Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    auto_detected: Option<bool>,
}

/// Wire shape of an error body.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: String,
}

/// HTTP transcription client.
pub struct HttpTranscriptionClient {
    client: reqwest::Client,
    endpoint: String,
    max_upload_bytes: usize,
}

impl HttpTranscriptionClient {
    /// Build a client for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &TranscriptionConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/voice/transcribe", config.base_url.trim_end_matches('/')),
            max_upload_bytes: config.max_upload_bytes,
        })
    }
}

#[async_trait]
impl TranscriptionClient for HttpTranscriptionClient {
    async fn transcribe(
        &self,
        recording: UtteranceRecording,
        language_hint: Option<&str>,
    ) -> Result<Transcript> {
        if recording.total_size_bytes > self.max_upload_bytes {
            return Err(VoiceError::TranscriptionFailed(format!(
                "recording is {} bytes, service limit is {}",
                recording.total_size_bytes, self.max_upload_bytes
            )));
        }

        let started = Instant::now();
        let part = reqwest::multipart::Part::bytes(recording.bytes.to_vec())
            .file_name("recording.wav")
            .mime_str(&recording.mime_type)
            .map_err(|e| VoiceError::TranscriptionFailed(format!("invalid mime type: {e}")))?;
        let mut form = reqwest::multipart::Form::new().part("audio_file", part);
        if let Some(language) = language_hint {
            form = form.text("language", language.to_owned());
        }

        debug!(
            "uploading {} bytes ({}ms) for transcription",
            recording.total_size_bytes, recording.duration_ms
        );
        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<ErrorBody>(&body)
                .map(|b| b.detail)
                .unwrap_or_else(|_| format!("HTTP {}", status.as_u16()));
            return Err(VoiceError::TranscriptionFailed(detail));
        }

        let parsed: TranscribeResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::TranscriptionFailed(format!("malformed response: {e}")))?;

        info!(
            "transcribed in {:.0}ms: \"{}\" (language={:?}, auto_detected={:?})",
            started.elapsed().as_millis(),
            parsed.text,
            parsed.language,
            parsed.auto_detected
        );

        Ok(Transcript {
            text: parsed.text.trim().to_owned(),
            confidence: parsed.confidence.map(|c| c.clamp(0.0, 1.0)),
            detected_language: parsed.language.filter(|l| l != "unknown"),
        })
    }
}

fn map_request_error(e: reqwest::Error) -> VoiceError {
    if e.is_timeout() {
        VoiceError::Timeout("transcription request".into())
    } else {
        VoiceError::TranscriptionFailed(e.to_string())
    }
}
