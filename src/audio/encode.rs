//! Recording encoder: accumulates mono f32 samples and writes 16-bit PCM WAV.

use crate::error::{Result, VoiceError};
use std::io::Cursor;

/// MIME type of encoded recordings.
pub const WAV_MIME_TYPE: &str = "audio/wav";

/// Size of the canonical RIFF/WAVE header written by `hound`.
const WAV_HEADER_BYTES: usize = 44;

/// Incremental WAV encoder for one recording.
#[derive(Debug, Clone)]
pub struct WavEncoder {
    sample_rate: u32,
    samples: Vec<i16>,
}

impl WavEncoder {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            samples: Vec::new(),
        }
    }

    /// Append f32 samples in \[-1, 1\]; out-of-range values are clipped.
    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend(samples.iter().map(|&s| {
            let clamped = s.clamp(-1.0, 1.0);
            (clamped * i16::MAX as f32).round() as i16
        }));
    }

    /// Size the encoded file will have.
    pub fn encoded_len(&self) -> usize {
        WAV_HEADER_BYTES + self.samples.len() * 2
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / u64::from(self.sample_rate)
    }

    /// Flush everything into a complete WAV file.
    ///
    /// # Errors
    ///
    /// Returns an error if the WAV writer rejects the data.
    pub fn finish(self) -> Result<Vec<u8>> {
        encode_wav(&self.samples, self.sample_rate)
    }
}

/// Encode 16-bit mono samples as a WAV file in memory.
///
/// # Errors
///
/// Returns an error if the WAV writer rejects the data.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_BYTES + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| wav_error("create wav writer", e))?;
        for &s in samples {
            writer
                .write_sample(s)
                .map_err(|e| wav_error("write sample", e))?;
        }
        writer
            .finalize()
            .map_err(|e| wav_error("finalize wav", e))?;
    }
    Ok(cursor.into_inner())
}

fn wav_error(action: &str, e: hound::Error) -> VoiceError {
    VoiceError::Io(std::io::Error::other(format!("failed to {action}: {e}")))
}
