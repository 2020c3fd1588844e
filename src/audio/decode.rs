//! Decoding synthesized chunk bytes into playable samples.

use crate::error::{Result, VoiceError};
use bytes::Bytes;
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Decoded mono audio for one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Chunk this clip was decoded from.
    pub index: usize,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioClip {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / u64::from(self.sample_rate)
    }
}

/// Decode an encoded chunk (mp3, wav, aac) to mono f32.
///
/// # Errors
///
/// Returns [`VoiceError::PlaybackFailed`] if the container or codec is not
/// recognized or the stream is corrupt.
pub fn decode_clip(index: usize, bytes: Bytes) -> Result<AudioClip> {
    let fail = |what: &str, e: SymphError| {
        VoiceError::PlaybackFailed(format!("chunk {index}: {what}: {e}"))
    };

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| fail("failed to probe audio", e))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| VoiceError::PlaybackFailed(format!("chunk {index}: no audio track")))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| VoiceError::PlaybackFailed(format!("chunk {index}: unknown sample rate")))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| fail("failed to create decoder", e))?;

    let mut out: Vec<f32> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<f32>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(fail("audio read error", e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphError::DecodeError(_)) => continue,
            Err(e) => return Err(fail("audio decode error", e)),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let frames = decoded.frames();
        let required = frames.saturating_mul(channels);
        let needs_new = sample_buf
            .as_ref()
            .is_none_or(|b| b.capacity() < required);
        if needs_new {
            sample_buf = Some(SampleBuffer::<f32>::new(frames as u64, spec));
        }
        let Some(buf) = sample_buf.as_mut() else {
            continue;
        };
        buf.clear();
        buf.copy_interleaved_ref(decoded);

        if channels == 1 {
            out.extend_from_slice(buf.samples());
        } else {
            out.extend(
                buf.samples()
                    .chunks_exact(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        }
    }

    Ok(AudioClip {
        index,
        samples: out,
        sample_rate,
    })
}
