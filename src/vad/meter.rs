//! Rolling loudness estimate over the live microphone stream.
//!
//! The capture worker publishes the most recent frame into a `watch`
//! channel; the meter samples that snapshot on its own cadence, so a slow
//! tick never backs up the audio path.

use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, EnergyReading};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tokio::time::Instant;
use tokio::sync::watch;

/// Spectrum size used for each snapshot.
const FFT_SIZE: usize = 1024;

/// Samples the latest frame and reports its RMS energy.
pub struct EnergyMeter {
    snapshot: watch::Receiver<Option<AudioFrame>>,
    started_at: Instant,
    fft: Arc<dyn Fft<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl EnergyMeter {
    /// Create a meter reading from `snapshot`, timestamping relative to `started_at`.
    pub fn new(snapshot: watch::Receiver<Option<AudioFrame>>, started_at: Instant) -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        Self {
            snapshot,
            started_at,
            fft,
            scratch: Vec::with_capacity(FFT_SIZE),
        }
    }

    /// Take one reading of the current snapshot.
    ///
    /// Returns zero energy until the first frame arrives.
    ///
    /// # Errors
    ///
    /// Returns [`VoiceError::Channel`] once the capture side has gone away.
    pub fn sample(&mut self) -> Result<EnergyReading> {
        if self.snapshot.has_changed().is_err() {
            return Err(VoiceError::Channel("audio stream closed".into()));
        }
        let timestamp = self.started_at.elapsed();
        let frame = self.snapshot.borrow_and_update().clone();
        let rms_energy = match frame {
            Some(frame) => self.spectral_rms(&frame.samples),
            None => 0.0,
        };
        Ok(EnergyReading::new(timestamp, rms_energy))
    }

    /// RMS computed from the frequency-domain snapshot.
    ///
    /// By Parseval, `sum |X_k|^2 = N * sum x_n^2`, so this equals the
    /// time-domain RMS of the (zero-padded) window rescaled to the number of
    /// real samples. Clamped to \[0, 1\].
    fn spectral_rms(&mut self, samples: &[f32]) -> f32 {
        let window = &samples[samples.len().saturating_sub(FFT_SIZE)..];
        if window.is_empty() {
            return 0.0;
        }
        self.scratch.clear();
        self.scratch
            .extend(window.iter().map(|&s| Complex::new(s, 0.0)));
        self.scratch.resize(FFT_SIZE, Complex::new(0.0, 0.0));
        self.fft.process(&mut self.scratch);

        let power: f32 = self.scratch.iter().map(|c| c.norm_sqr()).sum();
        let mean_square = power / (FFT_SIZE as f32 * window.len() as f32);
        mean_square.sqrt().clamp(0.0, 1.0)
    }
}
