//! Voice activity detection driving auto-stop.
//!
//! Classifies [`EnergyReading`]s against an RMS threshold and decides when an
//! utterance has ended: speech must have been heard, the grace period must
//! have elapsed, and silence must have lasted past the timeout. The decision
//! is debounced and fires at most once per utterance.

pub mod meter;

pub use meter::EnergyMeter;

use crate::config::VadConfig;
use crate::pipeline::messages::EnergyReading;
use std::time::Duration;
use tracing::{debug, info};

/// Transitions reported by [`SpeechActivityDetector::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// First reading above the threshold in this utterance.
    SpeechStarted,
    /// Silence qualified for auto-stop; the signal fires at `deadline`.
    AutoStopScheduled { deadline: Duration },
    /// Speech resumed before a scheduled auto-stop fired.
    AutoStopCancelled,
}

/// Energy-threshold speech/silence classifier with debounced auto-stop.
#[derive(Debug, Clone)]
pub struct SpeechActivityDetector {
    energy_threshold: f32,
    min_recording: Duration,
    silence_timeout: Duration,
    debounce: Duration,
    speech_ever_detected: bool,
    last_speech: Duration,
    pending_stop: Option<Duration>,
    fired: bool,
}

impl SpeechActivityDetector {
    pub fn new(config: &VadConfig) -> Self {
        info!(
            "VAD initialized: threshold={}, min_recording={}ms, silence_timeout={}ms, debounce={}ms",
            config.energy_threshold,
            config.min_recording_ms,
            config.silence_timeout_ms,
            config.debounce_ms
        );
        Self {
            energy_threshold: config.energy_threshold,
            min_recording: Duration::from_millis(config.min_recording_ms),
            silence_timeout: Duration::from_millis(config.silence_timeout_ms),
            debounce: Duration::from_millis(config.debounce_ms),
            speech_ever_detected: false,
            last_speech: Duration::ZERO,
            pending_stop: None,
            fired: false,
        }
    }

    /// Feed one reading. Readings must arrive in timestamp order.
    pub fn observe(&mut self, reading: EnergyReading) -> Option<VadEvent> {
        if self.fired {
            return None;
        }
        let now = reading.timestamp;

        if reading.rms_energy > self.energy_threshold {
            let first = !self.speech_ever_detected;
            self.speech_ever_detected = true;
            self.last_speech = now;
            if self.pending_stop.take().is_some() {
                debug!("speech resumed at {}ms, auto-stop cancelled", now.as_millis());
                return Some(VadEvent::AutoStopCancelled);
            }
            return first.then_some(VadEvent::SpeechStarted);
        }

        let silence = now.saturating_sub(self.last_speech);
        if now > self.min_recording
            && self.speech_ever_detected
            && silence > self.silence_timeout
            && self.pending_stop.is_none()
        {
            let deadline = now + self.debounce;
            self.pending_stop = Some(deadline);
            debug!(
                "silence for {}ms, auto-stop scheduled at {}ms",
                silence.as_millis(),
                deadline.as_millis()
            );
            return Some(VadEvent::AutoStopScheduled { deadline });
        }
        None
    }

    /// Fire the scheduled auto-stop if its deadline has passed.
    ///
    /// Returns `true` exactly once per utterance.
    pub fn poll_auto_stop(&mut self, now: Duration) -> bool {
        match self.pending_stop {
            Some(deadline) if !self.fired && now >= deadline => {
                self.pending_stop = None;
                self.fired = true;
                info!("auto-stop at {}ms", now.as_millis());
                true
            }
            _ => false,
        }
    }

    /// Deadline of the scheduled auto-stop, if any.
    pub fn pending_deadline(&self) -> Option<Duration> {
        self.pending_stop
    }

    pub fn speech_detected(&self) -> bool {
        self.speech_ever_detected
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Forget the current utterance.
    pub fn reset(&mut self) {
        self.speech_ever_detected = false;
        self.last_speech = Duration::ZERO;
        self.pending_stop = None;
        self.fired = false;
    }
}
