//! One utterance from microphone open to finished recording.
//!
//! [`CaptureSession`] owns the microphone guard. A worker task drains frames
//! into the WAV encoder, publishes the latest frame for the [`EnergyMeter`],
//! and runs the VAD on a fixed tick. When the VAD (or the length cap) decides
//! the utterance is over, the worker only *signals*; the owner decides when to
//! call [`CaptureSession::stop`].

use crate::audio::capture::{AudioInput, InputPreferences, InputStream, MicGuard};
use crate::audio::encode::{WAV_MIME_TYPE, WavEncoder};
use crate::config::{CaptureConfig, VadConfig, VoiceConfig};
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioFrame, RequestId, StopReason, UtteranceRecording};
use crate::vad::{EnergyMeter, SpeechActivityDetector, VadEvent};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Notifications raised by a running capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSignal {
    /// The VAD heard speech for the first time.
    SpeechDetected { request_id: RequestId },
    /// The utterance should end. Raised at most once per capture.
    StopRequested {
        request_id: RequestId,
        reason: StopReason,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Capturing,
    Failed,
}

struct ActiveCapture {
    request_id: RequestId,
    guard: MicGuard,
    stop_tx: oneshot::Sender<()>,
    worker: JoinHandle<WavEncoder>,
}

/// Microphone owner for one utterance at a time.
pub struct CaptureSession {
    input: Arc<dyn AudioInput>,
    prefs: InputPreferences,
    vad: VadConfig,
    limits: CaptureConfig,
    state: CaptureState,
    active: Option<ActiveCapture>,
}

impl CaptureSession {
    pub fn new(config: &VoiceConfig, input: Arc<dyn AudioInput>) -> Self {
        Self {
            input,
            prefs: InputPreferences::from(&config.audio),
            vad: config.vad.clone(),
            limits: config.capture.clone(),
            state: CaptureState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Request id of the running capture, if any.
    pub fn active_request(&self) -> Option<RequestId> {
        self.active.as_ref().map(|a| a.request_id)
    }

    /// Acquire the microphone and start recording.
    ///
    /// Signals for this capture are delivered on `signals`, tagged with
    /// `request_id`. A capture already running is cancelled first.
    ///
    /// # Errors
    ///
    /// [`VoiceError::PermissionDenied`], [`VoiceError::DeviceUnavailable`],
    /// or [`VoiceError::Timeout`] if the device does not open in time.
    pub async fn start<E>(&mut self, request_id: RequestId, signals: mpsc::UnboundedSender<E>) -> Result<()>
    where
        E: From<CaptureSignal> + Send + 'static,
    {
        self.cancel();
        let opened = self.acquire().await;
        self.begin(request_id, opened, signals)
    }

    /// Open the microphone under the acquisition timeout.
    ///
    /// The returned future borrows nothing from the session, so an owner can
    /// run it as its own task and keep serving other work meanwhile. Dropping
    /// it before it resolves releases whatever was acquired.
    pub fn acquire(&self) -> impl Future<Output = Result<InputStream>> + Send + 'static {
        let input = Arc::clone(&self.input);
        let prefs = self.prefs.clone();
        let limit = Duration::from_millis(self.limits.acquire_timeout_ms);
        async move {
            tokio::time::timeout(limit, input.open(&prefs))
                .await
                .map_err(|_| VoiceError::Timeout("microphone acquisition".into()))?
        }
    }

    /// Start recording from a stream produced by [`CaptureSession::acquire`].
    ///
    /// # Errors
    ///
    /// Passes through the acquisition error, leaving the session `Failed`.
    pub fn begin<E>(
        &mut self,
        request_id: RequestId,
        opened: Result<InputStream>,
        signals: mpsc::UnboundedSender<E>,
    ) -> Result<()>
    where
        E: From<CaptureSignal> + Send + 'static,
    {
        self.cancel();
        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                self.state = CaptureState::Failed;
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = CaptureWorker {
            request_id,
            vad: SpeechActivityDetector::new(&self.vad),
            tick: self.vad.tick(),
            max_recording: Duration::from_millis(self.limits.max_recording_ms),
            encoder: WavEncoder::new(stream.sample_rate),
        };
        let frames = stream.frames;
        let worker = tokio::spawn(worker.run(frames, stop_rx, signals));

        info!("{request_id}: capture started at {}Hz", stream.sample_rate);
        self.active = Some(ActiveCapture {
            request_id,
            guard: stream.guard,
            stop_tx,
            worker,
        });
        self.state = CaptureState::Capturing;
        Ok(())
    }

    /// Stop recording, release the microphone and return the recording.
    ///
    /// Only the first stop of a capture is honored; later calls return
    /// [`VoiceError::Cancelled`].
    ///
    /// # Errors
    ///
    /// [`VoiceError::TooShort`] when the encoded recording is below the
    /// configured floor.
    pub async fn stop(&mut self, reason: StopReason) -> Result<UtteranceRecording> {
        let Some(mut active) = self.active.take() else {
            return Err(VoiceError::Cancelled);
        };
        let request_id = active.request_id;
        let _ = active.stop_tx.send(());
        let joined = active.worker.await;
        active.guard.release();

        let encoder = match joined {
            Ok(encoder) => encoder,
            Err(e) => {
                self.state = CaptureState::Failed;
                return Err(VoiceError::Channel(format!("capture worker failed: {e}")));
            }
        };

        let size = encoder.encoded_len();
        if size < self.limits.min_audio_bytes {
            info!(
                "{request_id}: recording rejected ({size} bytes < {})",
                self.limits.min_audio_bytes
            );
            self.state = CaptureState::Failed;
            return Err(VoiceError::TooShort {
                size_bytes: size,
                min_bytes: self.limits.min_audio_bytes,
            });
        }

        let duration_ms = encoder.duration_ms();
        let bytes = match encoder.finish() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.state = CaptureState::Failed;
                return Err(e);
            }
        };
        info!(
            "{request_id}: capture stopped ({reason:?}), {duration_ms}ms, {} bytes",
            bytes.len()
        );
        self.state = CaptureState::Idle;
        Ok(UtteranceRecording {
            total_size_bytes: bytes.len(),
            bytes: Bytes::from(bytes),
            mime_type: WAV_MIME_TYPE.to_owned(),
            duration_ms,
        })
    }

    /// Abandon the running capture without producing a recording.
    ///
    /// The microphone is released before this returns.
    pub fn cancel(&mut self) -> Option<RequestId> {
        let mut active = self.active.take()?;
        active.guard.release();
        active.worker.abort();
        self.state = CaptureState::Idle;
        debug!("{}: capture cancelled", active.request_id);
        Some(active.request_id)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// State owned by the worker task of one capture.
struct CaptureWorker {
    request_id: RequestId,
    vad: SpeechActivityDetector,
    tick: Duration,
    max_recording: Duration,
    encoder: WavEncoder,
}

impl CaptureWorker {
    async fn run<E>(
        mut self,
        mut frames: mpsc::Receiver<AudioFrame>,
        mut stop_rx: oneshot::Receiver<()>,
        signals: mpsc::UnboundedSender<E>,
    ) -> WavEncoder
    where
        E: From<CaptureSignal> + Send + 'static,
    {
        let started_at = Instant::now();
        let (snapshot_tx, snapshot_rx) = watch::channel::<Option<AudioFrame>>(None);
        let mut meter = EnergyMeter::new(snapshot_rx, started_at);
        let mut ticker = tokio::time::interval_at(started_at + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let request_id = self.request_id;
        let signal = |s: CaptureSignal| {
            let _ = signals.send(E::from(s));
        };
        let mut stream_open = true;
        let mut stop_signalled = false;

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                frame = frames.recv(), if stream_open => {
                    match frame {
                        Some(frame) => {
                            self.encoder.push(&frame.samples);
                            snapshot_tx.send_replace(Some(frame));
                        }
                        None => {
                            stream_open = false;
                            if !stop_signalled {
                                warn!("{request_id}: microphone stream ended unexpectedly");
                                stop_signalled = true;
                                signal(CaptureSignal::StopRequested {
                                    request_id,
                                    reason: StopReason::Forced,
                                });
                            }
                        }
                    }
                }
                _ = ticker.tick(), if !stop_signalled => {
                    let reading = match meter.sample() {
                        Ok(reading) => reading,
                        Err(e) => {
                            debug!("{request_id}: energy meter stopped: {e}");
                            continue;
                        }
                    };
                    if let Some(VadEvent::SpeechStarted) = self.vad.observe(reading) {
                        signal(CaptureSignal::SpeechDetected { request_id });
                    }
                    let reason = if self.vad.poll_auto_stop(reading.timestamp) {
                        Some(StopReason::AutoDetected)
                    } else if reading.timestamp >= self.max_recording {
                        info!(
                            "{request_id}: recording reached {}ms cap",
                            self.max_recording.as_millis()
                        );
                        Some(StopReason::Forced)
                    } else {
                        None
                    };
                    if let Some(reason) = reason {
                        stop_signalled = true;
                        signal(CaptureSignal::StopRequested { request_id, reason });
                    }
                }
            }
        }

        // Keep whatever is already buffered.
        while let Ok(frame) = frames.try_recv() {
            self.encoder.push(&frame.samples);
        }
        self.encoder
    }
}
