//! Microphone access.
//!
//! [`AudioInput`] is the seam the capture session acquires the microphone
//! through; [`CpalInput`] is the real device. The cpal stream lives on a
//! dedicated thread and is dropped as soon as the returned [`InputStream`]
//! is released, so the OS microphone indicator turns off immediately.

use crate::audio::{resample, to_mono};
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::AudioFrame;
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

/// How the microphone should be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPreferences {
    /// Device name (None = system default).
    pub device: Option<String>,
    /// Rate frames are delivered at.
    pub sample_rate: u32,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Frame channel capacity; frames are dropped rather than blocking the audio thread.
    pub frame_channel_size: usize,
}

impl From<&AudioConfig> for InputPreferences {
    fn from(config: &AudioConfig) -> Self {
        Self {
            device: config.input_device.clone(),
            sample_rate: config.input_sample_rate,
            echo_cancellation: config.echo_cancellation,
            noise_suppression: config.noise_suppression,
            auto_gain_control: config.auto_gain_control,
            frame_channel_size: config.frame_channel_size,
        }
    }
}

/// Keeps the microphone open. Releasing or dropping it closes the device.
pub struct MicGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl MicGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the device now. Later calls do nothing.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

impl Drop for MicGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// An open microphone.
pub struct InputStream {
    /// Mono frames at `sample_rate`. Closes once the device is released.
    pub frames: mpsc::Receiver<AudioFrame>,
    pub sample_rate: u32,
    pub guard: MicGuard,
}

impl InputStream {
    /// Wrap a frame receiver; `release` runs exactly once when the guard is released or dropped.
    pub fn new(
        frames: mpsc::Receiver<AudioFrame>,
        sample_rate: u32,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            frames,
            sample_rate,
            guard: MicGuard::new(release),
        }
    }
}

/// Source of microphone audio.
#[async_trait]
pub trait AudioInput: Send + Sync + 'static {
    /// Acquire the microphone.
    ///
    /// # Errors
    ///
    /// [`VoiceError::PermissionDenied`] or [`VoiceError::DeviceUnavailable`].
    async fn open(&self, prefs: &InputPreferences) -> Result<InputStream>;
}

/// Audio capture from the system microphone via cpal.
///
/// Captures at the device's native sample rate and downsamples to the
/// requested rate for the encoder and the energy meter.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }

    /// List available input devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?;

        let mut names = Vec::new();
        for device in devices {
            if let Ok(desc) = device.description() {
                names.push(desc.name().to_owned());
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl AudioInput for CpalInput {
    async fn open(&self, prefs: &InputPreferences) -> Result<InputStream> {
        let (frame_tx, frame_rx) = mpsc::channel(prefs.frame_channel_size.max(1));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let thread_prefs = prefs.clone();

        std::thread::Builder::new()
            .name("murmur-mic".into())
            .spawn(move || run_input_thread(thread_prefs, frame_tx, ready_tx, stop_rx))
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot spawn capture thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(InputStream::new(frame_rx, prefs.sample_rate, move || {
                let _ = stop_tx.send(());
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(VoiceError::DeviceUnavailable(
                "capture thread exited before the stream opened".into(),
            )),
        }
    }
}

/// Owns the cpal stream until `stop_rx` fires or its sender is dropped.
fn run_input_thread(
    prefs: InputPreferences,
    frame_tx: mpsc::Sender<AudioFrame>,
    ready_tx: oneshot::Sender<Result<()>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) {
    let stream = match build_input_stream(&prefs, frame_tx) {
        Ok(stream) => stream,
        Err(e) => {
            error!("failed to open microphone: {e}");
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    if ready_tx.send(Ok(())).is_err() {
        debug!("microphone opened after the caller gave up; releasing");
        return;
    }

    // Blocks until released.
    let _ = stop_rx.recv();
    drop(stream);
    info!("microphone released");
}

fn build_input_stream(
    prefs: &InputPreferences,
    frame_tx: mpsc::Sender<AudioFrame>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();

    let device = if let Some(ref name) = prefs.device {
        host.input_devices()
            .map_err(|e| classify_device_error(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::DeviceUnavailable(format!("input device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("no default input device".into()))?
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());

    let default_config = device
        .default_input_config()
        .map_err(|e| classify_device_error(format!("no default input config: {e}")))?;
    let native_rate = default_config.sample_rate();
    let native_channels = default_config.channels();
    let stream_config = StreamConfig {
        channels: native_channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    // cpal has no DSP switches; these are satisfied (or not) by the OS input chain.
    debug!(
        "input processing requested: echo_cancellation={}, noise_suppression={}, auto_gain={}",
        prefs.echo_cancellation, prefs.noise_suppression, prefs.auto_gain_control
    );

    let target_rate = prefs.sample_rate;
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = to_mono(data, native_channels);
                let samples = resample(&mono, native_rate, target_rate);
                let frame = AudioFrame::new(samples, target_rate);
                // Never block the audio thread.
                if frame_tx.try_send(frame).is_err() {
                    debug!("audio channel full, dropping frame");
                }
            },
            move |err| {
                error!("audio input stream error: {err}");
            },
            None,
        )
        .map_err(|e| classify_device_error(format!("failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| classify_device_error(format!("failed to start input stream: {e}")))?;

    info!(
        "microphone acquired: {device_name}, native {}Hz x{} -> {}Hz mono",
        native_rate, native_channels, target_rate
    );
    Ok(stream)
}

/// Map a backend error message onto the capture error taxonomy.
fn classify_device_error(message: String) -> VoiceError {
    let lower = message.to_ascii_lowercase();
    let denied = ["permission", "denied", "not authorized", "unauthorized", "access"]
        .iter()
        .any(|needle| lower.contains(needle));
    if denied {
        VoiceError::PermissionDenied(message)
    } else {
        VoiceError::DeviceUnavailable(message)
    }
}
