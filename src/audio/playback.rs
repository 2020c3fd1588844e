//! Audio playback to system speakers via cpal.
//!
//! [`AudioSink`] is the speaker seam used by the chunked playback engine.
//! [`CpalSink`] keeps one output stream open for its whole lifetime on a
//! dedicated thread (streams are not `Send` on every platform). Clips are
//! appended to a shared queue that the output callback drains, so queued
//! clips play back to back without reopening the device.

use crate::audio::decode::AudioClip;
use crate::audio::resample;
use crate::config::AudioConfig;
use crate::error::{Result, VoiceError};
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Resolves with `Ok(())` once a clip has fully played, or with an error if
/// output failed. The sender is dropped (receiver errors) when stopped.
pub type PlaybackHandle = oneshot::Receiver<Result<()>>;

/// Exclusive speaker output.
pub trait AudioSink: Send + Sync + 'static {
    /// Queue `clip` to play right after everything already queued. Must not
    /// block.
    ///
    /// # Errors
    ///
    /// Returns an error if the output device cannot accept the clip.
    fn play(&self, clip: AudioClip) -> Result<PlaybackHandle>;

    /// Stop immediately and drop every queued clip.
    fn stop(&self);
}

struct QueuedClip {
    index: usize,
    samples: Vec<f32>,
    position: usize,
    done: oneshot::Sender<Result<()>>,
}

/// Clips waiting for the output callback, front one audible.
#[derive(Default)]
struct OutputQueue {
    clips: VecDeque<QueuedClip>,
    failed: Option<String>,
}

impl OutputQueue {
    /// Fill one callback buffer, completing clips as their last sample is
    /// written. Silence once the queue runs dry.
    fn render(&mut self, data: &mut [f32], channels: usize) {
        for frame in data.chunks_mut(channels) {
            let mut value = 0.0;
            while let Some(clip) = self.clips.front_mut() {
                if let Some(&sample) = clip.samples.get(clip.position) {
                    clip.position += 1;
                    value = sample;
                    if clip.position == clip.samples.len() {
                        self.finish_front();
                    }
                    break;
                }
                self.finish_front();
            }
            frame.fill(value);
        }
    }

    fn finish_front(&mut self) {
        if let Some(clip) = self.clips.pop_front() {
            debug!("chunk {} rendered", clip.index);
            let _ = clip.done.send(Ok(()));
        }
    }

    fn fail(&mut self, message: String) {
        for clip in self.clips.drain(..) {
            let _ = clip.done.send(Err(VoiceError::PlaybackFailed(message.clone())));
        }
        self.failed = Some(message);
    }
}

fn lock(queue: &Mutex<OutputQueue>) -> std::sync::MutexGuard<'_, OutputQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Speaker output through cpal.
pub struct CpalSink {
    queue: Arc<Mutex<OutputQueue>>,
    sample_rate: u32,
    // Dropping this ends the speaker thread and closes the stream.
    _shutdown: std::sync::mpsc::Sender<()>,
}

impl CpalSink {
    /// Open the output device and start the speaker thread.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the output
    /// stream cannot be started.
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let device = select_output_device(config.output_device.as_deref())?;
        let default_config = device
            .default_output_config()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("no default output config: {e}")))?;
        let stream_config = StreamConfig {
            channels: default_config.channels(),
            sample_rate: default_config.sample_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let device_name = device
            .description()
            .map(|d| d.name().to_owned())
            .unwrap_or_else(|_| "<unknown>".into());
        info!(
            "using output device: {device_name} ({}Hz x{})",
            stream_config.sample_rate, stream_config.channels
        );

        let sample_rate = stream_config.sample_rate;
        let queue = Arc::new(Mutex::new(OutputQueue::default()));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std::sync::mpsc::channel::<()>();
        let thread_queue = Arc::clone(&queue);
        std::thread::Builder::new()
            .name("murmur-speaker".into())
            .spawn(move || {
                let stream = match build_output_stream(&device, &stream_config, Arc::clone(&thread_queue)) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until the sink is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("speaker thread exiting");
            })
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot spawn speaker thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::DeviceUnavailable("speaker thread exited during setup".into()))?
            .map_err(VoiceError::DeviceUnavailable)?;

        Ok(Self {
            queue,
            sample_rate,
            _shutdown: shutdown_tx,
        })
    }

    /// List available output devices.
    ///
    /// # Errors
    ///
    /// Returns an error if devices cannot be enumerated.
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
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

impl AudioSink for CpalSink {
    fn play(&self, clip: AudioClip) -> Result<PlaybackHandle> {
        let samples = resample(&clip.samples, clip.sample_rate, self.sample_rate);
        let (done, handle) = oneshot::channel();
        let mut queue = lock(&self.queue);
        if let Some(reason) = &queue.failed {
            return Err(VoiceError::PlaybackFailed(reason.clone()));
        }
        queue.clips.push_back(QueuedClip {
            index: clip.index,
            samples,
            position: 0,
            done,
        });
        Ok(handle)
    }

    fn stop(&self) {
        let mut queue = lock(&self.queue);
        if !queue.clips.is_empty() {
            // Dropping the senders tells waiters the clips were cut off.
            queue.clips.clear();
            debug!("speaker stopped");
        }
    }
}

fn select_output_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        host.output_devices()
            .map_err(|e| VoiceError::DeviceUnavailable(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .map(|desc| desc.name() == name)
                    .unwrap_or(false)
            })
            .ok_or_else(|| VoiceError::DeviceUnavailable(format!("output device '{name}' not found")))
    } else {
        host.default_output_device()
            .ok_or_else(|| VoiceError::DeviceUnavailable("no default output device".into()))
    }
}

fn build_output_stream(
    device: &cpal::Device,
    stream_config: &StreamConfig,
    queue: Arc<Mutex<OutputQueue>>,
) -> std::result::Result<cpal::Stream, String> {
    let channels = stream_config.channels.max(1) as usize;
    let queue_err = Arc::clone(&queue);

    let stream = device
        .build_output_stream(
            stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                lock(&queue).render(data, channels);
            },
            move |err| {
                error!("audio output stream error: {err}");
                lock(&queue_err).fail(err.to_string());
            },
            None,
        )
        .map_err(|e| format!("failed to build output stream: {e}"))?;

    stream
        .play()
        .map_err(|e| format!("failed to start output stream: {e}"))?;
    Ok(stream)
}
