//! In-process fakes for the microphone, speaker and remote services.
//!
//! Every fake appends to a shared [`Log`] so tests can assert on the order
//! in which resources were touched.

use async_trait::async_trait;
use bytes::Bytes;
use murmur::audio::capture::{AudioInput, InputPreferences, InputStream};
use murmur::audio::decode::AudioClip;
use murmur::audio::encode::encode_wav;
use murmur::audio::playback::{AudioSink, PlaybackHandle};
use murmur::chat::ChatCollaborator;
use murmur::pipeline::messages::{AudioFrame, SpeechChunk, Transcript, UtteranceRecording};
use murmur::stt::TranscriptionClient;
use murmur::tts::{SynthesisClient, SynthesisRequest};
use murmur::{Result, SessionEvent, VoiceError, VoiceMessage};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

/// Ordered record of resource operations across all fakes.
#[derive(Clone, Default)]
pub(crate) struct Log(Arc<Mutex<Vec<String>>>);

impl Log {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Position of the first entry equal to `entry`.
    pub(crate) fn position(&self, entry: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == entry)
    }
}

// ── Microphone ────────────────────────────────────────────────────────────

/// Microphone that plays back a script of 100ms frames, one amplitude per frame.
pub(crate) struct FakeMic {
    pub(crate) script: Vec<f32>,
    pub(crate) samples_per_frame: usize,
    /// How long the device takes to open.
    pub(crate) open_delay: Duration,
    pub(crate) log: Log,
}

impl FakeMic {
    pub(crate) fn new(script: Vec<f32>, log: Log) -> Self {
        Self {
            script,
            samples_per_frame: 1_600,
            open_delay: Duration::ZERO,
            log,
        }
    }

    /// Half a second of silence, a second of speech, then silence.
    pub(crate) fn utterance(log: Log) -> Self {
        let mut script = vec![0.001; 5];
        script.extend(vec![0.3; 10]);
        script.extend(vec![0.001; 40]);
        Self::new(script, log)
    }
}

#[async_trait]
impl AudioInput for FakeMic {
    async fn open(&self, prefs: &InputPreferences) -> Result<InputStream> {
        self.log.push("mic.open");
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
            self.log.push("mic.ready");
        }
        let (tx, rx) = mpsc::channel(256);
        let script = self.script.clone();
        let len = self.samples_per_frame;
        let rate = prefs.sample_rate;
        tokio::spawn(async move {
            for amplitude in script {
                if tx.send(AudioFrame::new(vec![amplitude; len], rate)).await.is_err() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            tx.closed().await;
        });
        let log = self.log.clone();
        Ok(InputStream::new(rx, rate, move || log.push("mic.release")))
    }
}

// ── Speaker ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct SinkState {
    generation: u64,
    busy_until: Option<Instant>,
}

/// Speaker that queues clips back to back and "plays" each for its real
/// duration on the tokio clock.
///
/// Logs `sink.queue:i` when a clip is handed over and `sink.play:i` when it
/// becomes audible.
#[derive(Clone)]
pub(crate) struct FakeSink {
    log: Log,
    state: Arc<Mutex<SinkState>>,
    played: Arc<Mutex<Vec<(usize, i16)>>>,
}

impl FakeSink {
    pub(crate) fn new(log: Log) -> Self {
        Self {
            log,
            state: Arc::new(Mutex::new(SinkState::default())),
            played: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// `(chunk index, request tag)` for every clip that became audible, in order.
    pub(crate) fn played(&self) -> Vec<(usize, i16)> {
        self.played.lock().unwrap().clone()
    }

    pub(crate) fn played_indices(&self) -> Vec<usize> {
        self.played().into_iter().map(|(index, _)| index).collect()
    }

    fn started(log: &Log, played: &Mutex<Vec<(usize, i16)>>, index: usize, tag: i16) {
        played.lock().unwrap().push((index, tag));
        log.push(format!("sink.play:{index}"));
    }
}

impl AudioSink for FakeSink {
    fn play(&self, clip: AudioClip) -> Result<PlaybackHandle> {
        let tag = clip
            .samples
            .first()
            .map(|s| (s * 32_768.0).round() as i16)
            .unwrap_or_default();
        let index = clip.index;
        let now = Instant::now();
        let (generation, start, end) = {
            let mut state = self.state.lock().unwrap();
            let start = state.busy_until.filter(|t| *t > now).unwrap_or(now);
            let end = start + Duration::from_millis(clip.duration_ms());
            state.busy_until = Some(end);
            (state.generation, start, end)
        };
        self.log.push(format!("sink.queue:{index}"));
        if start == now {
            Self::started(&self.log, &self.played, index, tag);
        }

        let (done, handle) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let log = self.log.clone();
        let played = Arc::clone(&self.played);
        let current = move || state.lock().unwrap().generation == generation;
        tokio::spawn(async move {
            if start > now {
                tokio::time::sleep_until(start).await;
                if !current() {
                    return;
                }
                Self::started(&log, &played, index, tag);
            }
            tokio::time::sleep_until(end).await;
            if current() {
                let _ = done.send(Ok(()));
            }
        });
        Ok(handle)
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        state.busy_until = None;
        self.log.push("sink.stop");
    }
}

// ── Synthesis ─────────────────────────────────────────────────────────────

/// Synthesis service with scripted per-chunk latency and failures.
///
/// Each chunk is a WAV clip whose first sample encodes the request text
/// length, so tests can tell requests apart at the speaker.
#[derive(Clone)]
pub(crate) struct FakeSynth {
    pub(crate) total_chunks: usize,
    pub(crate) chunk_ms: u64,
    pub(crate) default_delay_ms: u64,
    pub(crate) delays_ms: HashMap<usize, u64>,
    pub(crate) failing: HashSet<usize>,
    pub(crate) panicking: HashSet<usize>,
    pub(crate) log: Log,
    pub(crate) arrivals: Arc<Mutex<Vec<usize>>>,
    pub(crate) languages: Arc<Mutex<Vec<Option<String>>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl FakeSynth {
    pub(crate) fn new(total_chunks: usize, log: Log) -> Self {
        Self {
            total_chunks,
            chunk_ms: 100,
            default_delay_ms: 10,
            delays_ms: HashMap::new(),
            failing: HashSet::new(),
            panicking: HashSet::new(),
            log,
            arrivals: Arc::new(Mutex::new(Vec::new())),
            languages: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Latency of every chunk without an explicit delay.
    pub(crate) fn with_default_delay(mut self, ms: u64) -> Self {
        self.default_delay_ms = ms;
        self
    }

    /// The fetch task for `index` panics after its delay.
    pub(crate) fn with_panic(mut self, index: usize) -> Self {
        self.panicking.insert(index);
        self
    }

    pub(crate) fn with_delay(mut self, index: usize, ms: u64) -> Self {
        self.delays_ms.insert(index, ms);
        self
    }

    pub(crate) fn with_failure(mut self, index: usize) -> Self {
        self.failing.insert(index);
        self
    }

    pub(crate) fn with_chunk_ms(mut self, ms: u64) -> Self {
        self.chunk_ms = ms;
        self
    }

    /// Indices in the order their responses completed.
    pub(crate) fn arrivals(&self) -> Vec<usize> {
        self.arrivals.lock().unwrap().clone()
    }

    /// Language field of every request seen.
    pub(crate) fn languages(&self) -> Vec<Option<String>> {
        self.languages.lock().unwrap().clone()
    }

    /// Most fetches ever running at once.
    pub(crate) fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Tag a request is recognizable by at the speaker.
pub(crate) fn request_tag(text: &str) -> i16 {
    text.len() as i16
}

#[async_trait]
impl SynthesisClient for FakeSynth {
    async fn fetch_chunk(&self, request: &SynthesisRequest, chunk_index: usize) -> Result<SpeechChunk> {
        self.log.push(format!("synth.fetch:{chunk_index}"));
        self.languages.lock().unwrap().push(request.language.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _in_flight = InFlight(Arc::clone(&self.in_flight));

        let delay = self
            .delays_ms
            .get(&chunk_index)
            .copied()
            .unwrap_or(self.default_delay_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        self.arrivals.lock().unwrap().push(chunk_index);

        if self.panicking.contains(&chunk_index) {
            panic!("synthesis fake blew up on chunk {chunk_index}");
        }

        if self.failing.contains(&chunk_index) {
            return Err(VoiceError::SynthesisFailed {
                chunk_index,
                reason: "HTTP 503".into(),
            });
        }
        let samples_len = (24 * self.chunk_ms) as usize;
        let mut samples = vec![0i16; samples_len.max(1)];
        samples[0] = request_tag(&request.text);
        let wav = encode_wav(&samples, 24_000)?;
        Ok(SpeechChunk {
            index: chunk_index,
            total_chunks: self.total_chunks,
            audio_bytes: Bytes::from(wav),
        })
    }
}

// ── Transcription / chat ──────────────────────────────────────────────────

pub(crate) struct FakeStt {
    pub(crate) text: String,
    pub(crate) delay: Duration,
    pub(crate) calls: AtomicUsize,
    pub(crate) log: Log,
}

impl FakeStt {
    pub(crate) fn new(text: &str, log: Log) -> Self {
        Self {
            text: text.to_owned(),
            delay: Duration::from_millis(200),
            calls: AtomicUsize::new(0),
            log,
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptionClient for FakeStt {
    async fn transcribe(
        &self,
        recording: UtteranceRecording,
        _language_hint: Option<&str>,
    ) -> Result<Transcript> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .push(format!("stt.transcribe:{}", recording.total_size_bytes));
        tokio::time::sleep(self.delay).await;
        Ok(Transcript {
            text: self.text.clone(),
            confidence: Some(0.9),
            detected_language: Some("en".into()),
        })
    }
}

pub(crate) struct FakeChat {
    pub(crate) reply: Option<String>,
    pub(crate) delay: Duration,
    pub(crate) received: Mutex<Vec<VoiceMessage>>,
}

impl FakeChat {
    pub(crate) fn replying(reply: Option<&str>) -> Self {
        Self {
            reply: reply.map(str::to_owned),
            delay: Duration::from_millis(50),
            received: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn received(&self) -> Vec<VoiceMessage> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatCollaborator for FakeChat {
    async fn send_message(&self, message: VoiceMessage) -> Result<Option<String>> {
        self.received.lock().unwrap().push(message);
        tokio::time::sleep(self.delay).await;
        Ok(self.reply.clone())
    }
}

// ── Events ────────────────────────────────────────────────────────────────

/// Collect events until one matches `done`, returning everything seen.
pub(crate) async fn collect_until(
    events: &mut broadcast::Receiver<SessionEvent>,
    done: impl Fn(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    let wait = async {
        loop {
            let event = events.recv().await.expect("session event stream closed");
            let finished = done(&event);
            seen.push(event);
            if finished {
                break;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(60), wait)
        .await
        .expect("timed out waiting for session event");
    seen
}

/// Index of the first event matching `pred`.
pub(crate) fn index_of(events: &[SessionEvent], pred: impl Fn(&SessionEvent) -> bool) -> usize {
    events
        .iter()
        .position(pred)
        .unwrap_or_else(|| panic!("event not found in {events:#?}"))
}
