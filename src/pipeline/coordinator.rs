//! Voice session coordinator: the top-level state machine.
//!
//! All session state lives in one actor task. Callers talk to it through a
//! cloneable [`VoiceSession`] handle; capture workers, transcription tasks,
//! chat replies and playback runs report back on a single internal queue,
//! each completion tagged with the [`RequestId`] of the operation that
//! produced it. Anything tagged with an id that is no longer active is
//! dropped.
//!
//! Every new top-level operation first preempts whatever is active, so the
//! microphone and the speaker are never open at the same time.

use crate::audio::capture::{AudioInput, InputStream};
use crate::audio::playback::AudioSink;
use crate::chat::ChatCollaborator;
use crate::config::VoiceConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::capture::{CaptureSession, CaptureSignal};
use crate::pipeline::messages::{
    RequestId, RequestIds, SessionState, StopReason, Transcript, VoiceMessage,
};
use crate::pipeline::playback::{ChunkedPlaybackEngine, PlaybackEvent, PlaybackEventKind};
use crate::runtime::SessionEvent;
use crate::stt::TranscriptionClient;
use crate::tts::{LanguageDetector, ScriptLanguageDetector, SynthesisClient, SynthesisRequest};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMMAND_CHANNEL_SIZE: usize = 32;
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Builds and spawns a voice session.
pub struct VoiceSessionCoordinator {
    config: VoiceConfig,
    input: Arc<dyn AudioInput>,
    sink: Arc<dyn AudioSink>,
    stt: Arc<dyn TranscriptionClient>,
    tts: Arc<dyn SynthesisClient>,
    chat: Arc<dyn ChatCollaborator>,
    detector: Arc<dyn LanguageDetector>,
    event_capacity: usize,
}

impl VoiceSessionCoordinator {
    pub fn new(
        config: VoiceConfig,
        input: Arc<dyn AudioInput>,
        sink: Arc<dyn AudioSink>,
        stt: Arc<dyn TranscriptionClient>,
        tts: Arc<dyn SynthesisClient>,
        chat: Arc<dyn ChatCollaborator>,
    ) -> Self {
        Self {
            config,
            input,
            sink,
            stt,
            tts,
            chat,
            detector: Arc::new(ScriptLanguageDetector),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Replace the strategy used to pick a synthesis language when the
    /// config leaves it on auto.
    pub fn with_language_detector(mut self, detector: Arc<dyn LanguageDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Capacity of the event broadcast; slow subscribers lag past this.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Start the session actor on the current tokio runtime.
    pub fn spawn(self) -> VoiceSession {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(self.event_capacity);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);

        let actor = SessionActor {
            capture: CaptureSession::new(&self.config, self.input),
            playback: ChunkedPlaybackEngine::new(&self.config.synthesis, self.tts, self.sink),
            stt: self.stt,
            chat: self.chat,
            detector: self.detector,
            config: self.config,
            ids: RequestIds::new(),
            latest: None,
            active: Active::Idle,
            internal_tx,
            events: events_tx.clone(),
            state: state_tx,
        };
        tokio::spawn(actor.run(command_rx, internal_rx));
        info!("voice session started");

        VoiceSession {
            commands: command_tx,
            events: events_tx,
            state: state_rx,
        }
    }
}

/// Handle to a running voice session.
#[derive(Clone)]
pub struct VoiceSession {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Receiver<SessionState>,
}

impl VoiceSession {
    /// Start recording. Any playback or earlier recording is cancelled
    /// before the microphone is acquired. Resolves once the microphone is
    /// open; the session keeps serving other calls meanwhile.
    ///
    /// # Errors
    ///
    /// Microphone failures, [`VoiceError::Cancelled`] if another call
    /// preempts the acquisition, or [`VoiceError::Channel`] if the session
    /// is gone.
    pub async fn start_recording(&self) -> Result<RequestId> {
        self.request(|reply| Command::StartRecording { reply }).await?
    }

    /// Stop recording and hand the utterance to transcription. A no-op when
    /// nothing is recording.
    ///
    /// # Errors
    ///
    /// [`VoiceError::TooShort`] when the recording was rejected.
    pub async fn stop_recording(&self) -> Result<()> {
        self.request(|reply| Command::StopRecording { reply }).await?
    }

    /// Speak `text`. Returns `None` when speech is disabled or there is
    /// nothing to say.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Channel`] if the session is gone.
    pub async fn speak(&self, text: impl Into<String>) -> Result<Option<RequestId>> {
        let text = text.into();
        self.request(|reply| Command::Speak { text, reply }).await?
    }

    /// Stop speaking immediately.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Channel`] if the session is gone.
    pub async fn stop_speaking(&self) -> Result<()> {
        self.request(|reply| Command::StopSpeaking { reply }).await
    }

    /// Abandon whatever is in progress and return to idle.
    ///
    /// # Errors
    ///
    /// [`VoiceError::Channel`] if the session is gone.
    pub async fn cancel(&self) -> Result<()> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Release every resource and stop the actor.
    pub async fn shutdown(&self) {
        if self.request(|reply| Command::Shutdown { reply }).await.is_err() {
            debug!("voice session already shut down");
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Subscribe to session events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| VoiceError::Channel("voice session has shut down".into()))?;
        response
            .await
            .map_err(|_| VoiceError::Channel("voice session dropped the request".into()))
    }
}

enum Command {
    StartRecording {
        reply: oneshot::Sender<Result<RequestId>>,
    },
    StopRecording {
        reply: oneshot::Sender<Result<()>>,
    },
    Speak {
        text: String,
        reply: oneshot::Sender<Result<Option<RequestId>>>,
    },
    StopSpeaking {
        reply: oneshot::Sender<()>,
    },
    Cancel {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Completions reported back to the actor.
enum Internal {
    MicOpened {
        request_id: RequestId,
        result: Result<InputStream>,
    },
    Capture(CaptureSignal),
    Transcribed {
        request_id: RequestId,
        result: Result<Transcript>,
        audio_duration_ms: u64,
    },
    ChatReply {
        request_id: RequestId,
        result: Result<Option<String>>,
    },
    Playback(PlaybackEvent),
}

impl From<CaptureSignal> for Internal {
    fn from(signal: CaptureSignal) -> Self {
        Self::Capture(signal)
    }
}

/// The one operation that currently owns the session.
#[derive(Default)]
enum Active {
    #[default]
    Idle,
    Acquiring {
        request_id: RequestId,
        task: JoinHandle<()>,
        reply: oneshot::Sender<Result<RequestId>>,
    },
    Capturing {
        request_id: RequestId,
    },
    Transcribing {
        request_id: RequestId,
        task: JoinHandle<()>,
    },
    Playback {
        request_id: RequestId,
        speaking: bool,
        forwarder: JoinHandle<()>,
    },
}

struct SessionActor {
    config: VoiceConfig,
    capture: CaptureSession,
    playback: ChunkedPlaybackEngine,
    stt: Arc<dyn TranscriptionClient>,
    chat: Arc<dyn ChatCollaborator>,
    detector: Arc<dyn LanguageDetector>,
    ids: RequestIds,
    /// Most recent top-level operation; chat replies for anything older are stale.
    latest: Option<RequestId>,
    active: Active,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<SessionEvent>,
    state: watch::Sender<SessionState>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.preempt();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.preempt();
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
            }
        }
        info!("voice session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartRecording { reply } => self.start_recording(reply),
            Command::StopRecording { reply } => {
                let result = match self.active {
                    Active::Capturing { request_id } => {
                        self.finish_capture(request_id, StopReason::Manual).await
                    }
                    // Nothing recorded yet.
                    Active::Acquiring { .. } => {
                        self.preempt();
                        Ok(())
                    }
                    _ => Ok(()),
                };
                let _ = reply.send(result);
            }
            Command::Speak { text, reply } => {
                let _ = reply.send(Ok(self.speak(text)));
            }
            Command::StopSpeaking { reply } => {
                if matches!(self.active, Active::Playback { .. }) {
                    self.preempt();
                }
                let _ = reply.send(());
            }
            Command::Cancel { reply } => {
                self.preempt();
                let _ = reply.send(());
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::MicOpened { request_id, result } => self.on_mic_opened(request_id, result),
            Internal::Capture(CaptureSignal::SpeechDetected { request_id }) => {
                if self.is_capturing(request_id) {
                    self.emit(SessionEvent::SpeechDetected { request_id });
                }
            }
            Internal::Capture(CaptureSignal::StopRequested { request_id, reason }) => {
                if self.is_capturing(request_id) {
                    let _ = self.finish_capture(request_id, reason).await;
                } else {
                    debug!("{request_id}: ignoring stale stop request");
                }
            }
            Internal::Transcribed {
                request_id,
                result,
                audio_duration_ms,
            } => self.on_transcribed(request_id, result, audio_duration_ms),
            Internal::ChatReply { request_id, result } => self.on_chat_reply(request_id, result),
            Internal::Playback(event) => self.on_playback(event),
        }
    }

    fn is_capturing(&self, id: RequestId) -> bool {
        matches!(self.active, Active::Capturing { request_id } if request_id == id)
    }

    fn next_request(&mut self) -> RequestId {
        let id = self.ids.next_id();
        self.latest = Some(id);
        id
    }

    /// Preempt, then open the microphone on its own task. The caller is
    /// answered from [`SessionActor::on_mic_opened`].
    fn start_recording(&mut self, reply: oneshot::Sender<Result<RequestId>>) {
        self.preempt();
        let request_id = self.next_request();
        let acquire = self.capture.acquire();
        let events = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let result = acquire.await;
            let _ = events.send(Internal::MicOpened { request_id, result });
        });
        debug!("{request_id}: acquiring microphone");
        self.active = Active::Acquiring {
            request_id,
            task,
            reply,
        };
    }

    fn on_mic_opened(&mut self, request_id: RequestId, result: Result<InputStream>) {
        let reply = match std::mem::take(&mut self.active) {
            Active::Acquiring {
                request_id: id,
                reply,
                ..
            } if id == request_id => reply,
            other => {
                // Dropping the stale stream releases the device.
                self.active = other;
                debug!("{request_id}: discarding stale microphone");
                return;
            }
        };
        match self.capture.begin(request_id, result, self.internal_tx.clone()) {
            Ok(()) => {
                self.active = Active::Capturing { request_id };
                self.emit(SessionEvent::CaptureStarted { request_id });
                self.set_state(SessionState::Capturing);
                let _ = reply.send(Ok(request_id));
            }
            Err(e) => {
                self.fail(&e);
                let _ = reply.send(Err(e));
            }
        }
    }

    /// Stop the capture, then hand the recording to transcription.
    async fn finish_capture(&mut self, request_id: RequestId, reason: StopReason) -> Result<()> {
        self.active = Active::Idle;
        let stopped = self.capture.stop(reason).await;
        self.emit(SessionEvent::CaptureStopped { request_id, reason });
        let recording = match stopped {
            Ok(recording) => recording,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let stt = Arc::clone(&self.stt);
        let events = self.internal_tx.clone();
        let hint = self
            .config
            .transcription
            .language_hint()
            .map(str::to_owned);
        let timeout = Duration::from_millis(self.config.transcription.timeout_ms);
        let audio_duration_ms = recording.duration_ms;
        let task = tokio::spawn(async move {
            let result =
                match tokio::time::timeout(timeout, stt.transcribe(recording, hint.as_deref())).await {
                    Ok(result) => result,
                    Err(_) => Err(VoiceError::Timeout("transcription".into())),
                };
            let _ = events.send(Internal::Transcribed {
                request_id,
                result,
                audio_duration_ms,
            });
        });

        self.active = Active::Transcribing { request_id, task };
        self.set_state(SessionState::Transcribing);
        Ok(())
    }

    fn on_transcribed(&mut self, request_id: RequestId, result: Result<Transcript>, audio_duration_ms: u64) {
        if !matches!(self.active, Active::Transcribing { request_id: id, .. } if id == request_id) {
            debug!("{request_id}: discarding stale transcription");
            return;
        }
        self.active = Active::Idle;

        let transcript = match result {
            Ok(t) if t.text.trim().is_empty() => {
                self.fail(&VoiceError::TranscriptionFailed("no speech recognized".into()));
                return;
            }
            Ok(t) => t,
            Err(e) => {
                self.fail(&e);
                return;
            }
        };
        self.set_state(SessionState::Idle);

        let message = VoiceMessage {
            text: transcript.text,
            confidence: transcript.confidence,
            detected_language: transcript.detected_language,
            audio_duration_ms,
        };
        info!("{request_id}: transcribed {} chars", message.text.len());
        self.emit(SessionEvent::Transcribed {
            request_id,
            message: message.clone(),
        });

        let chat = Arc::clone(&self.chat);
        let events = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = chat.send_message(message).await;
            let _ = events.send(Internal::ChatReply { request_id, result });
        });
    }

    fn on_chat_reply(&mut self, request_id: RequestId, result: Result<Option<String>>) {
        let text = match result {
            Ok(Some(text)) => text,
            Ok(None) => return,
            Err(e) => {
                self.report(&e);
                return;
            }
        };
        let current = self.latest == Some(request_id) && matches!(self.active, Active::Idle);
        let spoken = self.config.session.auto_speak
            && self.config.session.tts_enabled
            && current
            && !text.trim().is_empty();
        if !current {
            debug!("{request_id}: reply arrived after a newer operation, not speaking it");
        }
        self.emit(SessionEvent::AssistantReply {
            request_id,
            text: text.clone(),
            spoken,
        });
        if spoken {
            self.speak(text);
        }
    }

    fn speak(&mut self, text: String) -> Option<RequestId> {
        if !self.config.session.tts_enabled || text.trim().is_empty() {
            debug!("nothing to speak");
            return None;
        }
        self.preempt();
        let request_id = self.next_request();
        let request = SynthesisRequest::from_config(text, &self.config.synthesis, self.detector.as_ref());
        info!(
            "{request_id}: speaking {} chars (voice={}, language={:?})",
            request.text.len(),
            request.voice,
            request.language
        );

        let mut stream = self.playback.speak(request, request_id);
        let events = self.internal_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if events.send(Internal::Playback(event)).is_err() {
                    break;
                }
            }
        });
        self.active = Active::Playback {
            request_id,
            speaking: false,
            forwarder,
        };
        self.set_state(SessionState::Synthesizing);
        Some(request_id)
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        let PlaybackEvent { request_id, kind } = event;
        let first_chunk = match &mut self.active {
            Active::Playback {
                request_id: id,
                speaking,
                ..
            } if *id == request_id => !std::mem::replace(speaking, true),
            _ => {
                debug!("{request_id}: discarding stale playback event");
                return;
            }
        };

        match kind {
            PlaybackEventKind::ChunkStarted { index, total } => {
                self.emit(SessionEvent::ChunkStarted {
                    request_id,
                    index,
                    total,
                });
                if first_chunk {
                    self.set_state(SessionState::Speaking);
                }
            }
            PlaybackEventKind::WaitingForChunk { index } => {
                self.emit(SessionEvent::WaitingForChunk { request_id, index });
            }
            PlaybackEventKind::Completed => {
                self.active = Active::Idle;
                self.emit(SessionEvent::PlaybackFinished { request_id });
                self.set_state(SessionState::Idle);
            }
            PlaybackEventKind::PartialPlayback { played, error } => {
                self.active = Active::Idle;
                self.emit(SessionEvent::PartialPlayback { request_id, played });
                self.fail(&error);
            }
            PlaybackEventKind::Failed(error) => {
                self.active = Active::Idle;
                self.fail(&error);
            }
        }
    }

    /// Cancel the active operation and release its resources before returning.
    fn preempt(&mut self) {
        match std::mem::take(&mut self.active) {
            Active::Idle => {}
            Active::Acquiring {
                request_id,
                task,
                reply,
            } => {
                // Aborting drops a half-opened stream, which releases it.
                task.abort();
                let _ = reply.send(Err(VoiceError::Cancelled));
                self.emit(SessionEvent::CaptureCancelled { request_id });
            }
            Active::Capturing { request_id } => {
                self.capture.cancel();
                self.emit(SessionEvent::CaptureCancelled { request_id });
            }
            Active::Transcribing { request_id, task } => {
                task.abort();
                self.emit(SessionEvent::TranscriptionCancelled { request_id });
            }
            Active::Playback {
                request_id,
                forwarder,
                ..
            } => {
                self.playback.cancel(request_id);
                forwarder.abort();
                self.emit(SessionEvent::PlaybackCancelled { request_id });
            }
        }
        self.set_state(SessionState::Idle);
    }

    /// Surface `error` and return to idle.
    fn fail(&mut self, error: &VoiceError) {
        self.report(error);
        self.active = Active::Idle;
        self.set_state(SessionState::Idle);
    }

    fn report(&self, error: &VoiceError) {
        if error.is_cancelled() {
            return;
        }
        warn!("voice session error [{}]: {error}", error.code());
        self.emit(SessionEvent::Error {
            code: error.code(),
            message: error.user_message(),
        });
    }

    fn set_state(&mut self, next: SessionState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!("session state -> {next}");
            self.emit(SessionEvent::StateChanged { state: next });
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
