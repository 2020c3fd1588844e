//! End-to-end session scenarios against in-process fakes.

use crate::helpers::{FakeChat, FakeMic, FakeSink, FakeStt, FakeSynth, Log, collect_until, index_of};
use murmur::{SessionEvent, SessionState, StopReason, VoiceConfig, VoiceError, VoiceSession, VoiceSessionCoordinator};
use murmur::tts::LanguageDetector;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct Harness {
    session: VoiceSession,
    log: Log,
    sink: FakeSink,
    stt: Arc<FakeStt>,
    chat: Arc<FakeChat>,
}

fn harness(config: VoiceConfig, mic: FakeMic, synth: FakeSynth, chat: FakeChat) -> Harness {
    let log = mic.log.clone();
    let sink = FakeSink::new(log.clone());
    let stt = Arc::new(FakeStt::new("what does the report conclude", log.clone()));
    let chat = Arc::new(chat);
    let session = VoiceSessionCoordinator::new(
        config,
        Arc::new(mic),
        Arc::new(sink.clone()),
        Arc::clone(&stt) as Arc<dyn murmur::stt::TranscriptionClient>,
        Arc::new(synth),
        Arc::clone(&chat) as Arc<dyn murmur::ChatCollaborator>,
    )
    .spawn();
    Harness {
        session,
        log,
        sink,
        stt,
        chat,
    }
}

fn is_state(state: SessionState) -> impl Fn(&SessionEvent) -> bool {
    move |e| matches!(e, SessionEvent::StateChanged { state: s } if *s == state)
}

#[tokio::test(start_paused = true)]
async fn recording_preempts_playback_before_opening_the_mic() {
    let log = Log::default();
    let synth = FakeSynth::new(3, log.clone()).with_chunk_ms(2_000);
    let h = harness(
        VoiceConfig::default(),
        FakeMic::utterance(log.clone()),
        synth,
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    h.session.speak("a long answer about the quarterly report").await.unwrap();
    collect_until(&mut events, is_state(SessionState::Speaking)).await;

    h.session.start_recording().await.unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::CaptureStarted { .. })).await;

    let cancelled = index_of(&seen, |e| matches!(e, SessionEvent::PlaybackCancelled { .. }));
    let started = index_of(&seen, |e| matches!(e, SessionEvent::CaptureStarted { .. }));
    assert!(cancelled < started);
    assert!(h.log.position("sink.stop").unwrap() < h.log.position("mic.open").unwrap());
    assert_eq!(h.session.state(), SessionState::Capturing);
}

#[tokio::test(start_paused = true)]
async fn auto_stop_transcribes_and_hands_off_to_chat() {
    let log = Log::default();
    let h = harness(
        VoiceConfig::default(),
        FakeMic::utterance(log.clone()),
        FakeSynth::new(1, log.clone()),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    let request_id = h.session.start_recording().await.unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::Transcribed { .. })).await;

    let stopped = index_of(&seen, |e| {
        matches!(
            e,
            SessionEvent::CaptureStopped {
                reason: StopReason::AutoDetected,
                ..
            }
        )
    });
    let speech = index_of(&seen, |e| matches!(e, SessionEvent::SpeechDetected { .. }));
    let transcribing = index_of(&seen, is_state(SessionState::Transcribing));
    assert!(speech < stopped && stopped < transcribing);

    match seen.last() {
        Some(SessionEvent::Transcribed {
            request_id: id,
            message,
        }) => {
            assert_eq!(*id, request_id);
            assert_eq!(message.text, "what does the report conclude");
            assert_eq!(message.detected_language.as_deref(), Some("en"));
            assert!(message.audio_duration_ms >= 2_500);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(h.log.position("mic.release").unwrap() < h.log.entries().iter().position(|e| e.starts_with("stt.transcribe")).unwrap());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.chat.received().len(), 1);
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn tiny_recording_is_rejected_without_transcription() {
    let log = Log::default();
    let mut mic = FakeMic::new(vec![0.2], log.clone());
    // 228 samples -> 500 byte WAV.
    mic.samples_per_frame = 228;
    let h = harness(
        VoiceConfig::default(),
        mic,
        FakeSynth::new(1, log.clone()),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    h.session.start_recording().await.unwrap();
    let err = h.session.stop_recording().await.unwrap_err();

    assert!(matches!(err, VoiceError::TooShort { min_bytes: 2_000, .. }));
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert!(matches!(seen.last(), Some(SessionEvent::Error { code: "TOO_SHORT", .. })));
    assert_eq!(h.stt.calls(), 0);
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.log.position("mic.release").is_some());
}

#[tokio::test(start_paused = true)]
async fn speaking_cancels_an_active_recording() {
    let log = Log::default();
    let h = harness(
        VoiceConfig::default(),
        FakeMic::utterance(log.clone()),
        FakeSynth::new(2, log.clone()),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    h.session.start_recording().await.unwrap();
    h.session.speak("interrupting").await.unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::PlaybackFinished { .. })).await;

    let cancelled = index_of(&seen, |e| matches!(e, SessionEvent::CaptureCancelled { .. }));
    let synthesizing = index_of(&seen, is_state(SessionState::Synthesizing));
    assert!(cancelled < synthesizing);
    assert!(h.log.position("mic.release").unwrap() < h.log.position("synth.fetch:0").unwrap());
    assert_eq!(h.stt.calls(), 0);
    assert_eq!(h.sink.played_indices(), vec![0, 1]);
}

#[tokio::test(start_paused = true)]
async fn speak_walks_through_synthesizing_and_speaking() {
    let log = Log::default();
    let h = harness(
        VoiceConfig::default(),
        FakeMic::utterance(log.clone()),
        FakeSynth::new(3, log.clone()),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    let id = h.session.speak("three chunk answer").await.unwrap().unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::PlaybackFinished { .. })).await;

    let states: Vec<SessionState> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { state } => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![SessionState::Synthesizing, SessionState::Speaking]);
    let chunks: Vec<usize> = seen
        .iter()
        .filter_map(|e| match e {
            SessionEvent::ChunkStarted { request_id, index, total } => {
                assert_eq!(*request_id, id);
                assert_eq!(*total, 3);
                Some(*index)
            }
            _ => None,
        })
        .collect();
    assert_eq!(chunks, vec![0, 1, 2]);

    collect_until(&mut events, is_state(SessionState::Idle)).await;
    assert_eq!(h.session.state(), SessionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn partial_playback_surfaces_error_and_returns_idle() {
    let log = Log::default();
    let h = harness(
        VoiceConfig::default(),
        FakeMic::utterance(log.clone()),
        FakeSynth::new(3, log.clone()).with_failure(1),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    h.session.speak("fails halfway").await.unwrap();
    let seen = collect_until(&mut events, is_state(SessionState::Idle)).await;

    assert!(seen.iter().any(|e| matches!(e, SessionEvent::PartialPlayback { played: 1, .. })));
    assert!(seen.iter().any(|e| matches!(
        e,
        SessionEvent::Error { code: "SYNTHESIS_FAILED", message } if message.contains("stopped early")
    )));
    assert_eq!(h.sink.played_indices(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn stop_speaking_is_not_reported_as_an_error() {
    let log = Log::default();
    let h = harness(
        VoiceConfig::default(),
        FakeMic::utterance(log.clone()),
        FakeSynth::new(2, log.clone()).with_chunk_ms(3_000),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    h.session.speak("long").await.unwrap();
    collect_until(&mut events, is_state(SessionState::Speaking)).await;
    h.session.stop_speaking().await.unwrap();
    let seen = collect_until(&mut events, is_state(SessionState::Idle)).await;

    assert!(seen.iter().any(|e| matches!(e, SessionEvent::PlaybackCancelled { .. })));
    tokio::time::sleep(Duration::from_secs(10)).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Error { .. }), "unexpected {event:?}");
    }
    assert_eq!(h.sink.played_indices(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn auto_speak_reads_the_reply_aloud() {
    let log = Log::default();
    let mut config = VoiceConfig::default();
    config.session.auto_speak = true;
    let h = harness(
        config,
        FakeMic::utterance(log.clone()),
        FakeSynth::new(2, log.clone()),
        FakeChat::replying(Some("The report concludes revenue grew.")),
    );
    let mut events = h.session.subscribe();

    h.session.start_recording().await.unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::PlaybackFinished { .. })).await;

    assert!(seen.iter().any(|e| matches!(e, SessionEvent::AssistantReply { spoken: true, .. })));
    assert_eq!(h.sink.played_indices(), vec![0, 1]);
    assert!(h.log.position("mic.release").unwrap() < h.log.position("sink.play:0").unwrap());
}

#[tokio::test(start_paused = true)]
async fn stale_reply_is_not_spoken() {
    let log = Log::default();
    let mut config = VoiceConfig::default();
    config.session.auto_speak = true;
    let mut chat = FakeChat::replying(Some("late answer"));
    chat.delay = Duration::from_secs(5);
    let h = harness(
        config,
        FakeMic::utterance(log.clone()),
        FakeSynth::new(1, log.clone()),
        chat,
    );
    let mut events = h.session.subscribe();

    h.session.start_recording().await.unwrap();
    collect_until(&mut events, |e| matches!(e, SessionEvent::Transcribed { .. })).await;
    // The user moves on before the reply arrives.
    h.session.start_recording().await.unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::AssistantReply { .. })).await;

    assert!(matches!(
        seen.last(),
        Some(SessionEvent::AssistantReply { spoken: false, .. })
    ));
    assert!(h.sink.played().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transcription_timeout_returns_to_idle() {
    let log = Log::default();
    let mut config = VoiceConfig::default();
    config.transcription.timeout_ms = 100;
    let h = harness(
        config,
        FakeMic::utterance(log.clone()),
        FakeSynth::new(1, log.clone()),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    h.session.start_recording().await.unwrap();
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::Error { .. })).await;

    assert!(matches!(seen.last(), Some(SessionEvent::Error { code: "TIMEOUT", .. })));
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.chat.received().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disabled_speech_and_blank_text_are_no_ops() {
    let log = Log::default();
    let mut config = VoiceConfig::default();
    config.session.tts_enabled = false;
    let h = harness(
        config,
        FakeMic::utterance(log.clone()),
        FakeSynth::new(1, log.clone()),
        FakeChat::replying(None),
    );

    assert_eq!(h.session.speak("hello").await.unwrap(), None);
    assert_eq!(h.session.speak("   ").await.unwrap(), None);
    assert_eq!(h.session.state(), SessionState::Idle);
    assert!(h.log.entries().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_the_microphone() {
    let log = Log::default();
    let h = harness(
        VoiceConfig::default(),
        FakeMic::utterance(log.clone()),
        FakeSynth::new(1, log.clone()),
        FakeChat::replying(None),
    );

    h.session.start_recording().await.unwrap();
    h.session.shutdown().await;

    assert!(h.log.position("mic.release").is_some());
    assert!(matches!(
        h.session.start_recording().await,
        Err(VoiceError::Channel(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn cancel_does_not_wait_for_a_slow_microphone() {
    let log = Log::default();
    let mut mic = FakeMic::utterance(log.clone());
    mic.open_delay = Duration::from_secs(4);
    let h = harness(
        VoiceConfig::default(),
        mic,
        FakeSynth::new(1, log.clone()),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    let session = h.session.clone();
    let pending = tokio::spawn(async move { session.start_recording().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let asked = Instant::now();
    h.session.cancel().await.unwrap();
    assert!(asked.elapsed() < Duration::from_millis(50), "cancel took {:?}", asked.elapsed());
    assert!(matches!(pending.await.unwrap(), Err(VoiceError::Cancelled)));

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.log.position("mic.open").is_some());
    assert!(h.log.position("mic.ready").is_none());
    assert_eq!(h.session.state(), SessionState::Idle);
    let seen: Vec<_> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::CaptureCancelled { .. })));
    assert!(!seen.iter().any(|e| matches!(e, SessionEvent::CaptureStarted { .. })));
}

#[tokio::test(start_paused = true)]
async fn speak_takes_over_while_the_microphone_is_opening() {
    let log = Log::default();
    let mut mic = FakeMic::utterance(log.clone());
    mic.open_delay = Duration::from_secs(4);
    let h = harness(
        VoiceConfig::default(),
        mic,
        FakeSynth::new(1, log.clone()),
        FakeChat::replying(None),
    );
    let mut events = h.session.subscribe();

    let session = h.session.clone();
    let pending = tokio::spawn(async move { session.start_recording().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let asked = Instant::now();
    assert!(h.session.speak("right away").await.unwrap().is_some());
    let seen = collect_until(&mut events, |e| matches!(e, SessionEvent::PlaybackFinished { .. })).await;
    assert!(asked.elapsed() < Duration::from_secs(1));
    assert!(matches!(pending.await.unwrap(), Err(VoiceError::Cancelled)));
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::CaptureCancelled { .. })));
    assert_eq!(h.sink.played_indices(), vec![0]);
    assert!(h.log.position("mic.ready").is_none());
}

#[tokio::test(start_paused = true)]
async fn stop_recording_abandons_a_pending_acquisition() {
    let log = Log::default();
    let mut mic = FakeMic::utterance(log.clone());
    mic.open_delay = Duration::from_secs(4);
    let h = harness(
        VoiceConfig::default(),
        mic,
        FakeSynth::new(1, log.clone()),
        FakeChat::replying(None),
    );

    let session = h.session.clone();
    let pending = tokio::spawn(async move { session.start_recording().await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    h.session.stop_recording().await.unwrap();
    assert!(matches!(pending.await.unwrap(), Err(VoiceError::Cancelled)));
    assert_eq!(h.stt.calls(), 0);
    assert_eq!(h.session.state(), SessionState::Idle);
}

struct FixedLanguage(&'static str);

impl LanguageDetector for FixedLanguage {
    fn detect(&self, _text: &str) -> Option<&'static str> {
        Some(self.0)
    }
}

#[tokio::test(start_paused = true)]
async fn custom_language_detector_picks_the_synthesis_language() {
    let log = Log::default();
    let synth = FakeSynth::new(2, log.clone());
    let sink = FakeSink::new(log.clone());
    let session = VoiceSessionCoordinator::new(
        VoiceConfig::default(),
        Arc::new(FakeMic::utterance(log.clone())),
        Arc::new(sink.clone()),
        Arc::new(FakeStt::new("unused", log.clone())),
        Arc::new(synth.clone()),
        Arc::new(FakeChat::replying(None)),
    )
    .with_language_detector(Arc::new(FixedLanguage("fr")))
    .spawn();
    let mut events = session.subscribe();

    session.speak("hello there").await.unwrap();
    collect_until(&mut events, |e| matches!(e, SessionEvent::PlaybackFinished { .. })).await;

    assert_eq!(synth.languages(), vec![Some("fr".to_owned()); 2]);
    assert_eq!(sink.played_indices(), vec![0, 1]);
}
