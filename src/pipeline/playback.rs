//! Chunked speech playback.
//!
//! Chunk 0 is fetched first and starts playing as soon as it decodes; the
//! remaining chunks are fetched concurrently in the background, a bounded
//! window at a time. Arrival order is arbitrary, playback order is not:
//! [`PlaybackQueue`] only admits a chunk once every lower index has been
//! admitted, and admitted clips are queued on the sink in that order so
//! consecutive chunks play back to back.

use crate::audio::decode::{AudioClip, decode_clip};
use crate::audio::playback::{AudioSink, PlaybackHandle};
use crate::config::SynthesisConfig;
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::RequestId;
use crate::tts::{SynthesisClient, SynthesisRequest};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress of one speech run.
#[derive(Debug)]
pub struct PlaybackEvent {
    pub request_id: RequestId,
    pub kind: PlaybackEventKind,
}

#[derive(Debug)]
pub enum PlaybackEventKind {
    /// Chunk `index` of `total` began playing.
    ChunkStarted { index: usize, total: usize },
    /// The previous chunk ended but chunk `index` has not arrived yet.
    WaitingForChunk { index: usize },
    /// Every chunk played.
    Completed,
    /// A trailing chunk failed; the first `played` chunks were heard.
    PartialPlayback { played: usize, error: VoiceError },
    /// Nothing could be played.
    Failed(VoiceError),
}

/// Events of one run. Closes when the run ends or is cancelled.
pub type PlaybackStream = mpsc::UnboundedReceiver<PlaybackEvent>;

/// Reorder buffer between chunk arrival and playback.
#[derive(Debug, Default)]
pub struct PlaybackQueue {
    arrived: BTreeMap<usize, Result<AudioClip>>,
    pending: VecDeque<AudioClip>,
    next_index: usize,
    failure: Option<VoiceError>,
}

impl PlaybackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome for chunk `index`, then admit every chunk that is
    /// now contiguous with what was already admitted.
    pub fn insert(&mut self, index: usize, result: Result<AudioClip>) {
        if index < self.next_index || self.failure.is_some() {
            return;
        }
        self.arrived.insert(index, result);
        while let Some(result) = self.arrived.remove(&self.next_index) {
            match result {
                Ok(clip) => {
                    self.pending.push_back(clip);
                    self.next_index += 1;
                }
                Err(e) => {
                    self.failure = Some(e);
                    self.arrived.clear();
                    break;
                }
            }
        }
    }

    /// Next chunk to play, in index order.
    pub fn pop_front(&mut self) -> Option<AudioClip> {
        self.pending.pop_front()
    }

    /// The failure blocking the next index, once everything before it has
    /// been played.
    pub fn take_failure(&mut self) -> Option<VoiceError> {
        if self.pending.is_empty() {
            self.failure.take()
        } else {
            None
        }
    }

    /// Chunks that arrived ahead of a gap and are waiting for it to fill.
    pub fn held(&self) -> usize {
        self.arrived.len()
    }
}

struct ActiveRun {
    request_id: RequestId,
    cancel: CancellationToken,
    sink_gate: Arc<Mutex<()>>,
    task: JoinHandle<()>,
}

/// Plays one synthesized response at a time.
pub struct ChunkedPlaybackEngine {
    synth: Arc<dyn SynthesisClient>,
    sink: Arc<dyn AudioSink>,
    chunk_timeout: Duration,
    max_parallel_fetches: usize,
    max_chunks: usize,
    active: Option<ActiveRun>,
}

impl ChunkedPlaybackEngine {
    pub fn new(config: &SynthesisConfig, synth: Arc<dyn SynthesisClient>, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            synth,
            sink,
            chunk_timeout: config.chunk_timeout(),
            max_parallel_fetches: config.max_parallel_fetches.max(1),
            max_chunks: config.max_chunks.max(1),
            active: None,
        }
    }

    /// Request id of the run in progress, if any.
    pub fn active_request(&self) -> Option<RequestId> {
        self.active
            .as_ref()
            .filter(|run| !run.task.is_finished())
            .map(|run| run.request_id)
    }

    /// Start speaking `request`. Any run in progress is cancelled first.
    pub fn speak(&mut self, request: SynthesisRequest, request_id: RequestId) -> PlaybackStream {
        self.cancel_active();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink_gate = Arc::new(Mutex::new(()));
        let run = PlaybackRun {
            request_id,
            request: Arc::new(request),
            synth: Arc::clone(&self.synth),
            sink: Arc::clone(&self.sink),
            chunk_timeout: self.chunk_timeout,
            max_parallel_fetches: self.max_parallel_fetches,
            max_chunks: self.max_chunks,
            sink_gate: Arc::clone(&sink_gate),
            cancel: cancel.clone(),
            events: events_tx,
        };
        let task = tokio::spawn(run.run());
        self.active = Some(ActiveRun {
            request_id,
            cancel,
            sink_gate,
            task,
        });
        events_rx
    }

    /// Cancel `request_id` if it is the active run. Audio stops before this
    /// returns; in-flight fetches are aborted and their results ignored.
    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        if self.active.as_ref().map(|run| run.request_id) != Some(request_id) {
            return false;
        }
        self.cancel_active().is_some()
    }

    /// Cancel whatever run is active.
    pub fn cancel_active(&mut self) -> Option<RequestId> {
        let run = self.active.take()?;
        {
            // A run hands clips to the sink under the same lock, so nothing
            // from it can be queued after this stop.
            let _gate = run.sink_gate.lock().unwrap_or_else(PoisonError::into_inner);
            run.cancel.cancel();
            self.sink.stop();
        }
        run.task.abort();
        info!("{}: playback cancelled", run.request_id);
        Some(run.request_id)
    }
}

impl Drop for ChunkedPlaybackEngine {
    fn drop(&mut self) {
        self.cancel_active();
    }
}

/// Everything a spawned run owns.
struct PlaybackRun {
    request_id: RequestId,
    request: Arc<SynthesisRequest>,
    synth: Arc<dyn SynthesisClient>,
    sink: Arc<dyn AudioSink>,
    chunk_timeout: Duration,
    max_parallel_fetches: usize,
    max_chunks: usize,
    sink_gate: Arc<Mutex<()>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

impl PlaybackRun {
    fn emit(&self, kind: PlaybackEventKind) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(PlaybackEvent {
            request_id: self.request_id,
            kind,
        });
    }

    /// Queue `clip` on the sink. `None` once the run has been cancelled.
    fn enqueue(&self, clip: AudioClip) -> Option<Result<PlaybackHandle>> {
        let _gate = self.sink_gate.lock().unwrap_or_else(PoisonError::into_inner);
        if self.cancel.is_cancelled() {
            return None;
        }
        Some(self.sink.play(clip))
    }

    async fn run(self) {
        let request_id = self.request_id;
        let first = tokio::select! {
            () = self.cancel.cancelled() => return,
            first = fetch_clip(
                Arc::clone(&self.synth),
                Arc::clone(&self.request),
                0,
                self.chunk_timeout,
            ) => first,
        };
        let (total, first_clip) = match first {
            Ok(first) => first,
            Err(e) => {
                warn!("{request_id}: first chunk failed: {e}");
                self.emit(PlaybackEventKind::Failed(e));
                return;
            }
        };
        if total > self.max_chunks {
            warn!("{request_id}: service reported {total} chunks, limit is {}", self.max_chunks);
            self.emit(PlaybackEventKind::Failed(VoiceError::SynthesisFailed {
                chunk_index: 0,
                reason: format!("response has {total} chunks, limit is {}", self.max_chunks),
            }));
            return;
        }
        info!("{request_id}: speaking {total} chunk(s)");

        let mut queue = PlaybackQueue::new();
        queue.insert(0, Ok(first_clip));

        // Dropping the fetches aborts whatever is still downloading.
        let mut fetches = ChunkFetches::new(total, self.max_parallel_fetches);
        // Clips handed to the sink, front one audible.
        let mut playing: VecDeque<(usize, PlaybackHandle)> = VecDeque::new();
        let mut played = 0usize;
        let mut waiting_for: Option<usize> = None;

        loop {
            fetches.fill(&self, queue.held());

            while let Some(clip) = queue.pop_front() {
                let index = clip.index;
                let handle = match self.enqueue(clip) {
                    None => return,
                    Some(Ok(handle)) => handle,
                    Some(Err(e)) => {
                        self.emit(PlaybackEventKind::Failed(e));
                        return;
                    }
                };
                if playing.is_empty() {
                    waiting_for = None;
                    debug!("{request_id}: playing chunk {index}/{total}");
                    self.emit(PlaybackEventKind::ChunkStarted { index, total });
                }
                playing.push_back((index, handle));
            }

            if playing.is_empty() {
                if let Some(error) = queue.take_failure() {
                    warn!("{request_id}: stopping after {played} of {total} chunks: {error}");
                    self.emit(PlaybackEventKind::PartialPlayback { played, error });
                    return;
                } else if played == total {
                    info!("{request_id}: playback complete");
                    self.emit(PlaybackEventKind::Completed);
                    return;
                } else if waiting_for != Some(played) {
                    waiting_for = Some(played);
                    debug!("{request_id}: waiting for chunk {played}");
                    self.emit(PlaybackEventKind::WaitingForChunk { index: played });
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return,
                finished = wait_for_front(&mut playing) => {
                    playing.pop_front();
                    match finished {
                        Ok(Ok(())) => {
                            played += 1;
                            if let Some(&(index, _)) = playing.front() {
                                debug!("{request_id}: playing chunk {index}/{total}");
                                self.emit(PlaybackEventKind::ChunkStarted { index, total });
                            }
                        }
                        Ok(Err(e)) => {
                            self.emit(PlaybackEventKind::Failed(e));
                            return;
                        }
                        Err(_) => {
                            if !self.cancel.is_cancelled() {
                                self.emit(PlaybackEventKind::Failed(VoiceError::PlaybackFailed(
                                    "audio output stopped unexpectedly".into(),
                                )));
                            }
                            return;
                        }
                    }
                }
                Some((index, result)) = fetches.join_next() => {
                    if let Err(e) = &result {
                        debug!("{request_id}: chunk {index} failed: {e}");
                    }
                    queue.insert(index, result);
                }
            }
        }
    }
}

/// Trailing chunk downloads, started in index order and never more than
/// `limit` outstanding (in flight plus waiting in the reorder buffer).
struct ChunkFetches {
    set: JoinSet<(usize, Result<AudioClip>)>,
    indices: HashMap<task::Id, usize>,
    next: usize,
    total: usize,
    limit: usize,
}

impl ChunkFetches {
    fn new(total: usize, limit: usize) -> Self {
        Self {
            set: JoinSet::new(),
            indices: HashMap::new(),
            next: 1,
            total,
            limit,
        }
    }

    fn fill(&mut self, run: &PlaybackRun, held: usize) {
        while self.next < self.total && self.set.len() + held < self.limit {
            let index = self.next;
            self.next += 1;
            let synth = Arc::clone(&run.synth);
            let request = Arc::clone(&run.request);
            let timeout = run.chunk_timeout;
            let handle = self.set.spawn(async move {
                let result = fetch_clip(synth, request, index, timeout).await.map(|(_, clip)| clip);
                (index, result)
            });
            self.indices.insert(handle.id(), index);
        }
    }

    /// Next finished download. A task that panicked is reported as a
    /// failure of its own chunk.
    async fn join_next(&mut self) -> Option<(usize, Result<AudioClip>)> {
        loop {
            match self.set.join_next_with_id().await? {
                Ok((id, (index, result))) => {
                    self.indices.remove(&id);
                    return Some((index, result));
                }
                Err(e) => {
                    let Some(index) = self.indices.remove(&e.id()) else {
                        continue;
                    };
                    return Some((
                        index,
                        Err(VoiceError::SynthesisFailed {
                            chunk_index: index,
                            reason: format!("fetch task failed: {e}"),
                        }),
                    ));
                }
            }
        }
    }
}

/// Wait for the audible clip to finish; pending forever when nothing is queued.
async fn wait_for_front(
    playing: &mut VecDeque<(usize, PlaybackHandle)>,
) -> std::result::Result<Result<()>, oneshot::error::RecvError> {
    match playing.front_mut() {
        Some((_, handle)) => handle.await,
        None => std::future::pending().await,
    }
}

/// Fetch and decode one chunk under the per-chunk timeout.
async fn fetch_clip(
    synth: Arc<dyn SynthesisClient>,
    request: Arc<SynthesisRequest>,
    index: usize,
    timeout: Duration,
) -> Result<(usize, AudioClip)> {
    let chunk = tokio::time::timeout(timeout, synth.fetch_chunk(&request, index))
        .await
        .map_err(|_| VoiceError::Timeout(format!("synthesis of chunk {index}")))??;
    if chunk.index != index {
        return Err(VoiceError::SynthesisFailed {
            chunk_index: index,
            reason: format!("service answered with chunk {}", chunk.index),
        });
    }
    let clip = decode_clip(index, chunk.audio_bytes)?;
    Ok((chunk.total_chunks.max(1), clip))
}
