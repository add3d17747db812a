//! Sentence-to-speech dispatcher.
//!
//! One [`SpeechDispatcher`] exists per speaking turn.  Sentences are
//! enqueued in emission order and flow through two tasks:
//!
//! ```text
//! enqueue ─▶ queue ─▶ resolver: cache? ─▶ pacer ─▶ synth  (≤ N in flight, order kept)
//!                          │
//!                          ▼ ready (one clip ahead)
//!                      player: PlaybackSlot::play ─▶ DispatchEvent::{Started, Finished, Skipped}
//! ```
//!
//! The resolver prefetches up to `max_concurrent_fetches` clips ahead of the
//! player.  A rate-limited fetch keeps its place in line and is retried after
//! a doubling back-off until it succeeds or the turn is cancelled; any other
//! failure turns into a `Skipped` event so
//! later sentences still play.  [`SpeechDispatcher::cancel_all`] stops
//! everything and returns only once both tasks have exited.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioClip, AudioError, PcmFormat, PlaybackEnd, PlaybackError, PlaybackSlot};
use crate::conversation::Sentence;
use crate::speech::cache::{AudioCache, CacheKey};
use crate::speech::pacer::RequestPacer;
use crate::speech::synth::{SpeechSynthesizer, SynthError};

// ---------------------------------------------------------------------------
// DispatchConfig
// ---------------------------------------------------------------------------

/// Runtime tuning for every dispatcher in a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchConfig {
    /// Synthesis requests allowed in flight at once.
    pub max_concurrent_fetches: usize,
    /// Minimum gap between two synthesis requests.
    pub request_spacing: Duration,
    /// Cap on the doubling wait between re-queues of a rate-limited sentence.
    pub max_rate_limit_backoff: Duration,
    /// Retries allowed for one sentence after transient failures.
    pub max_transient_retries: u32,
    /// Format of the bytes returned by the synthesizer.
    pub format: PcmFormat,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 2,
            request_spacing: Duration::from_millis(250),
            max_rate_limit_backoff: Duration::from_secs(8),
            max_transient_retries: 1,
            format: PcmFormat::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchError / DispatchEvent
// ---------------------------------------------------------------------------

/// Why a sentence was skipped.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    Synthesis(#[from] SynthError),

    #[error("synthesised audio could not be decoded: {0}")]
    Decode(#[from] AudioError),

    #[error("playback failed: {0}")]
    Playback(#[from] PlaybackError),

    #[error("dispatcher is closed")]
    Closed,
}

impl DispatchError {
    /// Every later sentence would fail the same way.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DispatchError::Synthesis(e) if e.is_fatal())
    }
}

/// Progress reported by the player task, in playback order.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// Audio for the sentence has started playing.
    Started { index: usize, text: String },
    /// The sentence played to the end.
    Finished { index: usize },
    /// The sentence will never play.
    Skipped {
        index: usize,
        text: String,
        error: DispatchError,
    },
}

// ---------------------------------------------------------------------------
// SpeechBackend
// ---------------------------------------------------------------------------

/// Session-wide resources shared by every dispatcher.
#[derive(Clone)]
pub struct SpeechBackend {
    pub synth: Arc<dyn SpeechSynthesizer>,
    pub cache: Arc<AudioCache>,
    pub pacer: Arc<RequestPacer>,
    pub output: Arc<PlaybackSlot>,
    pub config: DispatchConfig,
}

impl SpeechBackend {
    pub fn new(
        synth: Arc<dyn SpeechSynthesizer>,
        output: Arc<PlaybackSlot>,
        config: DispatchConfig,
        cache_capacity: usize,
    ) -> Self {
        Self {
            synth,
            cache: Arc::new(AudioCache::new(cache_capacity)),
            pacer: Arc::new(RequestPacer::new(config.request_spacing)),
            output,
            config,
        }
    }
}

// ---------------------------------------------------------------------------
// SpeechDispatcher
// ---------------------------------------------------------------------------

struct QueueItem {
    sentence: Sentence,
    voice: String,
}

enum Resolved {
    Ready(Arc<AudioClip>),
    Failed(DispatchError),
    Cancelled,
}

pub struct SpeechDispatcher {
    queue: Option<mpsc::UnboundedSender<QueueItem>>,
    cancel: CancellationToken,
    depth: Arc<AtomicUsize>,
    playing: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SpeechDispatcher {
    /// Spawn the resolver and player tasks.
    ///
    /// The returned receiver closes once the dispatcher has been closed and
    /// drained, or cancelled.
    pub fn new(backend: &SpeechBackend) -> (Self, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = mpsc::channel(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let cancel = CancellationToken::new();
        let depth = Arc::new(AtomicUsize::new(0));
        let playing = Arc::new(AtomicBool::new(false));

        let resolver = tokio::spawn(resolve_loop(
            backend.clone(),
            queue_rx,
            ready_tx,
            cancel.clone(),
        ));
        let player = tokio::spawn(play_loop(
            Arc::clone(&backend.output),
            ready_rx,
            events_tx,
            cancel.clone(),
            Arc::clone(&depth),
            Arc::clone(&playing),
        ));

        let dispatcher = Self {
            queue: Some(queue_tx),
            cancel,
            depth,
            playing,
            tasks: vec![resolver, player],
        };
        (dispatcher, events_rx)
    }

    /// Append a sentence to the queue; returns its index as a handle.
    pub fn enqueue(&self, sentence: Sentence, voice: &str) -> Result<usize, DispatchError> {
        if self.cancel.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        let queue = self.queue.as_ref().ok_or(DispatchError::Closed)?;
        let index = sentence.index;

        self.depth.fetch_add(1, Ordering::SeqCst);
        let item = QueueItem {
            sentence,
            voice: voice.to_owned(),
        };
        if queue.send(item).is_err() {
            release(&self.depth);
            return Err(DispatchError::Closed);
        }
        Ok(index)
    }

    /// No more sentences will be enqueued; queued ones still play.
    pub fn close(&mut self) {
        self.queue = None;
    }

    /// Abort in-flight fetches, stop playback and drop the queue.
    ///
    /// Returns after both tasks have exited, so nothing this dispatcher owns
    /// can start playing afterwards.
    pub async fn cancel_all(&mut self) {
        self.cancel.cancel();
        self.queue = None;

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                log::error!("dispatcher: task ended abnormally: {e}");
            }
        }

        self.depth.store(0, Ordering::SeqCst);
        self.playing.store(false, Ordering::SeqCst);
    }

    /// Sentences enqueued and not yet played or skipped.
    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }
}

impl Drop for SpeechDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn release(depth: &AtomicUsize) {
    let _ = depth.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |d| d.checked_sub(1));
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

async fn resolve_loop(
    backend: SpeechBackend,
    mut queue: mpsc::UnboundedReceiver<QueueItem>,
    ready: mpsc::Sender<(QueueItem, Resolved)>,
    cancel: CancellationToken,
) {
    let limit = backend.config.max_concurrent_fetches.max(1);
    let fetch_cancel = cancel.clone();

    // Each fetch runs as its own task so in-flight requests keep progressing
    // while this loop waits for the player to take the next clip.
    let fetches = stream::poll_fn(move |cx| queue.poll_recv(cx))
        .map(move |item| {
            let backend = backend.clone();
            let cancel = fetch_cancel.clone();
            tokio::spawn(async move {
                let resolved = resolve(&backend, &item, &cancel).await;
                (item, resolved)
            })
        })
        .buffered(limit);
    tokio::pin!(fetches);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = fetches.next() => next,
        };
        let Some(joined) = next else { break };

        match joined {
            Ok(resolved) => {
                if ready.send(resolved).await.is_err() {
                    break;
                }
            }
            Err(e) => log::error!("dispatcher: fetch task failed: {e}"),
        }
    }
}

async fn resolve(backend: &SpeechBackend, item: &QueueItem, cancel: &CancellationToken) -> Resolved {
    let index = item.sentence.index;
    let key = CacheKey::new(&item.sentence.text, &item.voice);
    if let Some(clip) = backend.cache.get(&key) {
        log::debug!("dispatcher: cache hit for sentence {index}");
        return Resolved::Ready(clip);
    }

    let config = &backend.config;
    let mut rate_limited = 0u32;
    let mut transient = 0u32;

    loop {
        let attempt = async {
            backend.pacer.wait_turn().await;
            backend
                .synth
                .synthesize(&item.sentence.text, &item.voice)
                .await
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Resolved::Cancelled,
            result = attempt => result,
        };

        match result {
            Ok(bytes) => {
                return match AudioClip::decode_pcm16(&bytes, config.format) {
                    Ok(clip) => {
                        let clip = Arc::new(clip);
                        backend.cache.insert(key, Arc::clone(&clip));
                        Resolved::Ready(clip)
                    }
                    Err(e) => Resolved::Failed(DispatchError::Decode(e)),
                };
            }
            Err(e) if e.is_rate_limit() => {
                let delay = e
                    .retry_after()
                    .unwrap_or_else(|| rate_limit_backoff(config, rate_limited));
                rate_limited = rate_limited.saturating_add(1);
                log::warn!(
                    "dispatcher: sentence {index} rate-limited ({rate_limited}x), \
                     re-queued in {delay:?}"
                );
                backend.pacer.defer(delay);
            }
            Err(e) if e.is_transient() && transient < config.max_transient_retries => {
                transient += 1;
                log::warn!("dispatcher: sentence {index} failed ({e}), retrying");
            }
            Err(e) => return Resolved::Failed(DispatchError::Synthesis(e)),
        }
    }
}

/// `request_spacing` doubled per consecutive rate limit, capped.
fn rate_limit_backoff(config: &DispatchConfig, attempt: u32) -> Duration {
    let base = config.request_spacing.max(MIN_RATE_LIMIT_BACKOFF);
    base.saturating_mul(1 << attempt.min(16))
        .min(config.max_rate_limit_backoff)
}

const MIN_RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

async fn play_loop(
    output: Arc<PlaybackSlot>,
    mut ready: mpsc::Receiver<(QueueItem, Resolved)>,
    events: mpsc::UnboundedSender<DispatchEvent>,
    cancel: CancellationToken,
    depth: Arc<AtomicUsize>,
    playing: Arc<AtomicBool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = ready.recv() => next,
        };
        let Some((item, resolved)) = next else { break };
        let Sentence { index, text } = item.sentence;

        let clip = match resolved {
            Resolved::Ready(clip) => clip,
            Resolved::Cancelled => break,
            Resolved::Failed(error) => {
                log::warn!("dispatcher: skipping sentence {index}: {error}");
                release(&depth);
                let _ = events.send(DispatchEvent::Skipped { index, text, error });
                continue;
            }
        };

        let started = events.clone();
        let caption = text.clone();
        let flag = Arc::clone(&playing);
        let result = output
            .play(&clip, &cancel, move || {
                flag.store(true, Ordering::SeqCst);
                let _ = started.send(DispatchEvent::Started {
                    index,
                    text: caption,
                });
            })
            .await;
        let began = playing.swap(false, Ordering::SeqCst);
        release(&depth);

        match result {
            Ok(PlaybackEnd::Finished) => {
                let _ = events.send(DispatchEvent::Finished { index });
            }
            Ok(PlaybackEnd::Stopped) => break,
            // Part of the sentence was heard; it stays spoken.
            Err(e) if began => {
                log::warn!("dispatcher: playback of sentence {index} cut short: {e}");
                let _ = events.send(DispatchEvent::Finished { index });
            }
            Err(e) => {
                log::warn!("dispatcher: playback of sentence {index} failed: {e}");
                let _ = events.send(DispatchEvent::Skipped {
                    index,
                    text,
                    error: e.into(),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_backend, RecordingOutput, ScriptedSynth};
    use tokio::time::Instant;

    fn sentence(index: usize, text: &str) -> Sentence {
        Sentence {
            index,
            text: text.to_owned(),
        }
    }

    async fn drain(mut events: mpsc::UnboundedReceiver<DispatchEvent>) -> Vec<DispatchEvent> {
        let mut out = Vec::new();
        while let Some(event) = events.recv().await {
            out.push(event);
        }
        out
    }

    fn started(events: &[DispatchEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                DispatchEvent::Started { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn plays_in_order_with_bounded_prefetch() {
        let synth = Arc::new(ScriptedSynth::new().with_delay(Duration::from_millis(300)));
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth.clone(), output.clone());

        let (mut dispatcher, events) = SpeechDispatcher::new(&backend);
        for i in 0..5 {
            dispatcher.enqueue(sentence(i, &format!("Line {i}.")), "nova").unwrap();
        }
        dispatcher.close();

        let events = drain(events).await;
        assert_eq!(started(&events), vec![0, 1, 2, 3, 4]);
        assert_eq!(synth.max_in_flight(), 2);
        assert_eq!(output.finished(), 5);
        assert_eq!(dispatcher.queue_depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sentence_is_skipped_and_later_ones_play() {
        let synth = Arc::new(ScriptedSynth::new().failing(
            "Two.",
            SynthError::Status {
                status: 400,
                body: "bad input".into(),
            },
        ));
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth, output);

        let (mut dispatcher, events) = SpeechDispatcher::new(&backend);
        dispatcher.enqueue(sentence(0, "One."), "nova").unwrap();
        dispatcher.enqueue(sentence(1, "Two."), "nova").unwrap();
        dispatcher.enqueue(sentence(2, "Three."), "nova").unwrap();
        dispatcher.close();

        let events = drain(events).await;
        assert_eq!(started(&events), vec![0, 2]);
        assert!(events.iter().any(|e| matches!(
            e,
            DispatchEvent::Skipped { index: 1, error: DispatchError::Synthesis(_), .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_sentence_is_requeued_not_dropped() {
        let synth = Arc::new(ScriptedSynth::new().rate_limited("Busy line.", 3));
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth.clone(), output);

        let (mut dispatcher, events) = SpeechDispatcher::new(&backend);
        dispatcher.enqueue(sentence(0, "Busy line."), "nova").unwrap();
        dispatcher.enqueue(sentence(1, "After."), "nova").unwrap();
        dispatcher.close();

        let events = drain(events).await;
        assert_eq!(started(&events), vec![0, 1]);

        let calls = synth.calls();
        assert_eq!(calls.iter().filter(|c| c.as_str() == "Busy line.").count(), 4);

        let cached = backend.cache.get(&CacheKey::new("Busy line.", "nova")).unwrap();
        let direct =
            AudioClip::decode_pcm16(&ScriptedSynth::pcm_for("Busy line."), backend.config.format)
                .unwrap();
        assert_eq!(*cached, direct);
    }

    #[tokio::test(start_paused = true)]
    async fn long_rate_limit_backs_off_without_dropping() {
        let synth = Arc::new(ScriptedSynth::new().rate_limited("Busy line.", 12));
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth.clone(), output);

        let (mut dispatcher, events) = SpeechDispatcher::new(&backend);
        dispatcher.enqueue(sentence(0, "Busy line."), "nova").unwrap();
        dispatcher.enqueue(sentence(1, "After."), "nova").unwrap();
        dispatcher.close();

        let start = Instant::now();
        let events = drain(events).await;
        assert_eq!(started(&events), vec![0, 1]);
        assert!(!events
            .iter()
            .any(|e| matches!(e, DispatchEvent::Skipped { .. })));

        // 100 ms doubling to the 8 s cap: 0.1 + 0.2 + ... + 6.4 + 5 * 8.
        assert!(start.elapsed() >= Duration::from_millis(52_700));
        let busy = synth.calls().iter().filter(|c| c.as_str() == "Busy line.").count();
        assert_eq!(busy, 13);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_ends_a_rate_limited_wait() {
        let synth = Arc::new(ScriptedSynth::new().rate_limited("Busy line.", 1_000));
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth, output);

        let (mut dispatcher, mut events) = SpeechDispatcher::new(&backend);
        dispatcher.enqueue(sentence(0, "Busy line."), "nova").unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        let before = Instant::now();
        dispatcher.cancel_all().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
        assert!(events.recv().await.is_none());
    }

    #[test]
    fn rate_limit_backoff_doubles_up_to_the_cap() {
        let config = DispatchConfig::default();
        assert_eq!(rate_limit_backoff(&config, 0), Duration::from_millis(250));
        assert_eq!(rate_limit_backoff(&config, 2), Duration::from_millis(1_000));
        assert_eq!(rate_limit_backoff(&config, 40), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_once() {
        let synth = Arc::new(ScriptedSynth::new().flaky("Wobbly.", 1));
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth.clone(), output);

        let (mut dispatcher, events) = SpeechDispatcher::new(&backend);
        dispatcher.enqueue(sentence(0, "Wobbly."), "nova").unwrap();
        dispatcher.close();

        let events = drain(events).await;
        assert_eq!(started(&events), vec![0]);
        assert_eq!(synth.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_clip_skips_synthesis() {
        let synth = Arc::new(ScriptedSynth::new());
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth.clone(), output);

        let clip = AudioClip::decode_pcm16(&ScriptedSynth::pcm_for("Again."), backend.config.format)
            .unwrap();
        backend
            .cache
            .insert(CacheKey::new(" Again. ", "nova"), Arc::new(clip));

        let (mut dispatcher, events) = SpeechDispatcher::new(&backend);
        dispatcher.enqueue(sentence(0, "Again."), "nova").unwrap();
        dispatcher.close();

        let events = drain(events).await;
        assert_eq!(started(&events), vec![0]);
        assert!(synth.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_stops_playback_and_empties_queue() {
        let synth = Arc::new(ScriptedSynth::new().with_clip_millis(2_000));
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth, output.clone());

        let (mut dispatcher, mut events) = SpeechDispatcher::new(&backend);
        for i in 0..4 {
            dispatcher.enqueue(sentence(i, &format!("Long line {i}.")), "nova").unwrap();
        }

        let first = events.recv().await.unwrap();
        assert!(matches!(first, DispatchEvent::Started { index: 0, .. }));
        assert!(dispatcher.is_playing());

        let before = Instant::now();
        dispatcher.cancel_all().await;
        assert!(before.elapsed() < Duration::from_millis(2_000));
        assert_eq!(dispatcher.queue_depth(), 0);
        assert!(!dispatcher.is_playing());
        assert_eq!(output.stopped(), 1);

        let rest = drain(events).await;
        assert!(started(&rest).is_empty());
        assert!(dispatcher
            .enqueue(sentence(9, "Too late."), "nova")
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shared_slot_never_plays_two_clips_at_once() {
        let synth = Arc::new(ScriptedSynth::new());
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(synth, output.clone());

        let (mut a, events_a) = SpeechDispatcher::new(&backend);
        let (mut b, events_b) = SpeechDispatcher::new(&backend);
        for i in 0..3 {
            a.enqueue(sentence(i, &format!("A{i}.")), "nova").unwrap();
            b.enqueue(sentence(i, &format!("B{i}.")), "onyx").unwrap();
        }
        a.close();
        b.close();

        let (ea, eb) = tokio::join!(drain(events_a), drain(events_b));
        assert_eq!(started(&ea).len(), 3);
        assert_eq!(started(&eb).len(), 3);
        assert_eq!(output.max_playing(), 1);
    }

    #[test]
    fn only_rejected_synthesis_is_fatal() {
        let fatal = DispatchError::Synthesis(SynthError::Rejected {
            status: 401,
            body: String::new(),
        });
        assert!(fatal.is_fatal());
        assert!(!DispatchError::Playback(PlaybackError::Closed).is_fatal());
        assert!(!DispatchError::Decode(AudioError::Empty).is_fatal());
    }
}
