//! Deterministic test doubles shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioClip, AudioOutput, PcmFormat, PlaybackEnd, PlaybackError, PlaybackSlot};
use crate::conversation::{
    ConversationEvent, ConversationObserver, ConversationState, Host, Sentence, TurnOutcome,
};
use crate::llm::{GenerationError, GenerationRequest, TextEvent, TextGenerator, TokenStream};
use crate::speech::{DispatchConfig, SpeechBackend, SpeechSynthesizer, SynthError};

fn locked<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// ScriptedGenerator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Step {
    Token(String),
    Role(String),
    Wait(Duration),
    Fail(GenerationError),
    /// Never yields again.
    Hang,
    End,
}

#[derive(Debug, Clone)]
pub enum Script {
    Stream(Vec<Step>),
    Refuse(GenerationError),
}

/// Split `text` into four-character tokens so words are cut mid-way.
pub fn tokens(text: &str) -> Vec<Step> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(4)
        .map(|c| Step::Token(c.iter().collect()))
        .collect()
}

/// A complete, well-terminated reply.
pub fn reply(text: &str) -> Script {
    let mut steps = tokens(text);
    steps.push(Step::End);
    Script::Stream(steps)
}

/// Plays queued scripts in order, then repeats the fallback.
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn replying(text: &str) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: reply(text),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn then(self, script: Script) -> Self {
        locked(&self.scripts).push_back(script);
        self
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<TokenStream, GenerationError> {
        locked(&self.requests).push(request.clone());
        let script = locked(&self.scripts)
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let steps = match script {
            Script::Refuse(e) => return Err(e),
            Script::Stream(steps) => steps,
        };

        Ok(Box::pin(async_stream::stream! {
            for step in steps {
                match step {
                    Step::Token(t) => yield Ok(TextEvent::Token(t)),
                    Step::Role(r) => yield Ok(TextEvent::Role(r)),
                    Step::Wait(d) => tokio::time::sleep(d).await,
                    Step::Fail(e) => {
                        yield Err(e);
                        return;
                    }
                    Step::Hang => futures::future::pending::<()>().await,
                    Step::End => yield Ok(TextEvent::End),
                }
            }
        }))
    }
}

// ---------------------------------------------------------------------------
// ScriptedSynth
// ---------------------------------------------------------------------------

/// Returns a short PCM clip unique to each text, after a fixed delay.
pub struct ScriptedSynth {
    delay: Duration,
    clip_millis: u64,
    failures: Mutex<HashMap<String, SynthError>>,
    rate_limits: Mutex<HashMap<String, u32>>,
    transient: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for ScriptedSynth {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSynth {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
            clip_millis: 100,
            failures: Mutex::new(HashMap::new()),
            rate_limits: Mutex::new(HashMap::new()),
            transient: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_clip_millis(mut self, millis: u64) -> Self {
        self.clip_millis = millis;
        self
    }

    /// Always fail `text` with `error`.
    pub fn failing(self, text: &str, error: SynthError) -> Self {
        locked(&self.failures).insert(text.to_owned(), error);
        self
    }

    /// Answer `text` with 429 the first `times` calls.
    pub fn rate_limited(self, text: &str, times: u32) -> Self {
        locked(&self.rate_limits).insert(text.to_owned(), times);
        self
    }

    /// Answer `text` with 503 the first `times` calls.
    pub fn flaky(self, text: &str, times: u32) -> Self {
        locked(&self.transient).insert(text.to_owned(), times);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// The clip returned for `text` at the default 100 ms length.
    pub fn pcm_for(text: &str) -> Vec<u8> {
        pcm(text, 100)
    }

    fn scripted_error(&self, text: &str) -> Option<SynthError> {
        if let Some(left) = locked(&self.rate_limits).get_mut(text).filter(|n| **n > 0) {
            *left -= 1;
            return Some(SynthError::RateLimited { retry_after: None });
        }
        if let Some(left) = locked(&self.transient).get_mut(text).filter(|n| **n > 0) {
            *left -= 1;
            return Some(SynthError::Status {
                status: 503,
                body: "busy".into(),
            });
        }
        locked(&self.failures).get(text).cloned()
    }
}

fn pcm(text: &str, millis: u64) -> Vec<u8> {
    let format = PcmFormat::default();
    let samples = (format.sample_rate as u64 * millis / 1000) as usize;
    let value = (text.bytes().map(u32::from).sum::<u32>() % 1000) as i16 * 10;
    (0..samples).flat_map(|_| value.to_le_bytes()).collect()
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynth {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>, SynthError> {
        locked(&self.calls).push(text.to_owned());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.scripted_error(text) {
            Some(e) => Err(e),
            None => Ok(pcm(text, self.clip_millis)),
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingOutput
// ---------------------------------------------------------------------------

/// Output that plays in (paused) real time and counts what happened.
#[derive(Default)]
pub struct RecordingOutput {
    playing: AtomicUsize,
    max_playing: AtomicUsize,
    finished: AtomicUsize,
    stopped: AtomicUsize,
}

impl RecordingOutput {
    pub fn max_playing(&self) -> usize {
        self.max_playing.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(
        &self,
        clip: &AudioClip,
        cancel: &CancellationToken,
    ) -> Result<PlaybackEnd, PlaybackError> {
        let now = self.playing.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_playing.fetch_max(now, Ordering::SeqCst);

        let end = tokio::select! {
            biased;
            _ = cancel.cancelled() => PlaybackEnd::Stopped,
            _ = tokio::time::sleep(clip.duration()) => PlaybackEnd::Finished,
        };

        self.playing.fetch_sub(1, Ordering::SeqCst);
        match end {
            PlaybackEnd::Finished => self.finished.fetch_add(1, Ordering::SeqCst),
            PlaybackEnd::Stopped => self.stopped.fetch_add(1, Ordering::SeqCst),
        };
        Ok(end)
    }
}

/// Output whose stream dies halfway through every clip.
#[derive(Default)]
pub struct DroppingOutput;

#[async_trait]
impl AudioOutput for DroppingOutput {
    async fn play(
        &self,
        clip: &AudioClip,
        cancel: &CancellationToken,
    ) -> Result<PlaybackEnd, PlaybackError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(PlaybackEnd::Stopped),
            _ = tokio::time::sleep(clip.duration() / 2) => Err(PlaybackError::Closed),
        }
    }
}

/// Backend with no request spacing and the default retry bounds.
pub fn test_backend(synth: Arc<ScriptedSynth>, output: Arc<dyn AudioOutput>) -> SpeechBackend {
    let config = DispatchConfig {
        request_spacing: Duration::ZERO,
        ..DispatchConfig::default()
    };
    SpeechBackend::new(synth, Arc::new(PlaybackSlot::new(output)), config, 64)
}

pub fn two_hosts() -> Vec<Host> {
    vec![
        Host::new("ava", "Ava", "nova", "Curious journalist."),
        Host::new("ben", "Ben", "onyx", "Sceptical engineer."),
    ]
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

/// Observer that records every notification synchronously.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<ConversationEvent>>,
}

impl EventLog {
    pub fn events(&self) -> Vec<ConversationEvent> {
        locked(&self.events).clone()
    }

    pub fn states(&self) -> Vec<ConversationState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ConversationEvent::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn captions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ConversationEvent::Sentence { sentence, .. } => Some(sentence.text),
                _ => None,
            })
            .collect()
    }

    pub fn turns(&self) -> Vec<TurnOutcome> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ConversationEvent::TurnEnded(o) => Some(o),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ConversationEvent::Error(msg) => Some(msg),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: ConversationEvent) {
        locked(&self.events).push(event);
    }
}

impl ConversationObserver for EventLog {
    fn on_state(&self, state: ConversationState) {
        self.push(ConversationEvent::State(state));
    }

    fn on_sentence(&self, host: &Host, sentence: &Sentence) {
        self.push(ConversationEvent::Sentence {
            host: host.clone(),
            sentence: sentence.clone(),
        });
    }

    fn on_turn_end(&self, outcome: &TurnOutcome) {
        self.push(ConversationEvent::TurnEnded(outcome.clone()));
    }

    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        self.push(ConversationEvent::Error(error.to_string()));
    }
}
