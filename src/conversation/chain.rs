//! Speaking chain: one host turn from token stream to played audio.
//!
//! ```text
//! TextGenerator ─▶ text source (retry + resume) ─▶ SentenceSegmenter ─▶ SpeechDispatcher
//!                                                                         │
//!                                  on_sentence_start ◀── Started/Skipped ◀┘
//! ```
//!
//! A turn completes only after the text stream has ended *and* every queued
//! sentence has been played or skipped.  Cancelling the turn's token stops
//! generation, synthesis and playback together; the returned
//! [`TurnOutcome`] then says exactly which sentences were heard.

use std::collections::BTreeSet;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};

use super::segmenter::{LabelCleaner, Sentence, SentenceSegmenter};
use super::turn::{ChainError, RetryPolicy, SpeakingTurn, TurnEnd, TurnOutcome};
use crate::llm::{GenerationError, GenerationRequest, TextEvent, TextGenerator};
use crate::speech::{DispatchError, DispatchEvent, SpeechBackend, SpeechDispatcher};

type TextSource = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

// ---------------------------------------------------------------------------
// SpeakingChain
// ---------------------------------------------------------------------------

pub struct SpeakingChain {
    generator: Arc<dyn TextGenerator>,
    backend: SpeechBackend,
    cleaner: LabelCleaner,
    policy: RetryPolicy,
}

impl SpeakingChain {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        backend: SpeechBackend,
        cleaner: LabelCleaner,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            generator,
            backend,
            cleaner,
            policy,
        }
    }

    /// Run `turn` to completion, cancellation or failure.
    ///
    /// `on_sentence_start` is called, in order, as each sentence's audio
    /// begins.
    pub async fn run(
        &self,
        turn: &SpeakingTurn,
        request: GenerationRequest,
        on_sentence_start: &mut (dyn FnMut(&Sentence) + Send),
    ) -> TurnOutcome {
        let cancel = turn.cancel_token();
        let voice = turn.host.voice.as_str();

        let (mut dispatcher, mut events) = SpeechDispatcher::new(&self.backend);
        let mut segmenter = SentenceSegmenter::new(self.cleaner.clone());
        let mut tokens = text_source(Arc::clone(&self.generator), request, self.policy);
        let mut ledger = Ledger::default();
        let mut source_done = false;

        log::debug!("chain: turn {} ({}) started", turn.id, turn.host.name);

        let end = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break TurnEnd::Cancelled,

                event = events.recv() => match event {
                    Some(event) => {
                        if let Some(error) = ledger.record(event, on_sentence_start) {
                            break TurnEnd::Failed(ChainError::Synthesis(error));
                        }
                    }
                    None if source_done => break TurnEnd::Completed,
                    None => break TurnEnd::Failed(ChainError::DispatcherClosed),
                },

                item = tokens.next(), if !source_done => match item {
                    Some(Ok(fragment)) => {
                        let sentences = segmenter.feed(&fragment);
                        if let Err(e) = ledger.enqueue(&dispatcher, sentences, voice) {
                            break TurnEnd::Failed(e);
                        }
                    }
                    Some(Err(e)) => break TurnEnd::Failed(ChainError::Generation(e)),
                    None => {
                        source_done = true;
                        let tail = segmenter.flush().into_iter().collect();
                        if let Err(e) = ledger.enqueue(&dispatcher, tail, voice) {
                            break TurnEnd::Failed(e);
                        }
                        dispatcher.close();
                    }
                },
            }
        };

        // Stop the text stream before waiting on the dispatcher.
        drop(tokens);

        if end != TurnEnd::Completed {
            dispatcher.cancel_all().await;
            while let Ok(event) = events.try_recv() {
                ledger.record(event, on_sentence_start);
            }
        }

        match &end {
            TurnEnd::Failed(e) => log::warn!("chain: turn {} failed: {e}", turn.id),
            other => log::debug!("chain: turn {} ended {other:?}", turn.id),
        }

        let tail = segmenter.flush();
        ledger.into_outcome(turn, tail, end)
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Tracks every sentence handed to the dispatcher and what became of it.
#[derive(Default)]
struct Ledger {
    queued: Vec<Sentence>,
    started: BTreeSet<usize>,
    skipped: BTreeSet<usize>,
}

impl Ledger {
    fn enqueue(
        &mut self,
        dispatcher: &SpeechDispatcher,
        sentences: Vec<Sentence>,
        voice: &str,
    ) -> Result<(), ChainError> {
        for sentence in sentences {
            self.queued.push(sentence.clone());
            dispatcher
                .enqueue(sentence, voice)
                .map_err(|_| ChainError::DispatcherClosed)?;
        }
        Ok(())
    }

    /// Returns the error if the event reports a fatal skip.
    fn record(
        &mut self,
        event: DispatchEvent,
        on_sentence_start: &mut (dyn FnMut(&Sentence) + Send),
    ) -> Option<DispatchError> {
        match event {
            DispatchEvent::Started { index, text } => {
                self.started.insert(index);
                on_sentence_start(&Sentence { index, text });
                None
            }
            DispatchEvent::Finished { .. } => None,
            DispatchEvent::Skipped { index, error, .. } => {
                self.skipped.insert(index);
                error.is_fatal().then_some(error)
            }
        }
    }

    fn into_outcome(self, turn: &SpeakingTurn, tail: Option<Sentence>, end: TurnEnd) -> TurnOutcome {
        let mut spoken = Vec::new();
        let mut unspoken = Vec::new();
        let mut skipped = Vec::new();

        for sentence in self.queued {
            if self.started.contains(&sentence.index) {
                spoken.push(sentence);
            } else if self.skipped.contains(&sentence.index) {
                skipped.push(sentence);
            } else {
                unspoken.push(sentence);
            }
        }
        unspoken.extend(tail);

        TurnOutcome {
            turn_id: turn.id,
            host: turn.host.clone(),
            spoken,
            unspoken,
            skipped,
            end,
        }
    }
}

// ---------------------------------------------------------------------------
// Text source
// ---------------------------------------------------------------------------

/// Content fragments for one turn.
///
/// A transient failure re-opens the stream once the retry delay has passed;
/// if text was already received the new request asks the model to continue
/// after it.  Role echoes are dropped.
fn text_source(
    generator: Arc<dyn TextGenerator>,
    request: GenerationRequest,
    policy: RetryPolicy,
) -> TextSource {
    Box::pin(async_stream::stream! {
        let mut received = String::new();
        let mut retries_left = policy.text_source_retries;

        loop {
            let attempt = if received.is_empty() {
                request.clone()
            } else {
                request.resumed(&received)
            };

            let failure = match generator.generate(&attempt).await {
                Err(e) => e,
                Ok(mut events) => {
                    let mut failure = GenerationError::Interrupted;
                    while let Some(item) = events.next().await {
                        match item {
                            Ok(TextEvent::Token(fragment)) => {
                                received.push_str(&fragment);
                                yield Ok(fragment);
                            }
                            Ok(TextEvent::Role(role)) => {
                                log::trace!("chain: ignoring role marker {role:?}");
                            }
                            Ok(TextEvent::End) => return,
                            Err(e) => {
                                failure = e;
                                break;
                            }
                        }
                    }
                    failure
                }
            };

            if failure.is_transient() && retries_left > 0 {
                retries_left -= 1;
                log::warn!(
                    "chain: text stream failed ({failure}), retrying in {:?}",
                    policy.text_retry_delay
                );
                tokio::time::sleep(policy.text_retry_delay).await;
                continue;
            }

            yield Err(failure);
            return;
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
