//! Shared turn machinery used by both the scheduler and the interruption
//! controller.
//!
//! [`TurnEngine`] owns everything that outlives a single turn: the history,
//! the state cell, the prompt builder and the speech backend.  Each call to
//! [`TurnEngine::run_turn`] builds a fresh [`SpeakingChain`] and drives the
//! THINKING → SPEAKING → IDLE transitions around it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::chain::SpeakingChain;
use super::history::History;
use super::observer::ConversationObserver;
use super::segmenter::{LabelCleaner, Sentence};
use super::state::{ConversationState, StateCell};
use super::turn::{Host, RetryPolicy, SpeakingTurn, TurnEnd, TurnOutcome};
use crate::config::ConversationConfig;
use crate::llm::{summarize_unspoken, GenerationRequest, PromptBuilder, TextGenerator};
use crate::speech::SpeechBackend;

pub struct TurnEngine {
    generator: Arc<dyn TextGenerator>,
    backend: SpeechBackend,
    prompts: PromptBuilder,
    history: Mutex<History>,
    state: StateCell,
    observer: Arc<dyn ConversationObserver>,
    policy: RetryPolicy,
    summary_words: usize,
    next_turn: AtomicU64,
}

impl TurnEngine {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        backend: SpeechBackend,
        observer: Arc<dyn ConversationObserver>,
        prompts: PromptBuilder,
        policy: RetryPolicy,
        summary_words: usize,
    ) -> (Arc<Self>, watch::Receiver<ConversationState>) {
        let (state, rx) = StateCell::new(Arc::clone(&observer));
        let engine = Self {
            generator,
            backend,
            prompts,
            history: Mutex::new(History::new()),
            state,
            observer,
            policy,
            summary_words,
            next_turn: AtomicU64::new(0),
        };
        (Arc::new(engine), rx)
    }

    pub fn from_config(
        generator: Arc<dyn TextGenerator>,
        backend: SpeechBackend,
        observer: Arc<dyn ConversationObserver>,
        config: &ConversationConfig,
    ) -> (Arc<Self>, watch::Receiver<ConversationState>) {
        Self::new(
            generator,
            backend,
            observer,
            PromptBuilder::new(&config.topic, config.history_window),
            config.retry_policy(),
            config.unspoken_summary_words,
        )
    }

    pub fn state(&self) -> ConversationState {
        self.state.get()
    }

    pub fn set_state(&self, next: ConversationState) {
        self.state.set(next);
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.subscribe()
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Snapshot of everything heard so far.
    pub fn history(&self) -> History {
        self.lock_history().clone()
    }

    pub fn record_user(&self, utterance: &str) {
        self.lock_history().push_user(utterance);
    }

    pub fn host_turn_request(&self, host: &Host, hosts: &[Host]) -> GenerationRequest {
        let history = self.lock_history();
        self.prompts.host_turn(host, hosts, &history)
    }

    /// Reply request for `host`.
    ///
    /// When `interrupted` is `host`'s own cut-off turn, the prompt carries
    /// what was heard and a summary of what was not.  Call before
    /// [`record_user`](Self::record_user) so the utterance is not repeated.
    pub fn interruption_request(
        &self,
        host: &Host,
        hosts: &[Host],
        interrupted: Option<&TurnOutcome>,
        utterance: &str,
    ) -> GenerationRequest {
        let own = interrupted.filter(|o| o.host.id == host.id);
        let spoken = own.map(TurnOutcome::spoken_text).unwrap_or_default();
        let summary = own.and_then(|o| summarize_unspoken(&o.unspoken_buffer(), self.summary_words));

        let history = self.lock_history();
        self.prompts
            .interruption(host, hosts, &history, &spoken, summary.as_deref(), utterance)
    }

    pub fn report_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        self.observer.on_error(error);
    }

    /// Run one turn for `host` until it completes, fails or `cancel` fires.
    ///
    /// The caller must not start another turn before this one returns.
    pub async fn run_turn(
        &self,
        host: &Host,
        hosts: &[Host],
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> TurnOutcome {
        let id = self.next_turn.fetch_add(1, Ordering::SeqCst) + 1;
        let turn = SpeakingTurn::new(id, host.clone(), cancel);
        if turn.is_cancelled() {
            log::debug!("engine: turn {id} cancelled before it began");
        } else {
            self.state.set(ConversationState::Thinking);
        }

        let chain = SpeakingChain::new(
            Arc::clone(&self.generator),
            self.backend.clone(),
            LabelCleaner::new(hosts.iter().map(|h| h.name.as_str())),
            self.policy,
        );

        let token = turn.cancel_token().clone();
        let mut on_start = |sentence: &Sentence| {
            if token.is_cancelled() {
                return;
            }
            self.state.set(ConversationState::Speaking);
            self.observer.on_sentence(host, sentence);
        };
        let outcome = chain.run(&turn, request, &mut on_start).await;

        self.lock_history().push_host(host, &outcome.spoken_text());

        if outcome.end != TurnEnd::Cancelled && !turn.is_cancelled() {
            self.state.set(ConversationState::Idle);
        }
        self.observer.on_turn_end(&outcome);
        outcome
    }

    fn lock_history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(|p| p.into_inner())
    }
}
