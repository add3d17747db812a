//! Listener interruptions.
//!
//! ```text
//! interrupt(text)
//!   └─▶ cancel scheduler turn + reply          [Listening]
//!         └─▶ settle both tasks
//!               └─▶ record utterance, spawn reply turn   [Thinking → Speaking]
//!                     └─▶ reply settles ─▶ advance past responder, resume rotation
//! ```
//!
//! The controller is the only place that starts reply turns, and it always
//! settles the previous turn first, so two turns never share the playback
//! slot.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::TurnEngine;
use super::scheduler::{LoopExit, SchedulerError, TurnScheduler};
use super::state::ConversationState;
use super::turn::{ChainError, Host, TurnEnd, TurnOutcome};
use crate::stt::{SttEngine, SttError};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InterruptError {
    #[error("nothing was said")]
    EmptyUtterance,

    #[error("could not transcribe the interruption: {0}")]
    Transcription(#[from] SttError),

    #[error("spoken interruptions need a speech-to-text engine")]
    NoSpeechToText,

    #[error("no host available to answer")]
    NoHost,

    #[error("reply to the listener failed: {0}")]
    Response(ChainError),
}

/// Something that happened without a command.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    /// A reply turn settled; `outcome` is `None` if its task died.
    ReplyFinished {
        host: Host,
        outcome: Option<TurnOutcome>,
    },
    /// The rotation task ended on its own.
    LoopEnded(LoopExit),
}

struct Reply {
    host: Host,
    cancel: CancellationToken,
    handle: JoinHandle<TurnOutcome>,
}

pub struct InterruptionController {
    engine: Arc<TurnEngine>,
    scheduler: TurnScheduler,
    stt: Option<Arc<dyn SttEngine>>,
    reply: Option<Reply>,
}

impl InterruptionController {
    pub fn new(
        engine: Arc<TurnEngine>,
        scheduler: TurnScheduler,
        stt: Option<Arc<dyn SttEngine>>,
    ) -> Self {
        Self {
            engine,
            scheduler,
            stt,
            reply: None,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.engine.state()
    }

    pub fn scheduler(&self) -> &TurnScheduler {
        &self.scheduler
    }

    pub async fn start(&mut self, hosts: Vec<Host>) -> Result<(), SchedulerError> {
        self.cancel_reply().await;
        self.scheduler.start(hosts).await
    }

    pub async fn stop(&mut self) {
        self.cancel_reply().await;
        self.scheduler.stop().await;
        self.engine.set_state(ConversationState::Idle);
    }

    /// Cut off whoever is speaking and answer `utterance`.
    pub async fn interrupt(&mut self, utterance: &str) -> Result<(), InterruptError> {
        let utterance = utterance.trim();
        if utterance.is_empty() {
            return Err(InterruptError::EmptyUtterance);
        }

        let interrupted = self.silence().await;
        self.respond(interrupted, utterance)
    }

    /// Like [`interrupt`](Self::interrupt), for a 16 kHz mono recording.
    ///
    /// Speech stops before transcription starts.  If no words come out the
    /// rotation carries on and the error is returned.
    pub async fn interrupt_with_audio(&mut self, samples: Vec<f32>) -> Result<(), InterruptError> {
        let stt = self.stt.clone().ok_or(InterruptError::NoSpeechToText)?;
        let interrupted = self.silence().await;

        log::debug!("interrupt: transcribing {} samples", samples.len());
        let transcribed = tokio::task::spawn_blocking(move || stt.transcribe(&samples))
            .await
            .unwrap_or_else(|e| Err(SttError::Transcription(e.to_string())));

        match transcribed {
            Ok(text) => {
                log::info!("interrupt: heard {text:?}");
                self.respond(interrupted, &text)
            }
            Err(e) => {
                log::warn!("interrupt: transcription failed: {e}");
                self.carry_on();
                Err(e.into())
            }
        }
    }

    /// Wait for the running reply or rotation to end by itself.
    ///
    /// Cancel-safe; pair with [`handle`](Self::handle).
    pub async fn next_event(&mut self) -> ControllerEvent {
        if let Some(reply) = self.reply.as_mut() {
            let joined = (&mut reply.handle).await;
            let host = reply.host.clone();
            self.reply = None;

            let outcome = joined
                .map_err(|e| log::error!("interrupt: reply task failed: {e}"))
                .ok();
            return ControllerEvent::ReplyFinished { host, outcome };
        }
        ControllerEvent::LoopEnded(self.scheduler.wait().await)
    }

    pub fn handle(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::ReplyFinished { host, outcome } => {
                if let Some(TurnEnd::Failed(e)) = outcome.as_ref().map(|o| &o.end) {
                    let error = InterruptError::Response(e.clone());
                    log::warn!("interrupt: {error}");
                    self.engine.report_error(&error);
                }
                self.scheduler.advance_past(&host.id);
                self.carry_on();
            }
            ControllerEvent::LoopEnded(exit) => {
                log::info!("interrupt: rotation ended ({exit:?})");
            }
        }
    }

    /// Cancel everything audible and wait until it has settled.
    ///
    /// Returns the turn that was cut off, if one was running.
    async fn silence(&mut self) -> Option<TurnOutcome> {
        self.scheduler.cancel_running();
        if let Some(reply) = &self.reply {
            reply.cancel.cancel();
        }
        self.engine.set_state(ConversationState::Listening);

        let mut interrupted = self.cancel_reply().await;
        if let Some(outcome) = self.scheduler.pause().await {
            interrupted = Some(outcome);
        }

        // A turn may have reported a state while it was winding down.
        self.engine.set_state(ConversationState::Listening);
        interrupted
    }

    async fn cancel_reply(&mut self) -> Option<TurnOutcome> {
        let reply = self.reply.take()?;
        reply.cancel.cancel();
        match reply.handle.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                log::error!("interrupt: reply task failed: {e}");
                None
            }
        }
    }

    fn respond(
        &mut self,
        interrupted: Option<TurnOutcome>,
        utterance: &str,
    ) -> Result<(), InterruptError> {
        let hosts = self.scheduler.rotation().map(|r| r.hosts().to_vec());
        let responder = interrupted
            .as_ref()
            .map(|o| o.host.clone())
            .or_else(|| self.scheduler.current_host().cloned());

        let (Some(hosts), Some(host)) = (hosts, responder) else {
            self.engine.set_state(ConversationState::Idle);
            return Err(InterruptError::NoHost);
        };

        let request = self
            .engine
            .interruption_request(&host, &hosts, interrupted.as_ref(), utterance);
        self.engine.record_user(utterance);

        log::info!("interrupt: {} answers the listener", host.name);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let engine = Arc::clone(&self.engine);
            let host = host.clone();
            let cancel = cancel.clone();
            async move { engine.run_turn(&host, &hosts, request, cancel).await }
        });

        self.reply = Some(Reply {
            host,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Give the floor back to the rotation, or go idle if it has ended.
    fn carry_on(&mut self) {
        if !self.scheduler.resume() {
            self.engine.set_state(ConversationState::Idle);
        }
    }
}

impl Drop for InterruptionController {
    fn drop(&mut self) {
        if let Some(reply) = &self.reply {
            reply.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{RetryPolicy, Speaker};
    use crate::llm::{GenerationError, PromptBuilder};
    use crate::stt::MockSttEngine;
    use crate::testing::{
        reply, test_backend, two_hosts, EventLog, RecordingOutput, Script, ScriptedGenerator,
        ScriptedSynth,
    };

    struct Fixture {
        controller: InterruptionController,
        generator: Arc<ScriptedGenerator>,
        log: Arc<EventLog>,
        output: Arc<RecordingOutput>,
    }

    fn fixture(
        generator: ScriptedGenerator,
        max_turns: Option<usize>,
        stt: Option<Arc<dyn SttEngine>>,
    ) -> Fixture {
        let generator = Arc::new(generator);
        let log = Arc::new(EventLog::default());
        let output = Arc::new(RecordingOutput::default());
        let backend = test_backend(Arc::new(ScriptedSynth::new()), output.clone());
        let (engine, _rx) = TurnEngine::new(
            generator.clone(),
            backend,
            log.clone(),
            PromptBuilder::new("tides", 12),
            RetryPolicy::default(),
            24,
        );
        let scheduler = TurnScheduler::new(Arc::clone(&engine), max_turns);
        Fixture {
            controller: InterruptionController::new(engine, scheduler, stt),
            generator,
            log,
            output,
        }
    }

    async fn until_speaking(controller: &InterruptionController) {
        let mut states = controller.engine.subscribe();
        states
            .wait_for(|s| *s == ConversationState::Speaking)
            .await
            .unwrap();
    }

    /// Feed events back in until the rotation ends.
    async fn run_out(controller: &mut InterruptionController) -> LoopExit {
        loop {
            match controller.next_event().await {
                ControllerEvent::LoopEnded(exit) => return exit,
                event => controller.handle(event),
            }
        }
    }

    fn speakers(log: &EventLog) -> Vec<String> {
        log.turns().into_iter().map(|t| t.host.id).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn interrupted_host_answers_then_rotation_moves_on() {
        let mut f = fixture(
            ScriptedGenerator::replying("Sure thing. More words."),
            Some(2),
            None,
        );

        f.controller.start(two_hosts()).await.unwrap();
        until_speaking(&f.controller).await;

        f.controller.interrupt("What about cost?").await.unwrap();
        assert!(f.log.states().contains(&ConversationState::Listening));
        assert!(!f.controller.scheduler().is_running());
        assert_eq!(f.output.stopped(), 1);
        assert_eq!(f.output.finished(), 0);

        assert_eq!(run_out(&mut f.controller).await, LoopExit::Finished);
        assert_eq!(f.output.max_playing(), 1);
        assert_eq!(f.output.finished(), 4);

        let turns = f.log.turns();
        assert_eq!(speakers(&f.log), ["ava", "ava", "ben"]);
        assert!(turns[0].was_cancelled());
        assert_eq!(turns[0].unspoken_buffer(), "More words.");
        assert!(turns[1].completed());

        let reply_prompt = &f.generator.requests()[1];
        let note = &reply_prompt.messages.last().unwrap().content;
        assert!(note.contains("What about cost?"));
        assert!(note.contains("More words."));

        let history = f.controller.engine.history();
        let who: Vec<_> = history.records().iter().map(|r| r.speaker.clone()).collect();
        assert_eq!(
            who[0],
            Speaker::Host {
                id: "ava".into(),
                name: "Ava".into()
            }
        );
        assert_eq!(who[1], Speaker::User);
        assert_eq!(history.records()[1].text, "What about cost?");
        assert_eq!(f.controller.state(), ConversationState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reply_is_reported_and_rotation_resumes() {
        let mut f = fixture(
            ScriptedGenerator::replying("Next one.")
                .then(reply("Plain talk. Still talking."))
                .then(Script::Refuse(GenerationError::Parse("garbled".into()))),
            Some(2),
            None,
        );

        f.controller.start(two_hosts()).await.unwrap();
        until_speaking(&f.controller).await;
        f.controller.interrupt("Hello?").await.unwrap();

        assert_eq!(run_out(&mut f.controller).await, LoopExit::Finished);

        assert_eq!(f.log.errors().len(), 1);
        let turns = f.log.turns();
        assert!(turns[1].error().is_some());
        assert_eq!(turns.last().unwrap().host.id, "ben");
        assert_eq!(f.controller.state(), ConversationState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupting_a_reply_replaces_it() {
        let mut f = fixture(
            ScriptedGenerator::replying("Long answer here. And more."),
            Some(1),
            None,
        );

        f.controller.start(two_hosts()).await.unwrap();
        until_speaking(&f.controller).await;
        f.controller.interrupt("First question").await.unwrap();
        until_speaking(&f.controller).await;
        f.controller.interrupt("Second question").await.unwrap();

        assert_eq!(run_out(&mut f.controller).await, LoopExit::Finished);
        assert_eq!(speakers(&f.log), ["ava", "ava", "ava"]);
        assert!(f.log.turns()[1].was_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn blank_utterance_changes_nothing() {
        let mut f = fixture(ScriptedGenerator::replying("Hi."), None, None);
        assert_eq!(
            f.controller.interrupt("   ").await,
            Err(InterruptError::EmptyUtterance)
        );
        assert!(f.log.states().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_before_start_has_no_host() {
        let mut f = fixture(ScriptedGenerator::replying("Hi."), None, None);
        assert_eq!(
            f.controller.interrupt("Anyone there?").await,
            Err(InterruptError::NoHost)
        );
        assert_eq!(f.controller.state(), ConversationState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn audio_interruption_needs_an_engine() {
        let mut f = fixture(ScriptedGenerator::replying("Hi."), None, None);
        assert_eq!(
            f.controller.interrupt_with_audio(vec![0.0; 16_000]).await,
            Err(InterruptError::NoSpeechToText)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transcribed_audio_is_answered() {
        let stt: Arc<dyn SttEngine> = Arc::new(MockSttEngine::ok(" Hold on "));
        let mut f = fixture(ScriptedGenerator::replying("Okay then. Sure."), Some(1), Some(stt));

        f.controller.start(two_hosts()).await.unwrap();
        until_speaking(&f.controller).await;
        f.controller
            .interrupt_with_audio(vec![0.0; 16_000])
            .await
            .unwrap();

        assert_eq!(run_out(&mut f.controller).await, LoopExit::Finished);
        let history = f.controller.engine.history();
        assert!(history
            .records()
            .iter()
            .any(|r| r.speaker == Speaker::User && r.text == "Hold on"));
    }

    #[tokio::test(start_paused = true)]
    async fn unintelligible_audio_resumes_the_rotation() {
        let stt: Arc<dyn SttEngine> = Arc::new(MockSttEngine::err(SttError::Unintelligible));
        let mut f = fixture(ScriptedGenerator::replying("Okay then. Sure."), Some(1), Some(stt));

        f.controller.start(two_hosts()).await.unwrap();
        until_speaking(&f.controller).await;

        let result = f.controller.interrupt_with_audio(vec![0.0; 16_000]).await;
        assert_eq!(
            result,
            Err(InterruptError::Transcription(SttError::Unintelligible))
        );
        assert!(f.controller.scheduler().is_running());

        assert_eq!(run_out(&mut f.controller).await, LoopExit::Finished);
        assert_eq!(speakers(&f.log), ["ava", "ava"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_silences_a_running_reply() {
        let mut f = fixture(
            ScriptedGenerator::replying("Words and words. More of them."),
            None,
            None,
        );

        f.controller.start(two_hosts()).await.unwrap();
        until_speaking(&f.controller).await;
        f.controller.interrupt("Stop please").await.unwrap();
        f.controller.stop().await;

        assert_eq!(f.controller.state(), ConversationState::Idle);
        assert!(!f.controller.scheduler().is_running());
        assert!(!f.controller.scheduler().is_active());
    }
}
