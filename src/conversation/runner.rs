//! Command-loop facade over the whole conversation.
//!
//! [`Conversation::spawn`] moves the controller onto its own task and hands
//! back a cloneable [`ConversationHandle`].  Commands are applied one at a
//! time, in arrival order, interleaved with reply and rotation endings.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::engine::TurnEngine;
use super::interrupt::InterruptionController;
use super::observer::ConversationObserver;
use super::scheduler::TurnScheduler;
use super::state::ConversationState;
use super::turn::Host;
use crate::config::ConversationConfig;
use crate::llm::TextGenerator;
use crate::speech::SpeechBackend;
use crate::stt::SttEngine;

const COMMAND_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start(Vec<Host>),
    Stop,
    Interrupt(String),
    /// 16 kHz mono samples.
    InterruptAudio(Vec<f32>),
    Shutdown,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("conversation has shut down")]
pub struct ConversationClosed;

/// Cloneable remote control for a running conversation.
#[derive(Clone)]
pub struct ConversationHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConversationState>,
}

impl ConversationHandle {
    pub async fn start(&self, hosts: Vec<Host>) -> Result<(), ConversationClosed> {
        self.send(Command::Start(hosts)).await
    }

    pub async fn stop(&self) -> Result<(), ConversationClosed> {
        self.send(Command::Stop).await
    }

    pub async fn interrupt(&self, utterance: impl Into<String>) -> Result<(), ConversationClosed> {
        self.send(Command::Interrupt(utterance.into())).await
    }

    pub async fn interrupt_with_audio(&self, samples: Vec<f32>) -> Result<(), ConversationClosed> {
        self.send(Command::InterruptAudio(samples)).await
    }

    pub async fn shutdown(&self) -> Result<(), ConversationClosed> {
        self.send(Command::Shutdown).await
    }

    pub fn state(&self) -> ConversationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.state.clone()
    }

    async fn send(&self, command: Command) -> Result<(), ConversationClosed> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConversationClosed)
    }
}

pub struct Conversation;

impl Conversation {
    /// Spawn the conversation task.
    ///
    /// The task ends on [`Command::Shutdown`] or once every handle is
    /// dropped; either way playback is stopped first.
    pub fn spawn(
        generator: Arc<dyn TextGenerator>,
        backend: SpeechBackend,
        observer: Arc<dyn ConversationObserver>,
        stt: Option<Arc<dyn SttEngine>>,
        config: &ConversationConfig,
    ) -> (ConversationHandle, JoinHandle<()>) {
        let (engine, state) = TurnEngine::from_config(generator, backend, observer, config);
        let scheduler = TurnScheduler::new(Arc::clone(&engine), config.max_turns);
        let controller = InterruptionController::new(Arc::clone(&engine), scheduler, stt);

        let (commands, rx) = mpsc::channel(COMMAND_QUEUE);
        let task = tokio::spawn(run(engine, controller, rx));
        (ConversationHandle { commands, state }, task)
    }
}

async fn run(
    engine: Arc<TurnEngine>,
    mut controller: InterruptionController,
    mut commands: mpsc::Receiver<Command>,
) {
    log::info!("runner: conversation loop started");

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                log::debug!("runner: {}", describe(&command));

                match command {
                    Command::Start(hosts) => {
                        if let Err(e) = controller.start(hosts).await {
                            log::error!("runner: start failed: {e}");
                            engine.report_error(&e);
                        }
                    }
                    Command::Stop => controller.stop().await,
                    Command::Interrupt(text) => {
                        if let Err(e) = controller.interrupt(&text).await {
                            log::warn!("runner: interruption ignored: {e}");
                            engine.report_error(&e);
                        }
                    }
                    Command::InterruptAudio(samples) => {
                        if let Err(e) = controller.interrupt_with_audio(samples).await {
                            log::warn!("runner: spoken interruption ignored: {e}");
                            engine.report_error(&e);
                        }
                    }
                    Command::Shutdown => break,
                }
            }
            event = controller.next_event() => controller.handle(event),
        }
    }

    controller.stop().await;
    log::info!("runner: conversation loop exited");
}

fn describe(command: &Command) -> String {
    match command {
        Command::Start(hosts) => format!("start with {} hosts", hosts.len()),
        Command::Stop => "stop".into(),
        Command::Interrupt(text) => format!("interrupt {text:?}"),
        Command::InterruptAudio(samples) => format!("spoken interrupt ({} samples)", samples.len()),
        Command::Shutdown => "shutdown".into(),
    }
}
