//! Round-robin turn scheduler.
//!
//! The rotation runs as one spawned task that plays turns back to back.  A
//! cancelled turn ends the task without advancing; the caller settles the
//! task (awaits its `JoinHandle`) before anything else may start a turn, so
//! at most one chain ever owns the playback slot.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::TurnEngine;
use super::state::ConversationState;
use super::turn::{ChainError, Host, TurnEnd, TurnOutcome};

// ---------------------------------------------------------------------------
// Rotation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Rotation {
    hosts: Vec<Host>,
    index: usize,
    completed_turns: usize,
}

impl Rotation {
    pub fn new(hosts: Vec<Host>) -> Result<Self, SchedulerError> {
        if hosts.is_empty() {
            return Err(SchedulerError::NoHosts);
        }
        Ok(Self {
            hosts,
            index: 0,
            completed_turns: 0,
        })
    }

    pub fn current(&self) -> &Host {
        &self.hosts[self.index]
    }

    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    pub fn completed_turns(&self) -> usize {
        self.completed_turns
    }

    /// The current host finished a turn.
    pub fn advance(&mut self) {
        self.index = (self.index + 1) % self.hosts.len();
        self.completed_turns += 1;
    }

    /// `id` finished an out-of-order turn; the host after it goes next.
    pub fn advance_past(&mut self, id: &str) {
        match self.hosts.iter().position(|h| h.id == id) {
            Some(pos) => {
                self.index = (pos + 1) % self.hosts.len();
                self.completed_turns += 1;
            }
            None => self.advance(),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors / exits
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("no hosts to schedule")]
    NoHosts,

    #[error("{host}'s turn failed after {attempts} attempts: {source}")]
    TurnFailed {
        host: String,
        attempts: u32,
        source: ChainError,
    },

    #[error("conversation halted: {0}")]
    Fatal(#[source] ChainError),

    #[error("rotation task ended abnormally: {0}")]
    Panicked(String),
}

/// How the rotation task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopExit {
    /// A turn was cancelled; the rotation can be resumed.
    Stopped,
    /// The turn budget is spent.
    Finished,
    /// Forward progress is impossible.
    Halted(SchedulerError),
}

struct LoopResult {
    rotation: Rotation,
    exit: LoopExit,
    interrupted: Option<TurnOutcome>,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<LoopResult>,
}

// ---------------------------------------------------------------------------
// TurnScheduler
// ---------------------------------------------------------------------------

pub struct TurnScheduler {
    engine: Arc<TurnEngine>,
    max_turns: Option<usize>,
    rotation: Option<Rotation>,
    running: Option<Running>,
    /// Between `start` and `stop` (or the rotation ending on its own).
    active: bool,
}

impl TurnScheduler {
    pub fn new(engine: Arc<TurnEngine>, max_turns: Option<usize>) -> Self {
        Self {
            engine,
            max_turns,
            rotation: None,
            running: None,
            active: false,
        }
    }

    /// Begin a fresh rotation over `hosts`, replacing any previous one.
    pub async fn start(&mut self, hosts: Vec<Host>) -> Result<(), SchedulerError> {
        let rotation = Rotation::new(hosts)?;
        self.pause().await;

        log::info!(
            "scheduler: starting rotation with {} hosts",
            rotation.hosts().len()
        );
        self.active = true;
        self.spawn(rotation);
        Ok(())
    }

    /// End the rotation; returns the turn that was cut off, if any.
    pub async fn stop(&mut self) -> Option<TurnOutcome> {
        self.active = false;
        let interrupted = self.pause().await;
        self.engine.set_state(ConversationState::Idle);
        log::info!("scheduler: stopped");
        interrupted
    }

    /// Cancel the running turn and wait for the task to settle.
    ///
    /// The rotation stays active; [`resume`](Self::resume) continues it.
    pub async fn pause(&mut self) -> Option<TurnOutcome> {
        self.cancel_running();
        let (exit, interrupted) = self.settle().await?;
        if exit != LoopExit::Stopped {
            self.active = false;
        }
        interrupted
    }

    /// Fire the running turn's token without waiting.
    pub fn cancel_running(&self) {
        if let Some(running) = &self.running {
            running.cancel.cancel();
        }
    }

    /// Restart the rotation task from the current host.
    ///
    /// Returns `false` when stopped, already running, or never started.
    pub fn resume(&mut self) -> bool {
        if !self.active || self.running.is_some() {
            return false;
        }
        let Some(rotation) = self.rotation.take() else {
            return false;
        };
        log::debug!("scheduler: resuming with {}", rotation.current().name);
        self.spawn(rotation);
        true
    }

    /// Wait for the rotation task to end on its own.
    ///
    /// Never resolves while no task is running.  Cancel-safe.
    pub async fn wait(&mut self) -> LoopExit {
        match self.settle().await {
            Some((exit, _)) => {
                if exit != LoopExit::Stopped {
                    self.active = false;
                }
                exit
            }
            None => futures::future::pending().await,
        }
    }

    /// Move the rotation past `id` after it answered out of turn.
    pub fn advance_past(&mut self, id: &str) {
        if let Some(rotation) = self.rotation.as_mut() {
            rotation.advance_past(id);
        }
    }

    /// The host that speaks next; `None` while the task owns the rotation.
    pub fn current_host(&self) -> Option<&Host> {
        self.rotation.as_ref().map(Rotation::current)
    }

    pub fn rotation(&self) -> Option<&Rotation> {
        self.rotation.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    fn spawn(&mut self, rotation: Rotation) {
        self.rotation = None;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.engine),
            rotation,
            cancel.clone(),
            self.max_turns,
        ));
        self.running = Some(Running { cancel, handle });
    }

    async fn settle(&mut self) -> Option<(LoopExit, Option<TurnOutcome>)> {
        let running = self.running.as_mut()?;
        let joined = (&mut running.handle).await;
        self.running = None;

        match joined {
            Ok(result) => {
                self.rotation = Some(result.rotation);
                Some((result.exit, result.interrupted))
            }
            Err(e) => {
                log::error!("scheduler: rotation task failed: {e}");
                let error = SchedulerError::Panicked(e.to_string());
                self.engine.report_error(&error);
                self.engine.set_state(ConversationState::Idle);
                Some((LoopExit::Halted(error), None))
            }
        }
    }
}

impl Drop for TurnScheduler {
    fn drop(&mut self) {
        self.cancel_running();
    }
}

// ---------------------------------------------------------------------------
// Rotation task
// ---------------------------------------------------------------------------

async fn run_loop(
    engine: Arc<TurnEngine>,
    mut rotation: Rotation,
    cancel: CancellationToken,
    max_turns: Option<usize>,
) -> LoopResult {
    let policy = engine.policy();
    let mut failures = 0u32;

    let finish = |rotation, exit, interrupted| LoopResult {
        rotation,
        exit,
        interrupted,
    };

    loop {
        if cancel.is_cancelled() {
            return finish(rotation, LoopExit::Stopped, None);
        }
        if max_turns.is_some_and(|max| rotation.completed_turns() >= max) {
            log::info!(
                "scheduler: turn budget of {} reached",
                rotation.completed_turns()
            );
            return finish(rotation, LoopExit::Finished, None);
        }

        let host = rotation.current().clone();
        let request = engine.host_turn_request(&host, rotation.hosts());
        let outcome = engine
            .run_turn(&host, rotation.hosts(), request, cancel.clone())
            .await;

        let error = match outcome.end {
            TurnEnd::Completed => {
                failures = 0;
                rotation.advance();
                continue;
            }
            TurnEnd::Cancelled => {
                return finish(rotation, LoopExit::Stopped, Some(outcome));
            }
            TurnEnd::Failed(ref e) => e.clone(),
        };

        if error.is_fatal() {
            let error = SchedulerError::Fatal(error);
            log::error!("scheduler: {error}");
            engine.report_error(&error);
            return finish(rotation, LoopExit::Halted(error), None);
        }

        failures += 1;
        if failures > policy.max_turn_retries {
            let error = SchedulerError::TurnFailed {
                host: host.name.clone(),
                attempts: failures,
                source: error,
            };
            log::error!("scheduler: {error}");
            engine.report_error(&error);
            return finish(rotation, LoopExit::Halted(error), None);
        }

        log::warn!(
            "scheduler: {}'s turn failed ({error}), retrying in {:?}",
            host.name,
            policy.turn_retry_delay
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return finish(rotation, LoopExit::Stopped, None),
            _ = tokio::time::sleep(policy.turn_retry_delay) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
