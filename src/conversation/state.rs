//! Conversation state machine.
//!
//! ```text
//! Idle ──turn begins──▶ Thinking ──first sentence plays──▶ Speaking ──turn done──▶ Idle
//! Thinking / Speaking ──user interrupts──▶ Listening ──reply requested──▶ Thinking
//! ```
//!
//! The current value lives in a `tokio::sync::watch` channel so any number of
//! observers can follow it; [`StateCell`] is the single writer.

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;

use super::observer::ConversationObserver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConversationState {
    /// Nothing is being generated or played.
    #[default]
    Idle,
    /// The listener has the floor; any turn in progress was cancelled.
    Listening,
    /// A reply has been requested and no audio has started yet.
    Thinking,
    /// A host's audio is playing.
    Speaking,
}

impl ConversationState {
    /// ```
    /// use voice_roundtable::conversation::ConversationState;
    ///
    /// assert!(!ConversationState::Idle.is_busy());
    /// assert!(!ConversationState::Listening.is_busy());
    /// assert!(ConversationState::Thinking.is_busy());
    /// assert!(ConversationState::Speaking.is_busy());
    /// ```
    pub fn is_busy(&self) -> bool {
        matches!(self, ConversationState::Thinking | ConversationState::Speaking)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConversationState::Idle => "Idle",
            ConversationState::Listening => "Listening",
            ConversationState::Thinking => "Thinking",
            ConversationState::Speaking => "Speaking",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Writer side of the state channel; notifies the observer on every change.
#[derive(Clone)]
pub struct StateCell {
    tx: Arc<watch::Sender<ConversationState>>,
    observer: Arc<dyn ConversationObserver>,
}

impl StateCell {
    pub fn new(observer: Arc<dyn ConversationObserver>) -> (Self, watch::Receiver<ConversationState>) {
        let (tx, rx) = watch::channel(ConversationState::Idle);
        let cell = Self {
            tx: Arc::new(tx),
            observer,
        };
        (cell, rx)
    }

    /// Move to `next`; a no-op if already there.
    pub fn set(&self, next: ConversationState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            log::debug!("state: → {next}");
            self.observer.on_state(next);
        }
    }

    pub fn get(&self) -> ConversationState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationState> {
        self.tx.subscribe()
    }
}
