//! Listener interface for the UI and logging layers.
//!
//! Notifications are plain synchronous calls made by the engine as things
//! happen.  Implementations must return quickly; anything slow belongs on
//! the far side of a channel (see [`ChannelObserver`]).

use std::sync::Arc;

use tokio::sync::mpsc;

use super::segmenter::Sentence;
use super::state::ConversationState;
use super::turn::{Host, TurnOutcome};

pub trait ConversationObserver: Send + Sync {
    fn on_state(&self, _state: ConversationState) {}

    /// A sentence's audio has started playing.
    fn on_sentence(&self, _host: &Host, _sentence: &Sentence) {}

    fn on_turn_end(&self, _outcome: &TurnOutcome) {}

    /// An error that stopped a turn, a reply or the whole rotation.
    fn on_error(&self, _error: &(dyn std::error::Error + Send + Sync)) {}
}

// ---------------------------------------------------------------------------
// LogObserver
// ---------------------------------------------------------------------------

/// Writes every notification to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl ConversationObserver for LogObserver {
    fn on_state(&self, state: ConversationState) {
        log::info!("conversation: {state}");
    }

    fn on_sentence(&self, host: &Host, sentence: &Sentence) {
        log::info!("conversation: {} #{}: {}", host.name, sentence.index, sentence.text);
    }

    fn on_turn_end(&self, outcome: &TurnOutcome) {
        log::debug!(
            "conversation: turn {} ({}) ended {:?}; spoken {} / unspoken {} / skipped {}",
            outcome.turn_id,
            outcome.host.name,
            outcome.end,
            outcome.spoken.len(),
            outcome.unspoken.len(),
            outcome.skipped.len()
        );
    }

    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        log::error!("conversation: {error}");
    }
}

// ---------------------------------------------------------------------------
// ChannelObserver
// ---------------------------------------------------------------------------

/// Owned copy of one notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    State(ConversationState),
    Sentence { host: Host, sentence: Sentence },
    TurnEnded(TurnOutcome),
    Error(String),
}

/// Forwards notifications over an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<ConversationEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: ConversationEvent) {
        // A dropped receiver just means nobody is watching any more.
        let _ = self.tx.send(event);
    }
}

impl ConversationObserver for ChannelObserver {
    fn on_state(&self, state: ConversationState) {
        self.send(ConversationEvent::State(state));
    }

    fn on_sentence(&self, host: &Host, sentence: &Sentence) {
        self.send(ConversationEvent::Sentence {
            host: host.clone(),
            sentence: sentence.clone(),
        });
    }

    fn on_turn_end(&self, outcome: &TurnOutcome) {
        self.send(ConversationEvent::TurnEnded(outcome.clone()));
    }

    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        self.send(ConversationEvent::Error(error.to_string()));
    }
}

// ---------------------------------------------------------------------------
// Observers (fan-out)
// ---------------------------------------------------------------------------

/// Delivers each notification to several observers in order.
#[derive(Default, Clone)]
pub struct Observers {
    inner: Vec<Arc<dyn ConversationObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ConversationObserver>) -> Self {
        self.inner.push(observer);
        self
    }
}

impl ConversationObserver for Observers {
    fn on_state(&self, state: ConversationState) {
        self.inner.iter().for_each(|o| o.on_state(state));
    }

    fn on_sentence(&self, host: &Host, sentence: &Sentence) {
        self.inner.iter().for_each(|o| o.on_sentence(host, sentence));
    }

    fn on_turn_end(&self, outcome: &TurnOutcome) {
        self.inner.iter().for_each(|o| o.on_turn_end(outcome));
    }

    fn on_error(&self, error: &(dyn std::error::Error + Send + Sync)) {
        self.inner.iter().for_each(|o| o.on_error(error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChainError;
    use crate::testing::EventLog;

    #[test]
    fn channel_observer_forwards_owned_events() {
        let (observer, mut rx) = ChannelObserver::new();
        let host = Host::new("a", "A", "nova", "");
        let sentence = Sentence {
            index: 0,
            text: "Hi.".into(),
        };

        observer.on_state(ConversationState::Thinking);
        observer.on_sentence(&host, &sentence);
        observer.on_error(&ChainError::DispatcherClosed);

        assert_eq!(
            rx.try_recv().unwrap(),
            ConversationEvent::State(ConversationState::Thinking)
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            ConversationEvent::Sentence { host, sentence }
        );
        assert!(matches!(rx.try_recv().unwrap(), ConversationEvent::Error(msg) if msg.contains("dispatcher")));
    }

    #[test]
    fn channel_observer_survives_dropped_receiver() {
        let (observer, rx) = ChannelObserver::new();
        drop(rx);
        observer.on_state(ConversationState::Idle);
    }

    #[test]
    fn fan_out_reaches_every_observer() {
        let a = Arc::new(EventLog::default());
        let b = Arc::new(EventLog::default());
        let all = Observers::new()
            .with(a.clone())
            .with(b.clone())
            .with(Arc::new(LogObserver));

        all.on_state(ConversationState::Speaking);
        assert_eq!(a.states(), vec![ConversationState::Speaking]);
        assert_eq!(b.states(), vec![ConversationState::Speaking]);
    }
}
