//! The conversation core: segmentation, turns, scheduling and interruption.
//!
//! ```text
//! ConversationHandle ─▶ runner ─▶ InterruptionController ─▶ TurnScheduler (round-robin task)
//!                                          │                      │
//!                                          └──── reply turns ─────┴─▶ TurnEngine::run_turn
//!                                                                        └─▶ SpeakingChain
//!                                                                              ├─ SentenceSegmenter
//!                                                                              └─ SpeechDispatcher
//! ```
//!
//! Only one turn is ever active.  Every path that starts a turn first awaits
//! the settlement of the previous one.

pub mod chain;
pub mod engine;
pub mod history;
pub mod interrupt;
pub mod observer;
pub mod runner;
pub mod scheduler;
pub mod segmenter;
pub mod state;
pub mod turn;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use chain::SpeakingChain;
pub use engine::TurnEngine;
pub use history::{History, HistoryRecord, Speaker};
pub use interrupt::{ControllerEvent, InterruptError, InterruptionController};
pub use observer::{
    ChannelObserver, ConversationEvent, ConversationObserver, LogObserver, Observers,
};
pub use runner::{Command, Conversation, ConversationClosed, ConversationHandle};
pub use scheduler::{LoopExit, Rotation, SchedulerError, TurnScheduler};
pub use segmenter::{clean_speaker_labels, LabelCleaner, Sentence, SentenceSegmenter};
pub use state::{ConversationState, StateCell};
pub use turn::{ChainError, Host, RetryPolicy, SpeakingTurn, TurnEnd, TurnOutcome};
