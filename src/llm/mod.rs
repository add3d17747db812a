//! Text generation for the hosts.
//!
//! This module provides:
//! * [`TextGenerator`]: async trait producing a [`TokenStream`] per request.
//! * [`OpenAiGenerator`]: streaming OpenAI-compatible chat client.
//! * [`PromptBuilder`]: host-turn and interruption prompts.
//! * [`GenerationError`]: error variants with retry classification.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use voice_roundtable::config::AppConfig;
//! use voice_roundtable::conversation::History;
//! use voice_roundtable::llm::{OpenAiGenerator, PromptBuilder, TextEvent, TextGenerator};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = AppConfig::default();
//!     let hosts = config.roster();
//!     let generator = OpenAiGenerator::from_config(&config.llm);
//!     let prompts = PromptBuilder::new(&config.conversation.topic, 12);
//!
//!     let request = prompts.host_turn(&hosts[0], &hosts, &History::new());
//!     let mut tokens = generator.generate(&request).await.unwrap();
//!     while let Some(Ok(TextEvent::Token(t))) = tokens.next().await {
//!         print!("{t}");
//!     }
//! }
//! ```

pub mod generator;
pub mod prompt;
pub mod sse;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use generator::{
    ChatMessage, GenerationError, GenerationRequest, OpenAiGenerator, Role, TextEvent,
    TextGenerator, TokenStream,
};
pub use prompt::{summarize_unspoken, PromptBuilder};
pub use sse::SseDecoder;
