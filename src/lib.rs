//! Real-time spoken round-table: simulated hosts take turns talking about a
//! topic, and a listener can cut in at any moment by typing or speaking.
//!
//! The crate is organised by concern:
//!
//! * [`conversation`]: sentence segmentation, turns, scheduling, interruption
//!   and the [`conversation::Conversation`] facade.
//! * [`llm`]: streaming text generation and prompt construction.
//! * [`speech`]: speech synthesis, pacing, caching and the per-turn dispatcher.
//! * [`audio`]: PCM clips, the single playback slot and device I/O.
//! * [`stt`]: speech-to-text for spoken interruptions.
//! * [`config`]: TOML settings and platform paths.

pub mod audio;
pub mod config;
pub mod conversation;
pub mod llm;
pub mod speech;
pub mod stt;

#[cfg(test)]
mod testing;
