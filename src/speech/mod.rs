//! Speech synthesis: the service client, request pacing, the clip cache and
//! the per-turn [`SpeechDispatcher`].

pub mod cache;
pub mod dispatcher;
pub mod pacer;
pub mod synth;

pub use cache::{normalize_text, AudioCache, CacheKey};
pub use dispatcher::{DispatchConfig, DispatchError, DispatchEvent, SpeechBackend, SpeechDispatcher};
pub use pacer::RequestPacer;
pub use synth::{OpenAiSynthesizer, SpeechSynthesizer, SynthError};
