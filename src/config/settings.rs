//! Application settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across threads.
//! Runtime views ([`DispatchConfig`], [`RetryPolicy`], [`PcmFormat`]) are
//! derived from these sections by the engine.

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::audio::PcmFormat;
use crate::conversation::{Host, RetryPolicy};
use crate::speech::DispatchConfig;

// ---------------------------------------------------------------------------
// HostConfig
// ---------------------------------------------------------------------------

/// One simulated speaker in the rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Stable identifier used in history records.
    pub id: String,
    /// Display name; also the speaker label stripped from generated text.
    pub name: String,
    /// Voice identity passed to the synthesis service.
    pub voice: String,
    /// Short persona description injected into the host's system prompt.
    pub persona: String,
}

impl HostConfig {
    /// Runtime [`Host`] for this entry.
    pub fn to_host(&self) -> Host {
        Host::new(&self.id, &self.name, &self.voice, &self.persona)
    }
}

fn default_hosts() -> Vec<HostConfig> {
    vec![
        HostConfig {
            id: "ava".into(),
            name: "Ava".into(),
            voice: "nova".into(),
            persona: "a curious interviewer who asks sharp follow-up questions".into(),
        },
        HostConfig {
            id: "ben".into(),
            name: "Ben".into(),
            voice: "onyx".into(),
            persona: "a patient expert who explains ideas with concrete examples".into(),
        },
    ]
}

// ---------------------------------------------------------------------------
// ConversationConfig
// ---------------------------------------------------------------------------

/// Turn-taking behaviour and retry bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Subject the hosts discuss.
    pub topic: String,
    /// Number of history records included in every generation request.
    pub history_window: usize,
    /// Retries of a dropped text stream within one turn.
    pub text_source_retries: u32,
    /// Delay before re-opening a dropped text stream.
    pub text_retry_delay_ms: u64,
    /// Retries of the same host's turn after a chain failure.
    pub max_turn_retries: u32,
    /// Wait before retrying the same host's turn.
    pub turn_retry_delay_ms: u64,
    /// Stop the rotation after this many completed turns. `None` runs until
    /// stopped.
    pub max_turns: Option<usize>,
    /// Word budget for the summary of cut-off text in interruption prompts.
    pub unspoken_summary_words: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            topic: "how everyday technology is changing the way people learn".into(),
            history_window: 12,
            text_source_retries: 1,
            text_retry_delay_ms: 500,
            max_turn_retries: 1,
            turn_retry_delay_ms: 2_000,
            max_turns: None,
            unspoken_summary_words: 24,
        }
    }
}

impl ConversationConfig {
    /// Retry bounds for the speaking chain and the scheduler.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            text_source_retries: self.text_source_retries,
            text_retry_delay: Duration::from_millis(self.text_retry_delay_ms),
            max_turn_retries: self.max_turn_retries,
            turn_retry_delay: Duration::from_millis(self.turn_retry_delay_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// LlmConfig
// ---------------------------------------------------------------------------

/// Settings for the streaming text-generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Base URL of an OpenAI-compatible API (e.g. `https://api.openai.com`,
    /// `http://localhost:11434` for Ollama).
    pub base_url: String,
    /// API key, `None` for local providers.
    pub api_key: Option<String>,
    /// Model identifier sent to the API.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Upper bound on generated tokens per turn.
    pub max_tokens: u32,
    /// Seconds to wait for the stream to open before timing out.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            api_key: None,
            model: "qwen2.5:3b".into(),
            temperature: 0.8,
            max_tokens: 220,
            timeout_secs: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// TtsConfig
// ---------------------------------------------------------------------------

/// Settings for the speech-synthesis service and the dispatcher in front of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Base URL of an OpenAI-compatible `/v1/audio/speech` endpoint.
    pub base_url: String,
    /// API key, `None` for local providers.
    pub api_key: Option<String>,
    /// Synthesis model identifier.
    pub model: String,
    /// Sample rate of the raw 16-bit PCM returned by the service.
    pub sample_rate: u32,
    /// Interleaved channels in the returned PCM.
    pub channels: u16,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Synthesis requests allowed in flight at once.
    pub max_concurrent_requests: usize,
    /// Minimum spacing between consecutive synthesis requests.
    pub request_spacing_ms: u64,
    /// Longest wait between re-queues of a rate-limited sentence.
    pub max_rate_limit_backoff_ms: u64,
    /// Times a transient synthesis failure is retried before it is skipped.
    pub max_transient_retries: u32,
    /// Number of synthesized clips kept for reuse. `0` disables the cache.
    pub cache_capacity: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            api_key: None,
            model: "tts-1".into(),
            sample_rate: 24_000,
            channels: 1,
            timeout_secs: 30,
            max_concurrent_requests: 2,
            request_spacing_ms: 250,
            max_rate_limit_backoff_ms: 8_000,
            max_transient_retries: 1,
            cache_capacity: 64,
        }
    }
}

impl TtsConfig {
    /// Format of the audio bytes returned by the service.
    pub fn pcm_format(&self) -> PcmFormat {
        PcmFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }

    /// Dispatcher tuning derived from this section.
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_concurrent_fetches: self.max_concurrent_requests.max(1),
            request_spacing: Duration::from_millis(self.request_spacing_ms),
            max_rate_limit_backoff: Duration::from_millis(self.max_rate_limit_backoff_ms),
            max_transient_retries: self.max_transient_retries,
            format: self.pcm_format(),
        }
    }
}

// ---------------------------------------------------------------------------
// SttConfig
// ---------------------------------------------------------------------------

/// Settings for the Whisper STT engine used for spoken interruptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// GGML model stem under the models directory (e.g. `"ggml-base.en"`), or a path to a `.bin` file.
    pub model: String,
    /// ISO-639-1 language code, or `"auto"`.
    pub language: String,
    /// Attempt GPU-accelerated inference when available.
    pub use_gpu: bool,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            model: "ggml-base.en".into(),
            language: "en".into(),
            use_gpu: false,
        }
    }
}

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Output device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Play through the default speaker. When `false` (or when the crate is
    /// built without the `device` feature) clips are "played" silently in
    /// real time, which keeps captions paced for headless runs.
    pub use_device: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { use_device: true }
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level application configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use voice_roundtable::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let config = AppConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Turn-taking and retry settings.
    pub conversation: ConversationConfig,
    /// Text-generation backend.
    pub llm: LlmConfig,
    /// Speech-synthesis backend and dispatcher tuning.
    pub tts: TtsConfig,
    /// Speech-to-text for spoken interruptions.
    pub stt: SttConfig,
    /// Output device.
    pub audio: AudioConfig,
    /// Speakers, in rotation order.
    #[serde(default = "default_hosts")]
    pub hosts: Vec<HostConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            conversation: ConversationConfig::default(),
            llm: LlmConfig::default(),
            tts: TtsConfig::default(),
            stt: SttConfig::default(),
            audio: AudioConfig::default(),
            hosts: default_hosts(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Runtime hosts in rotation order.
    pub fn roster(&self) -> Vec<Host> {
        self.hosts.iter().map(HostConfig::to_host).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = AppConfig::default();
        original.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(original.conversation.topic, loaded.conversation.topic);
        assert_eq!(original.conversation.max_turns, loaded.conversation.max_turns);
        assert_eq!(original.llm.base_url, loaded.llm.base_url);
        assert_eq!(original.llm.api_key, loaded.llm.api_key);
        assert_eq!(original.tts.sample_rate, loaded.tts.sample_rate);
        assert_eq!(
            original.tts.max_concurrent_requests,
            loaded.tts.max_concurrent_requests
        );
        assert_eq!(original.stt.model, loaded.stt.model);
        assert_eq!(original.audio.use_device, loaded.audio.use_device);
        assert_eq!(original.hosts, loaded.hosts);
    }

    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = AppConfig::load_from(&path).expect("should not error");
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.llm.model, LlmConfig::default().model);
    }

    #[test]
    fn default_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.tts.max_concurrent_requests, 2);
        assert_eq!(cfg.tts.request_spacing_ms, 250);
        assert_eq!(cfg.conversation.text_source_retries, 1);
        assert_eq!(cfg.conversation.max_turn_retries, 1);
        assert!(cfg.conversation.max_turns.is_none());
        assert_eq!(cfg.hosts[0].name, "Ava");
        assert_eq!(cfg.hosts[1].name, "Ben");
    }

    #[test]
    fn round_trip_modified_values() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("modified.toml");

        let mut cfg = AppConfig::default();
        cfg.conversation.max_turns = Some(6);
        cfg.llm.api_key = Some("sk-test".into());
        cfg.tts.cache_capacity = 0;
        cfg.hosts.push(HostConfig {
            id: "cleo".into(),
            name: "Cleo".into(),
            voice: "shimmer".into(),
            persona: "a skeptic".into(),
        });

        cfg.save_to(&path).expect("save");
        let loaded = AppConfig::load_from(&path).expect("load");

        assert_eq!(loaded.conversation.max_turns, Some(6));
        assert_eq!(loaded.llm.api_key, Some("sk-test".into()));
        assert_eq!(loaded.tts.cache_capacity, 0);
        assert_eq!(loaded.hosts.len(), 3);
        assert_eq!(loaded.roster()[2].name, "Cleo");
    }

    #[test]
    fn hosts_default_when_section_missing() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("no-hosts.toml");

        let mut text = toml::to_string_pretty(&AppConfig::default()).expect("serialise");
        if let Some(pos) = text.find("[[hosts]]") {
            text.truncate(pos);
        }
        std::fs::write(&path, text).expect("write");

        let loaded = AppConfig::load_from(&path).expect("load");
        assert_eq!(loaded.hosts, default_hosts());
    }

    #[test]
    fn dispatch_config_clamps_concurrency() {
        let mut tts = TtsConfig::default();
        tts.max_concurrent_requests = 0;
        let dispatch = tts.dispatch_config();
        assert_eq!(dispatch.max_concurrent_fetches, 1);
        assert_eq!(dispatch.request_spacing, Duration::from_millis(250));
        assert_eq!(dispatch.format.sample_rate, 24_000);
    }

    #[test]
    fn retry_policy_uses_millis() {
        let policy = ConversationConfig::default().retry_policy();
        assert_eq!(policy.text_retry_delay, Duration::from_millis(500));
        assert_eq!(policy.turn_retry_delay, Duration::from_secs(2));
    }
}
