//! Prompt construction for host turns and interruption replies.
//!
//! [`PromptBuilder`] produces chat-message requests for any OpenAI-compatible
//! `/v1/chat/completions` endpoint:
//! * **Host turn** (`host_turn`): persona + roster + topic, the recent
//!   history, and a cue that it is this host's turn.
//! * **Interruption** (`interruption`): the same context plus what the host
//!   had already said, a short summary of what was cut off, and the
//!   listener's words.
//!
//! The host's own earlier lines are sent as `assistant` messages; everyone
//! else is sent as `user` messages prefixed with their display name.

use crate::conversation::{Host, History, Speaker};
use crate::llm::generator::{ChatMessage, GenerationRequest};

// ---------------------------------------------------------------------------
// System instructions
// ---------------------------------------------------------------------------

const SPEAKING_RULES: &str = "\
Rules:
1. Your words are spoken aloud. Write plain sentences; no lists, markdown, emoji or stage directions.
2. Keep each reply to two or three short sentences.
3. Never start with your own name or any speaker label.
4. Speak only for yourself; never write lines for the other hosts.";

const LISTENER_NAME: &str = "Listener";

// ---------------------------------------------------------------------------
// PromptBuilder
// ---------------------------------------------------------------------------

/// Builds generation requests for the hosts.
///
/// # Example
/// ```rust
/// use voice_roundtable::conversation::{History, Host};
/// use voice_roundtable::llm::PromptBuilder;
///
/// let ava = Host::new("ava", "Ava", "nova", "A curious science journalist.");
/// let ben = Host::new("ben", "Ben", "onyx", "A sceptical engineer.");
/// let builder = PromptBuilder::new("tidal energy", 12);
///
/// let request = builder.host_turn(&ava, &[ava.clone(), ben], &History::new());
/// assert!(request.messages[0].content.contains("tidal energy"));
/// ```
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    topic: String,
    history_window: usize,
}

impl PromptBuilder {
    pub fn new(topic: &str, history_window: usize) -> Self {
        Self {
            topic: topic.to_owned(),
            history_window,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Request for `host`'s next regular turn.
    pub fn host_turn(&self, host: &Host, hosts: &[Host], history: &History) -> GenerationRequest {
        let mut messages = vec![ChatMessage::system(self.system_message(host, hosts))];
        messages.extend(self.history_messages(host, history));

        let cue = if history.is_empty() {
            format!("Open the conversation about {}, {}.", self.topic, host.name)
        } else {
            format!("It is your turn, {}.", host.name)
        };
        messages.push(ChatMessage::user(cue));

        GenerationRequest::new(messages)
    }

    /// Request for `host`'s reply to a listener interruption.
    ///
    /// `unspoken_summary` is a shortened form of what was cut off; it is
    /// offered as context only so the reply does not replay it verbatim.
    pub fn interruption(
        &self,
        host: &Host,
        hosts: &[Host],
        history: &History,
        spoken: &str,
        unspoken_summary: Option<&str>,
        utterance: &str,
    ) -> GenerationRequest {
        let mut messages = vec![ChatMessage::system(self.system_message(host, hosts))];
        messages.extend(self.history_messages(host, history));

        let mut note = String::from("The listener just interrupted the conversation.\n");
        if spoken.trim().is_empty() {
            note.push_str("You had not started speaking yet.\n");
        } else {
            note.push_str(&format!("You had already said aloud: \"{}\"\n", spoken.trim()));
        }
        if let Some(summary) = unspoken_summary.filter(|s| !s.trim().is_empty()) {
            note.push_str(&format!(
                "You were about to say, but the listener never heard: \"{summary}\"\n"
            ));
        }
        note.push_str(&format!("The listener said: \"{}\"\n", utterance.trim()));
        note.push_str(
            "Answer the listener directly, acknowledge the interruption naturally, \
             and do not repeat the cut-off part word for word.",
        );
        messages.push(ChatMessage::user(note));

        GenerationRequest::new(messages)
    }

    fn system_message(&self, host: &Host, hosts: &[Host]) -> String {
        let others: Vec<&str> = hosts
            .iter()
            .filter(|h| h.id != host.id)
            .map(|h| h.name.as_str())
            .collect();

        let mut msg = format!("You are {}, a host on a live spoken discussion.\n", host.name);
        if !host.persona.trim().is_empty() {
            msg.push_str(&format!("Persona: {}\n", host.persona.trim()));
        }
        if !others.is_empty() {
            msg.push_str(&format!("Other hosts: {}.\n", others.join(", ")));
        }
        msg.push_str(&format!("Topic: {}\n", self.topic));
        msg.push_str(&format!(
            "A listener ({LISTENER_NAME}) may interrupt at any time.\n\n"
        ));
        msg.push_str(SPEAKING_RULES);
        msg
    }

    fn history_messages(&self, host: &Host, history: &History) -> Vec<ChatMessage> {
        history
            .recent(self.history_window)
            .iter()
            .map(|record| match &record.speaker {
                Speaker::Host { id, .. } if *id == host.id => ChatMessage::assistant(&record.text),
                Speaker::Host { name, .. } => {
                    ChatMessage::user(format!("{name}: {}", record.text))
                }
                Speaker::User => ChatMessage::user(format!("{LISTENER_NAME}: {}", record.text)),
            })
            .collect()
    }
}

/// Shorten cut-off text to at most `max_words` words.
pub fn summarize_unspoken(text: &str, max_words: usize) -> Option<String> {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() || max_words == 0 {
        return None;
    }
    if words.len() <= max_words {
        return Some(words.join(" "));
    }
    Some(format!("{}...", words[..max_words].join(" ")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
