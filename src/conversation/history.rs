//! Append-only conversation history.

use chrono::{DateTime, Utc};

use super::turn::Host;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Speaker {
    Host { id: String, name: String },
    User,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything actually heard during a session, in order.
///
/// Records are only ever appended; used to build prompts, never rewritten.
#[derive(Debug, Clone, Default)]
pub struct History {
    records: Vec<HistoryRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_host(&mut self, host: &Host, text: &str) {
        self.push(
            Speaker::Host {
                id: host.id.clone(),
                name: host.name.clone(),
            },
            text,
        );
    }

    pub fn push_user(&mut self, text: &str) {
        self.push(Speaker::User, text);
    }

    fn push(&mut self, speaker: Speaker, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        self.records.push(HistoryRecord {
            speaker,
            text: text.to_owned(),
            timestamp: Utc::now(),
        });
    }

    /// The last `n` records, oldest first.
    pub fn recent(&self, n: usize) -> &[HistoryRecord] {
        let start = self.records.len().saturating_sub(n);
        &self.records[start..]
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
