//! Cache of decoded clips keyed by `(text, voice)`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use sha2::{Digest, Sha256};

use crate::audio::AudioClip;

/// Stable key for a sentence spoken in a given voice.
///
/// The text is normalised (trimmed, inner whitespace collapsed) before
/// hashing so token-boundary differences do not cause misses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(text: &str, voice: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_text(text).as_bytes());
        hasher.update([0x1f]);
        hasher.update(voice.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Collapse runs of whitespace and trim.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Default)]
struct Entries {
    clips: HashMap<CacheKey, Arc<AudioClip>>,
    order: VecDeque<CacheKey>,
}

/// Bounded clip cache with first-in first-out eviction.
///
/// A capacity of zero disables caching.
pub struct AudioCache {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl AudioCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Entries::default()),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<AudioClip>> {
        self.lock().clips.get(key).cloned()
    }

    pub fn insert(&self, key: CacheKey, clip: Arc<AudioClip>) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = self.lock();
        if entries.clips.insert(key.clone(), clip).is_some() {
            return;
        }
        entries.order.push_back(key);
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.clips.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().clips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
