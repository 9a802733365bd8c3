//! Phrase cache (C2)
//!
//! A handful of fixed phrases (greetings, farewells) get synthesized once
//! and reused for every call, instead of round-tripping the TTS vendor on
//! every single dial. Cache key is `hex(md5(text + "-" + voice))`; entries
//! live under [`crate::audio_store::AudioStore`]'s `cache/` subtree and are
//! tracked here only as an LRU index of keys, bounded to a fixed size.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::audio_store::AudioStore;

/// Category a piece of text belongs to, if it is cacheable at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhraseCategory {
    Greeting,
    Farewell,
}

const GREETING_PREFIXES: &[&str] = &[
    "здравствуйте",
    "добрый день",
    "добрый вечер",
    "доброе утро",
];

const FAREWELL_PREFIXES: &[&str] = &["до свидания", "всего доброго", "хорошего дня"];

/// Decide whether `text` is one of the curated cacheable categories.
/// Matching is prefix-based and case-insensitive, mirroring how canned
/// openers/closers are phrased in the script table.
pub fn should_cache(text: &str) -> Option<PhraseCategory> {
    let lower = text.trim().to_lowercase();
    if GREETING_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Some(PhraseCategory::Greeting);
    }
    if FAREWELL_PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return Some(PhraseCategory::Farewell);
    }
    None
}

/// `hex(md5(text + "-" + voice))`, the cache key shared between lookup and
/// store.
pub fn cache_key(text: &str, voice: &str) -> String {
    let digest = md5::compute(format!("{text}-{voice}"));
    hex::encode(digest.0)
}

/// LRU index over [`AudioStore`]'s cache subtree. The audio bytes
/// themselves persist on disk regardless of eviction; eviction here only
/// means the key drops out of the bounded tracking list and is no longer
/// guaranteed warm (a later `lookup` of an evicted-but-still-on-disk file
/// still succeeds, since `AudioStore::get_cached_url` hits the filesystem
/// directly).
pub struct PhraseCache {
    audio_store: std::sync::Arc<AudioStore>,
    order: Mutex<LruCache<String, ()>>,
}

impl PhraseCache {
    pub fn new(audio_store: std::sync::Arc<AudioStore>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        Self {
            audio_store,
            order: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// `lookup(text, voice) -> url?`.
    pub fn lookup(&self, text: &str, voice: &str) -> Option<String> {
        let key = cache_key(text, voice);
        let url = self.audio_store.get_cached_url(&key)?;
        self.touch(&key);
        Some(url)
    }

    /// `store(text, blob, voice) -> url`, evicting the least-recently-used
    /// key from the tracking index once `capacity` is exceeded.
    pub fn store(&self, text: &str, blob: &[u8], voice: &str) -> std::io::Result<String> {
        let key = cache_key(text, voice);
        let url = self.audio_store.put_cached(&key, blob)?;
        self.touch(&key);
        Ok(url)
    }

    fn touch(&self, key: &str) {
        self.order.lock().unwrap().get_or_insert(key.to_string(), || ());
    }

    pub fn tracked_len(&self) -> usize {
        self.order.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorizes_known_greetings_and_farewells() {
        assert_eq!(should_cache("Здравствуйте, это звонок из компании"), Some(PhraseCategory::Greeting));
        assert_eq!(should_cache("До свидания, хорошего дня"), Some(PhraseCategory::Farewell));
        assert_eq!(should_cache("Когда вы сможете оплатить долг?"), None);
    }

    #[test]
    fn cache_key_is_stable_and_voice_sensitive() {
        let a = cache_key("Здравствуйте", "alice");
        let b = cache_key("Здравствуйте", "alice");
        let c = cache_key("Здравствуйте", "bob");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn store_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(AudioStore::new(dir.path(), "http://localhost:3000").unwrap());
        let cache = PhraseCache::new(store, 10);
        assert!(cache.lookup("Здравствуйте", "alice").is_none());
        cache.store("Здравствуйте", b"wav-bytes", "alice").unwrap();
        assert!(cache.lookup("Здравствуйте", "alice").is_some());
    }

    #[test]
    fn lru_index_evicts_oldest_tracked_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(AudioStore::new(dir.path(), "http://localhost:3000").unwrap());
        let cache = PhraseCache::new(store, 2);
        cache.store("a", b"1", "v").unwrap();
        cache.store("b", b"2", "v").unwrap();
        cache.store("c", b"3", "v").unwrap();
        assert_eq!(cache.tracked_len(), 2);
    }
}
