//! Lightweight per-engine counters
//!
//! Spec §4.3 asks for "requests, errors, fallbacks, cache hits/misses"
//! metrics from the TTS engine; the same shape is reused for STT and the
//! classifier. This is deliberately not a full exporter (Prometheus,
//! StatsD, ...) — that belongs to the deploy/observability layer the spec
//! keeps out of scope — just atomic counters with a `.snapshot()` method
//! the `/health` handler can read.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic request/error/fallback/cache counters for one engine instance.
#[derive(Debug, Default)]
pub struct EngineCounters {
    requests: AtomicU64,
    errors: AtomicU64,
    fallbacks: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

/// Point-in-time snapshot of [`EngineCounters`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct CountersSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub fallbacks: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

impl EngineCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let c = EngineCounters::new();
        c.record_request();
        c.record_request();
        c.record_error();
        c.record_cache_hit();
        let snap = c.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.cache_hits, 1);
        assert_eq!(snap.fallbacks, 0);
    }
}
