//! AudioStore (C1)
//!
//! Persists synthesized audio blobs and hands back retrieval URLs the
//! carrier can fetch. Two subtrees: `temp/` for per-call audio that is
//! purged after a delay, and `cache/` for [`crate::phrase_cache`] entries
//! that are considered permanent. Writes are atomic (write to a `.tmp`
//! sibling, then rename) so a concurrent purge never observes a partial
//! file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a stored temp blob was produced for; mirrors §3 PendingAudio's
/// `produced-for-type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioKind {
    Greeting,
    Response,
    SilenceResponse,
    Farewell,
}

/// Snapshot returned by [`AudioStore::stats`].
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct AudioStoreStats {
    pub temp_count: usize,
    pub cache_count: usize,
}

struct TrackedFile {
    last_served_at: Instant,
}

/// Durable local-disk store for synthesized audio, fronted by public URLs
/// built from the configured `server_url`.
pub struct AudioStore {
    base_dir: PathBuf,
    server_url: String,
    /// Tracks when each temp file's URL was last handed out, so
    /// [`purge_older_than`] never deletes a file returned within the last
    /// minute (§4.1 guarantee).
    served_at: Mutex<HashMap<PathBuf, TrackedFile>>,
}

impl AudioStore {
    pub fn new(base_dir: impl Into<PathBuf>, server_url: impl Into<String>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("temp"))?;
        std::fs::create_dir_all(base_dir.join("cache"))?;
        Ok(Self {
            base_dir,
            server_url: server_url.into(),
            served_at: Mutex::new(HashMap::new()),
        })
    }

    fn temp_dir(&self) -> PathBuf {
        self.base_dir.join("temp")
    }

    fn cache_dir(&self) -> PathBuf {
        self.base_dir.join("cache")
    }

    fn url_for(&self, rel_path: &Path) -> String {
        format!("{}/audio/{}", self.server_url.trim_end_matches('/'), rel_path.display())
    }

    /// Atomically write `blob` and return its public URL. Used for both
    /// temp and cache writes; `dir` selects the subtree.
    fn write_atomic(&self, dir: &Path, filename: &str, blob: &[u8]) -> std::io::Result<PathBuf> {
        let final_path = dir.join(filename);
        let tmp_path = dir.join(format!("{filename}.tmp"));
        std::fs::write(&tmp_path, blob)?;
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(final_path)
    }

    /// `put(call-id, blob, type) → {url, internal-id}` (§4.1).
    pub fn put(&self, call_id: Uuid, blob: &[u8], kind: AudioKind) -> std::io::Result<(String, String)> {
        let internal_id = Uuid::new_v4().to_string();
        let ext = "wav";
        let filename = format!("{call_id}-{}-{internal_id}.{ext}", kind_label(kind));
        let path = self.write_atomic(&self.temp_dir(), &filename, blob)?;
        let rel = Path::new("temp").join(&filename);
        let url = self.url_for(&rel);
        self.served_at.lock().unwrap().insert(
            path,
            TrackedFile { last_served_at: Instant::now() },
        );
        debug!(call_id = %call_id, kind = ?kind, %url, "stored temp audio");
        Ok((url, internal_id))
    }

    /// `put_cached(key, blob) → url` (§4.1).
    pub fn put_cached(&self, key: &str, blob: &[u8]) -> std::io::Result<String> {
        let filename = format!("{key}.wav");
        self.write_atomic(&self.cache_dir(), &filename, blob)?;
        let rel = Path::new("cache").join(&filename);
        Ok(self.url_for(&rel))
    }

    /// `get_cached_url(key) → url?` (§4.1).
    pub fn get_cached_url(&self, key: &str) -> Option<String> {
        let filename = format!("{key}.wav");
        let path = self.cache_dir().join(&filename);
        if path.exists() {
            let rel = Path::new("cache").join(&filename);
            Some(self.url_for(&rel))
        } else {
            None
        }
    }

    /// Read a blob back from disk given its URL path suffix
    /// (`temp/<file>` or `cache/<file>`), for the `/audio/{id}` responder.
    pub fn read(&self, rel_path: &str) -> std::io::Result<Vec<u8>> {
        // Reject traversal outside the store root.
        if rel_path.contains("..") {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid path"));
        }
        std::fs::read(self.base_dir.join(rel_path))
    }

    /// `purge_older_than(duration)` (§4.1). Never deletes a file whose URL
    /// was handed out within the last minute.
    pub fn purge_older_than(&self, age: Duration) -> std::io::Result<usize> {
        let min_retain = Duration::from_secs(60);
        let mut removed = 0;
        let now = Instant::now();
        let mut served = self.served_at.lock().unwrap();

        let entries = match std::fs::read_dir(self.temp_dir()) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "failed to list temp audio dir during purge");
                return Ok(0);
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let Ok(file_age) = modified.elapsed() else { continue };
            if file_age < age {
                continue;
            }
            if let Some(tracked) = served.get(&path) {
                if now.duration_since(tracked.last_served_at) < min_retain {
                    continue;
                }
            }
            if std::fs::remove_file(&path).is_ok() {
                served.remove(&path);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "purged stale temp audio files");
        }
        Ok(removed)
    }

    /// `stats() → {temp_count, cache_count}` (§4.1).
    pub fn stats(&self) -> AudioStoreStats {
        let temp_count = std::fs::read_dir(self.temp_dir())
            .map(|d| d.flatten().filter(|e| !is_tmp(&e.path())).count())
            .unwrap_or(0);
        let cache_count = std::fs::read_dir(self.cache_dir())
            .map(|d| d.flatten().filter(|e| !is_tmp(&e.path())).count())
            .unwrap_or(0);
        AudioStoreStats { temp_count, cache_count }
    }
}

fn is_tmp(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("tmp")
}

fn kind_label(kind: AudioKind) -> &'static str {
    match kind {
        AudioKind::Greeting => "greeting",
        AudioKind::Response => "response",
        AudioKind::SilenceResponse => "silence",
        AudioKind::Farewell => "farewell",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, AudioStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = AudioStore::new(dir.path(), "http://localhost:3000").unwrap();
        (dir, store)
    }

    #[test]
    fn put_then_read_round_trips() {
        let (_dir, store) = store();
        let call_id = Uuid::new_v4();
        let (url, _id) = store.put(call_id, b"riff-wav-bytes", AudioKind::Greeting).unwrap();
        assert!(url.starts_with("http://localhost:3000/audio/temp/"));
        let rel = url.trim_start_matches("http://localhost:3000/audio/");
        assert_eq!(store.read(rel).unwrap(), b"riff-wav-bytes");
    }

    #[test]
    fn cache_lookup_misses_then_hits() {
        let (_dir, store) = store();
        assert!(store.get_cached_url("abc123").is_none());
        store.put_cached("abc123", b"cached-audio").unwrap();
        assert!(store.get_cached_url("abc123").is_some());
    }

    #[test]
    fn purge_respects_recently_served_grace_period() {
        let (_dir, store) = store();
        let call_id = Uuid::new_v4();
        store.put(call_id, b"bytes", AudioKind::Response).unwrap();
        // Recently served (within the last minute): zero-age purge must not remove it.
        let removed = store.purge_older_than(Duration::from_secs(0)).unwrap();
        assert_eq!(removed, 0);
    }

    #[test]
    fn stats_reflects_writes() {
        let (_dir, store) = store();
        store.put(Uuid::new_v4(), b"a", AudioKind::Greeting).unwrap();
        store.put_cached("key1", b"b").unwrap();
        let stats = store.stats();
        assert_eq!(stats.temp_count, 1);
        assert_eq!(stats.cache_count, 1);
    }

    #[test]
    fn read_rejects_path_traversal() {
        let (_dir, store) = store();
        assert!(store.read("../../etc/passwd").is_err());
    }
}
