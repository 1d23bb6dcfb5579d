//! Content-addressable dedup store (§4.1): three-tier fingerprint lookup
//! with TTL retention, backed by a periodic atomic-rename flush to disk.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use jobcrawler_core::FingerprintBundle;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{error, info, warn};

/// Which tier matched, if any — `check` returns this to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupKind {
    Url,
    Content,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupEntry {
    pub stored_at: DateTime<Utc>,
    pub content_hash: String,
    pub desc_hash: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OnDiskStore {
    version: u32,
    entries: std::collections::HashMap<String, DedupEntry>,
}

pub struct DedupStore {
    entries: DashMap<String, DedupEntry>,
    /// Secondary index so tier-2 lookups don't scan the whole map (§4.1
    /// "implementers SHOULD add a secondary index if scale exceeds ~1e5").
    by_content_hash: DashMap<String, Vec<String>>,
    retention: ChronoDuration,
    path: PathBuf,
    last_flush_unix_ms: AtomicI64,
}

impl DedupStore {
    /// Load `path` if present (a corrupt file is logged and replaced with
    /// an empty set, never aborts — §4.1 failure model), prune entries
    /// older than `retention_days`, and return the store.
    pub fn load(path: impl Into<PathBuf>, retention_days: i64) -> Self {
        let path = path.into();
        let on_disk = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| match serde_json::from_str::<OnDiskStore>(&raw) {
                Ok(store) => Some(store),
                Err(e) => {
                    error!(error = %e, path = %path.display(), "corrupt dedup store, starting empty");
                    None
                }
            })
            .unwrap_or(OnDiskStore {
                version: 1,
                entries: Default::default(),
            });

        let entries = DashMap::new();
        let by_content_hash: DashMap<String, Vec<String>> = DashMap::new();
        let cutoff = Utc::now() - ChronoDuration::days(retention_days);
        let mut pruned = 0usize;
        for (url_hash, entry) in on_disk.entries {
            if entry.stored_at < cutoff {
                pruned += 1;
                continue;
            }
            by_content_hash
                .entry(entry.content_hash.clone())
                .or_default()
                .push(url_hash.clone());
            entries.insert(url_hash, entry);
        }
        if pruned > 0 {
            info!(pruned, "pruned expired dedup entries on load");
        }

        Self {
            entries,
            by_content_hash,
            retention: ChronoDuration::days(retention_days),
            path,
            last_flush_unix_ms: AtomicI64::new(0),
        }
    }

    /// Three-tier lookup, short-circuiting on the first match (§4.1).
    pub fn check(&self, fp: &FingerprintBundle) -> DupKind {
        if self.entries.contains_key(&fp.url_hash) {
            return DupKind::Url;
        }

        if let Some(candidates) = self.by_content_hash.get(&fp.content_hash) {
            let recent_cutoff = Utc::now() - ChronoDuration::days(7);
            for url_hash in candidates.iter() {
                if let Some(entry) = self.entries.get(url_hash) {
                    if entry.desc_hash == fp.desc_hash {
                        return DupKind::Content;
                    }
                    if entry.stored_at > recent_cutoff {
                        return DupKind::Content;
                    }
                    // older entry, differing desc: treated as a genuine re-post
                }
            }
        }

        DupKind::None
    }

    /// Record a job as seen. MUST be called only after the caller has
    /// accepted the record downstream (persistence has been enqueued).
    pub fn mark(&self, fp: &FingerprintBundle) {
        let entry = DedupEntry {
            stored_at: Utc::now(),
            content_hash: fp.content_hash.clone(),
            desc_hash: fp.desc_hash.clone(),
        };
        if self.entries.insert(fp.url_hash.clone(), entry).is_none() {
            self.by_content_hash
                .entry(fp.content_hash.clone())
                .or_default()
                .push(fp.url_hash.clone());
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.by_content_hash.clear();
        self.flush();
    }

    /// Drop entries older than `retention_days`, opportunistically called
    /// from write batches and the periodic flush task.
    pub fn prune_expired(&self) {
        let cutoff = Utc::now() - self.retention;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().stored_at < cutoff)
            .map(|e| e.key().clone())
            .collect();
        for url_hash in expired {
            if let Some((_, entry)) = self.entries.remove(&url_hash) {
                if let Some(mut bucket) = self.by_content_hash.get_mut(&entry.content_hash) {
                    bucket.retain(|h| h != &url_hash);
                }
            }
        }
    }

    /// Atomic tmp-file-then-rename flush. Never called more than once per
    /// caller-chosen interval by the background task; safe to call eagerly
    /// too (e.g. from `clear`/`close`).
    pub fn flush(&self) {
        let snapshot = OnDiskStore {
            version: 1,
            entries: self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        };
        let Some(parent) = self.path.parent() else {
            return;
        };
        if std::fs::create_dir_all(parent).is_err() {
            warn!(path = %self.path.display(), "could not create dedup store directory");
            return;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&tmp_path, bytes) {
                    warn!(error = %e, "dedup store flush write failed");
                    return;
                }
                if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
                    warn!(error = %e, "dedup store flush rename failed");
                }
            }
            Err(e) => warn!(error = %e, "dedup store serialize failed"),
        }
        self.last_flush_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn close(&self) {
        self.flush();
    }
}

/// Long-lived cooperative task: flush + prune every `interval`. Holds a
/// cancellation handle via `tokio_util::sync::CancellationToken` rather
/// than running as a detached background singleton (§9 re-architecture
/// note on timer-driven side effects).
pub async fn run_flush_task(
    store: std::sync::Arc<DedupStore>,
    interval: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                store.prune_expired();
                store.flush();
            }
            _ = cancel.cancelled() => {
                store.flush();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(url_hash: &str, content_hash: &str, desc_hash: &str) -> FingerprintBundle {
        FingerprintBundle {
            url_hash: url_hash.into(),
            content_hash: content_hash.into(),
            desc_hash: desc_hash.into(),
        }
    }

    #[test]
    fn mark_then_check_is_url_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = DedupStore::load(dir.path().join("dedup.json"), 30);
        let f = fp("u1", "c1", "d1");
        assert_eq!(store.check(&f), DupKind::None);
        store.mark(&f);
        assert_eq!(store.check(&f), DupKind::Url);
    }

    #[test]
    fn marking_twice_increases_size_by_at_most_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = DedupStore::load(dir.path().join("dedup.json"), 30);
        let f = fp("u1", "c1", "d1");
        store.mark(&f);
        let after_first = store.size();
        store.mark(&f);
        assert!(store.size() - after_first <= 1);
    }

    #[test]
    fn differing_url_same_content_and_desc_is_content_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = DedupStore::load(dir.path().join("dedup.json"), 30);
        store.mark(&fp("u1", "c1", "d1"));
        assert_eq!(store.check(&fp("u2", "c1", "d1")), DupKind::Content);
    }

    #[test]
    fn differing_desc_on_old_entry_is_not_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let store = DedupStore::load(dir.path().join("dedup.json"), 30);
        let entry = DedupEntry {
            stored_at: Utc::now() - ChronoDuration::days(8),
            content_hash: "c1".into(),
            desc_hash: "d1".into(),
        };
        store.entries.insert("u1".into(), entry);
        store
            .by_content_hash
            .entry("c1".into())
            .or_default()
            .push("u1".into());
        assert_eq!(store.check(&fp("u2", "c1", "d2")), DupKind::None);
    }

    #[test]
    fn flush_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.json");
        let store = DedupStore::load(&path, 30);
        store.mark(&fp("u1", "c1", "d1"));
        store.flush();

        let reloaded = DedupStore::load(&path, 30);
        assert_eq!(reloaded.size(), 1);
        assert_eq!(reloaded.check(&fp("u1", "c1", "d1")), DupKind::Url);
    }

    #[test]
    fn corrupt_file_loads_as_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dedup.json");
        std::fs::write(&path, b"not json").unwrap();
        let store = DedupStore::load(&path, 30);
        assert_eq!(store.size(), 0);
    }
}
