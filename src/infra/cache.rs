use crate::domain::SessionSummary;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Identity stamp of a log file at observation time. Both cache tiers share
/// the same validity rule: an entry is valid iff its stored stamp equals the
/// file's current stamp.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FileStamp {
    pub modified_unix_ms: Option<i64>,
    pub size_bytes: u64,
}

impl FileStamp {
    pub fn of(metadata: &fs::Metadata) -> Self {
        Self {
            modified_unix_ms: metadata.modified().ok().and_then(system_time_to_unix_ms),
            size_bytes: metadata.len(),
        }
    }
}

pub fn system_time_to_unix_ms(value: SystemTime) -> Option<i64> {
    let delta = value.duration_since(UNIX_EPOCH).ok()?;
    i64::try_from(delta.as_millis()).ok()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub stamp: FileStamp,
    pub summary: SessionSummary,
}

#[derive(Debug, Error)]
pub enum SaveCacheError {
    #[error("failed to encode summary cache: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to write summary cache: {0}")]
    Write(#[from] io::Error),
}

/// Persistence seam for the persistent tier. Load failures of any kind
/// degrade to an empty map; they are never fatal.
pub trait CacheStore: Send + Sync {
    fn load(&self) -> BTreeMap<PathBuf, CacheEntry>;
    fn save(&self, entries: &BTreeMap<PathBuf, CacheEntry>) -> Result<(), SaveCacheError>;
}

pub struct JsonCacheStore {
    path: PathBuf,
}

impl JsonCacheStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("summary_cache.json"),
        }
    }
}

impl CacheStore for JsonCacheStore {
    fn load(&self) -> BTreeMap<PathBuf, CacheEntry> {
        let Ok(raw) = fs::read_to_string(&self.path) else {
            return BTreeMap::new();
        };
        let Ok(file) = serde_json::from_str::<CacheFile>(&raw) else {
            return BTreeMap::new();
        };
        file.into_entries()
    }

    fn save(&self, entries: &BTreeMap<PathBuf, CacheEntry>) -> Result<(), SaveCacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(&CacheFile::from_entries(entries))?;
        fs::write(&tmp, text)?;
        fs::rename(tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory store used when no state directory is available and in tests.
pub struct MemoryCacheStore;

impl CacheStore for MemoryCacheStore {
    fn load(&self) -> BTreeMap<PathBuf, CacheEntry> {
        BTreeMap::new()
    }

    fn save(&self, _entries: &BTreeMap<PathBuf, CacheEntry>) -> Result<(), SaveCacheError> {
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: Vec<CacheFileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFileEntry {
    log_path: PathBuf,
    stamp: FileStamp,
    summary: SessionSummary,
}

impl CacheFile {
    fn from_entries(entries: &BTreeMap<PathBuf, CacheEntry>) -> Self {
        Self {
            version: 1,
            entries: entries
                .iter()
                .map(|(log_path, entry)| CacheFileEntry {
                    log_path: log_path.clone(),
                    stamp: entry.stamp,
                    summary: entry.summary.clone(),
                })
                .collect(),
        }
    }

    fn into_entries(self) -> BTreeMap<PathBuf, CacheEntry> {
        self.entries
            .into_iter()
            .map(|entry| {
                (
                    entry.log_path,
                    CacheEntry {
                        stamp: entry.stamp,
                        summary: entry.summary,
                    },
                )
            })
            .collect()
    }
}

pub const DEFAULT_TRANSIENT_CAPACITY: usize = 4096;

/// Explicitly constructed, explicitly owned two-tier summary cache: a bounded
/// LRU in front of an unbounded persistent map. Each tier is serialized
/// behind its own lock; no operation holds both locks at once.
pub struct SessionCache {
    transient: Mutex<LruCache<PathBuf, CacheEntry>>,
    persistent: Mutex<BTreeMap<PathBuf, CacheEntry>>,
    store: Box<dyn CacheStore>,
}

impl SessionCache {
    pub fn new(capacity: usize, store: Box<dyn CacheStore>) -> Self {
        let persistent = store.load();
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            transient: Mutex::new(LruCache::new(capacity)),
            persistent: Mutex::new(persistent),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(DEFAULT_TRANSIENT_CAPACITY, Box::new(MemoryCacheStore))
    }

    /// Returns the cached summary when the stored stamp matches. A persistent
    /// hit backfills the transient tier.
    pub fn lookup(&self, log_path: &Path, stamp: FileStamp) -> Option<SessionSummary> {
        if let Some(entry) = lock(&self.transient).get(log_path) {
            if entry.stamp == stamp {
                return Some(entry.summary.clone());
            }
        }

        let persistent_hit = lock(&self.persistent)
            .get(log_path)
            .filter(|entry| entry.stamp == stamp)
            .cloned();
        let entry = persistent_hit?;
        lock(&self.transient).put(log_path.to_path_buf(), entry.clone());
        Some(entry.summary)
    }

    /// Writes through to both tiers.
    pub fn insert(&self, log_path: &Path, stamp: FileStamp, summary: SessionSummary) {
        let entry = CacheEntry { stamp, summary };
        lock(&self.transient).put(log_path.to_path_buf(), entry.clone());
        lock(&self.persistent).insert(log_path.to_path_buf(), entry);
    }

    /// Saves the persistent tier as one flat snapshot.
    pub fn persist(&self) -> Result<(), SaveCacheError> {
        let snapshot = lock(&self.persistent).clone();
        self.store.save(&snapshot)
    }

    pub fn persistent_len(&self) -> usize {
        lock(&self.persistent).len()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
