//! Last-known-good result cache used when the primary path is unavailable.
//!
//! Attempts are recorded per logical key into a bounded ring. Successful
//! attempts also replace the key's [`CacheEntry`] when strictly newer. The
//! entry itself lives in a [`CacheTier`], either in memory or mirrored to
//! disk so that it survives a restart.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

use crate::clock::SharedClock;

/// Key for the most recent accepted ingest.
pub const LAST_INGEST_KEY: &str = "ingest:last";

/// Default number of attempts retained per key.
pub const DEFAULT_CAPACITY: usize = 50;

/// Cache key for a workflow's latest result.
#[must_use]
pub fn workflow_key(workflow_id: &str) -> String {
    format!("workflow:{workflow_id}")
}

/// Cache key for a workflow's latest upstream trigger.
#[must_use]
pub fn trigger_key(workflow_id: &str) -> String {
    format!("trigger:{workflow_id}")
}

/// One attempt at producing the result for a key.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AttemptRecord {
    pub success: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AttemptRecord {
    #[must_use]
    pub fn success(
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        result: serde_json::Value,
    ) -> Self {
        Self {
            success: true,
            started_at,
            ended_at,
            duration_ms: elapsed_ms(started_at, ended_at),
            result: Some(result),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            started_at,
            ended_at,
            duration_ms: elapsed_ms(started_at, ended_at),
            result: None,
            error: Some(error.into()),
        }
    }
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    u64::try_from((end - start).num_milliseconds()).unwrap_or(0)
}

/// Last successful result for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CacheEntry {
    pub key: String,
    #[schema(value_type = Object)]
    pub result: serde_json::Value,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Errors raised by a cache tier.
#[derive(Debug, thiserror::Error)]
pub enum CacheTierError {
    #[error("Cache file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache writer has stopped")]
    WriterStopped,
}

/// Storage for cache entries.
///
/// `put_if_newer` stores the entry only when it is strictly newer than the
/// current one and reports whether it did.
pub trait CacheTier: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether entries survive a process restart.
    fn is_persistent(&self) -> bool;

    fn get(&self, key: &str) -> Option<CacheEntry>;

    fn put_if_newer(&self, entry: &CacheEntry) -> Result<bool, CacheTierError>;

    fn keys(&self) -> Vec<String>;
}

fn insert_if_newer(map: &mut HashMap<String, CacheEntry>, entry: &CacheEntry) -> bool {
    match map.get(&entry.key) {
        Some(current) if current.recorded_at >= entry.recorded_at => false,
        _ => {
            map.insert(entry.key.clone(), entry.clone());
            true
        }
    }
}

/// Process-local tier.
#[derive(Debug, Default)]
pub struct MemoryTier {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryTier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheTier for MemoryTier {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn is_persistent(&self) -> bool {
        false
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    fn put_if_newer(&self, entry: &CacheEntry) -> Result<bool, CacheTierError> {
        Ok(insert_if_newer(&mut self.entries.write(), entry))
    }

    fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

/// Tier mirrored to one JSON file per key in a directory.
///
/// Reads are served from the in-memory mirror. File names are the hex
/// SHA-256 of the key, so any key maps to a short, safe path. Files are
/// written by a dedicated writer thread; dropping the tier drains it.
#[derive(Debug)]
pub struct FileTier {
    shared: Arc<FileShared>,
    writer: Option<mpsc::Sender<WriteCommand>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct FileShared {
    dir: PathBuf,
    mirror: RwLock<HashMap<String, CacheEntry>>,
}

#[derive(Debug)]
enum WriteCommand {
    Persist(String),
    Flush(mpsc::Sender<()>),
}

impl FileTier {
    /// Open (creating if needed) a cache directory and load existing entries.
    ///
    /// Unreadable files are skipped with a warning.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheTierError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut mirror = HashMap::new();
        for item in std::fs::read_dir(&dir)? {
            let path = item?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read(&path)
                .map_err(CacheTierError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<CacheEntry>(&bytes)?))
            {
                Ok(entry) => {
                    insert_if_newer(&mut mirror, &entry);
                }
                Err(e) => {
                    tracing::warn!(
                        target: "fallback_cache",
                        path = %path.display(),
                        error = %e,
                        "Skipping unreadable cache file"
                    );
                }
            }
        }

        tracing::info!(
            target: "fallback_cache",
            dir = %dir.display(),
            entries = mirror.len(),
            "File cache tier opened"
        );

        let shared = Arc::new(FileShared {
            dir,
            mirror: RwLock::new(mirror),
        });
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("fallback-cache-writer".to_string())
            .spawn({
                let shared = shared.clone();
                move || run_writer(&shared, &rx)
            })?;

        Ok(Self {
            shared,
            writer: Some(tx),
            handle: Some(handle),
        })
    }

    /// Block until every write queued so far is on disk.
    pub fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (done_tx, done_rx) = mpsc::channel();
        if writer.send(WriteCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.recv();
        }
    }
}

fn file_name_for(key: &str) -> String {
    format!("{}.json", hex::encode(Sha256::digest(key.as_bytes())))
}

fn run_writer(shared: &FileShared, rx: &mpsc::Receiver<WriteCommand>) {
    while let Ok(command) = rx.recv() {
        match command {
            WriteCommand::Persist(key) => {
                if let Err(e) = shared.persist(&key) {
                    tracing::warn!(
                        target: "fallback_cache",
                        key,
                        error = %e,
                        "Failed to write cache file"
                    );
                }
            }
            WriteCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

impl FileShared {
    // The writer always flushes the mirror's latest entry, so a burst of
    // updates for one key never regresses the file.
    fn persist(&self, key: &str) -> Result<(), CacheTierError> {
        let Some(latest) = self.mirror.read().get(key).cloned() else {
            return Ok(());
        };
        let path = self.dir.join(file_name_for(key));
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(&latest)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl CacheTier for FileTier {
    fn name(&self) -> &'static str {
        "file"
    }

    fn is_persistent(&self) -> bool {
        true
    }

    fn get(&self, key: &str) -> Option<CacheEntry> {
        self.shared.mirror.read().get(key).cloned()
    }

    fn put_if_newer(&self, entry: &CacheEntry) -> Result<bool, CacheTierError> {
        if !insert_if_newer(&mut self.shared.mirror.write(), entry) {
            return Ok(false);
        }
        self.writer
            .as_ref()
            .and_then(|writer| writer.send(WriteCommand::Persist(entry.key.clone())).ok())
            .ok_or(CacheTierError::WriterStopped)?;
        Ok(true)
    }

    fn keys(&self) -> Vec<String> {
        self.shared.mirror.read().keys().cloned().collect()
    }
}

impl Drop for FileTier {
    fn drop(&mut self) {
        // Closing the channel lets the writer drain and exit.
        self.writer.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Per-key statistics.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CacheStats {
    pub has_last_successful: bool,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    /// Mean over the attempts still in the ring.
    pub average_duration_ms: f64,
    pub recent_attempt_count: usize,
    pub last_update_time: Option<DateTime<Utc>>,
}

/// A cached result served in place of the primary path.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FallbackRead {
    pub entry: CacheEntry,
    /// Always true: the caller is not seeing live data.
    pub degraded: bool,
    /// Whether the entry came from a tier that survives restarts.
    pub persistent: bool,
    pub age_secs: i64,
}

#[derive(Debug, Default)]
struct KeyHistory {
    recent: VecDeque<AttemptRecord>,
    total: u64,
    successful: u64,
    failed: u64,
    last_update_time: Option<DateTime<Utc>>,
}

/// Fallback cache over a single tier.
pub struct FallbackCache {
    tier: Arc<dyn CacheTier>,
    capacity: usize,
    clock: SharedClock,
    history: RwLock<HashMap<String, KeyHistory>>,
}

impl FallbackCache {
    #[must_use]
    pub fn new(tier: Arc<dyn CacheTier>, capacity: usize, clock: SharedClock) -> Self {
        Self {
            tier,
            capacity: capacity.max(1),
            clock,
            history: RwLock::new(HashMap::new()),
        }
    }

    /// In-memory cache with the default capacity.
    #[must_use]
    pub fn in_memory(clock: SharedClock) -> Self {
        Self::new(Arc::new(MemoryTier::new()), DEFAULT_CAPACITY, clock)
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.tier.is_persistent()
    }

    #[must_use]
    pub fn tier_name(&self) -> &'static str {
        self.tier.name()
    }

    /// Record an attempt. Returns whether the cached entry was replaced.
    pub fn record(&self, key: &str, attempt: AttemptRecord) -> bool {
        let candidate = match (&attempt.success, &attempt.result) {
            (true, Some(result)) => Some(CacheEntry {
                key: key.to_string(),
                result: result.clone(),
                success: true,
                recorded_at: attempt.ended_at,
                duration_ms: attempt.duration_ms,
            }),
            _ => None,
        };

        {
            let mut history = self.history.write();
            let entry = history.entry(key.to_string()).or_default();
            entry.total += 1;
            if attempt.success {
                entry.successful += 1;
            } else {
                entry.failed += 1;
            }
            entry.last_update_time = Some(
                entry
                    .last_update_time
                    .map_or(attempt.ended_at, |t| t.max(attempt.ended_at)),
            );
            entry.recent.push_back(attempt);
            while entry.recent.len() > self.capacity {
                entry.recent.pop_front();
            }
        }

        let Some(candidate) = candidate else {
            return false;
        };

        match self.tier.put_if_newer(&candidate) {
            Ok(replaced) => {
                if !replaced {
                    tracing::debug!(
                        target: "fallback_cache",
                        key,
                        "Ignoring attempt older than cached entry"
                    );
                }
                replaced
            }
            Err(e) => {
                tracing::warn!(
                    target: "fallback_cache",
                    key,
                    tier = self.tier.name(),
                    error = %e,
                    "Failed to persist cache entry"
                );
                false
            }
        }
    }

    #[must_use]
    pub fn get_last_successful(&self, key: &str) -> Option<CacheEntry> {
        self.tier.get(key)
    }

    /// Serve the cached entry for `key`, labelled degraded.
    #[must_use]
    pub fn serve_fallback(&self, key: &str) -> Option<FallbackRead> {
        let entry = self.tier.get(key)?;
        let age_secs = (self.clock.now() - entry.recorded_at).num_seconds().max(0);
        tracing::warn!(
            target: "fallback_cache",
            key,
            age_secs,
            persistent = self.tier.is_persistent(),
            "Serving cached result in degraded mode"
        );
        Some(FallbackRead {
            entry,
            degraded: true,
            persistent: self.tier.is_persistent(),
            age_secs,
        })
    }

    #[must_use]
    pub fn get_stats(&self, key: &str) -> CacheStats {
        let has_last_successful = self.tier.get(key).is_some();
        let history = self.history.read();
        match history.get(key) {
            Some(h) => {
                let recent_attempt_count = h.recent.len();
                let average_duration_ms = if recent_attempt_count == 0 {
                    0.0
                } else {
                    h.recent.iter().map(|a| a.duration_ms as f64).sum::<f64>()
                        / recent_attempt_count as f64
                };
                CacheStats {
                    has_last_successful,
                    total_attempts: h.total,
                    successful_attempts: h.successful,
                    failed_attempts: h.failed,
                    average_duration_ms,
                    recent_attempt_count,
                    last_update_time: h.last_update_time,
                }
            }
            None => CacheStats {
                has_last_successful,
                total_attempts: 0,
                successful_attempts: 0,
                failed_attempts: 0,
                average_duration_ms: 0.0,
                recent_attempt_count: 0,
                last_update_time: None,
            },
        }
    }

    /// Stats for every known key, including entries loaded from disk.
    #[must_use]
    pub fn all_stats(&self) -> BTreeMap<String, CacheStats> {
        let mut keys: Vec<String> = self.history.read().keys().cloned().collect();
        keys.extend(self.tier.keys());
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .map(|key| {
                let stats = self.get_stats(&key);
                (key, stats)
            })
            .collect()
    }
}

impl std::fmt::Debug for FallbackCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackCache")
            .field("tier", &self.tier.name())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
