//! Durable, process-wide scan counters.
//!
//! Persistence boundary: `record_search`, `record` and `reset` write the full
//! counter set to disk (temp file + rename) before returning. Cache hit/miss
//! increments are lock-free and mark the store dirty; a dirty store is
//! written by the task from [`StatsStore::spawn_flusher`] at most
//! `flush_interval` later, by the next persisted mutation, by
//! [`StatsStore::flush`] or when the store is dropped. A crash loses at most
//! one flush interval of hit/miss traffic. A failed write is logged and the
//! next write carries the full state again.
use crate::error::Result;
use crate::model::UserId;
use chrono::{DateTime, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Snapshot of the cumulative counters. Also the on-disk record, keyed by
/// counter name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanStats {
    pub total_searches: u64,
    pub total_messages_scanned: u64,
    pub total_matches: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub deep_searches: u64,
    pub cancelled_searches: u64,
    pub total_search_time_ms: u64,
    /// Most messages scanned by a single run.
    pub largest_search: u64,
    /// Searches per requesting user. Unattributed searches are not counted.
    pub searches_by_user: BTreeMap<UserId, u64>,
    pub last_search: Option<LastSearch>,
}

impl ScanStats {
    pub fn average_messages_per_search(&self) -> f64 {
        if self.total_searches == 0 {
            0.0
        } else {
            self.total_messages_scanned as f64 / self.total_searches as f64
        }
    }
}

/// The most recent search, kept for the stats display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSearch {
    pub query: String,
    pub requester: Option<UserId>,
    pub at: DateTime<Utc>,
    pub messages_scanned: u64,
    pub matches_found: u64,
}

/// One finished scan, as reported by the engine.
#[derive(Debug, Clone, Default)]
pub struct SearchRecord {
    pub query: String,
    pub requester: Option<UserId>,
    pub messages_scanned: u64,
    pub matches_found: u64,
    pub deep: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

pub struct StatsStore {
    path: Option<PathBuf>,
    counters: Mutex<ScanStats>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// Cache counters changed since the last write.
    dirty: AtomicBool,
}

impl StatsStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self::with_state(None, ScanStats::default())
    }

    /// Load counters from `path`, creating the file with a zero record if it
    /// does not exist yet. An unreadable record is logged and replaced.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            let state = match serde_json::from_str::<ScanStats>(&content) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Discarding unreadable stats at {}: {e}", path.display());
                    ScanStats::default()
                }
            };
            debug!("Loaded scan stats from {}", path.display());
            Ok(Self::with_state(Some(path), state))
        } else {
            let store = Self::with_state(Some(path.clone()), ScanStats::default());
            write_atomic(&path, &ScanStats::default())?;
            debug!("Created scan stats at {}", path.display());
            Ok(store)
        }
    }

    fn with_state(path: Option<PathBuf>, state: ScanStats) -> Self {
        Self {
            path,
            cache_hits: AtomicU64::new(state.cache_hits),
            cache_misses: AtomicU64::new(state.cache_misses),
            counters: Mutex::new(state),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn record_search(&self, messages_scanned: u64, matches_found: u64) {
        self.record(SearchRecord {
            messages_scanned,
            matches_found,
            ..SearchRecord::default()
        });
    }

    pub fn record(&self, record: SearchRecord) {
        let mut counters = self.counters.lock();
        counters.total_searches += 1;
        counters.total_messages_scanned += record.messages_scanned;
        counters.total_matches += record.matches_found;
        counters.total_search_time_ms += record.elapsed.as_millis() as u64;
        counters.largest_search = counters.largest_search.max(record.messages_scanned);
        if record.deep {
            counters.deep_searches += 1;
        }
        if record.cancelled {
            counters.cancelled_searches += 1;
        }
        if let Some(user) = record.requester {
            *counters.searches_by_user.entry(user).or_insert(0) += 1;
        }
        counters.last_search = Some(LastSearch {
            query: record.query,
            requester: record.requester,
            at: Utc::now(),
            messages_scanned: record.messages_scanned,
            matches_found: record.matches_found,
        });
        self.persist_locked(&counters);
    }

    pub fn record_cache_hits(&self, n: u64) {
        self.cache_hits.fetch_add(n, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn record_cache_misses(&self, n: u64) {
        self.cache_misses.fetch_add(n, Ordering::Relaxed);
        self.dirty.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> ScanStats {
        let counters = self.counters.lock();
        self.merged(&counters)
    }

    /// Zero every counter and persist the zero state.
    pub fn reset(&self) {
        let mut counters = self.counters.lock();
        *counters = ScanStats::default();
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.persist_locked(&counters);
    }

    /// Write the current state, including unflushed cache counters.
    pub fn flush(&self) {
        let counters = self.counters.lock();
        self.persist_locked(&counters);
    }

    /// Write only if cache counters changed since the last write.
    pub fn flush_if_dirty(&self) -> bool {
        if !self.dirty.load(Ordering::Acquire) {
            return false;
        }
        self.flush();
        true
    }

    /// Flush dirty cache counters every `every` until the store is dropped.
    /// Must be called inside a tokio runtime.
    pub fn spawn_flusher(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                if store.flush_if_dirty() {
                    debug!("Flushed cache counters");
                }
            }
        })
    }

    fn merged(&self, counters: &ScanStats) -> ScanStats {
        ScanStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            ..counters.clone()
        }
    }

    fn persist_locked(&self, counters: &ScanStats) {
        self.dirty.store(false, Ordering::Release);
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_atomic(path, &self.merged(counters)) {
            warn!("Failed to persist scan stats to {}: {e}", path.display());
            self.dirty.store(true, Ordering::Release);
        }
    }
}

impl Drop for StatsStore {
    fn drop(&mut self) {
        self.flush_if_dirty();
    }
}

fn write_atomic(path: &Path, stats: &ScanStats) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(serde_json::to_string_pretty(stats)?.as_bytes())?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}
