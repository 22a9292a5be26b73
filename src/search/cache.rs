//! Bounded, TTL-limited message cache keyed by `(channel_id, message_id)`.
//!
//! Storage is split into one bucket per channel, each behind its own mutex,
//! so workers scanning different channels never contend. Recency is tracked
//! with a global access clock: every insert or hit stamps the entry with the
//! next tick, which lets capacity eviction pick the globally least recently
//! used entry by comparing bucket heads. A global entry count keeps the
//! common insert path free of that comparison: buckets are only scanned
//! when the count goes over capacity.
//!
//! Besides individual messages, each bucket remembers the contiguous run of
//! history it has seen from the newest message backwards (its "window"), so
//! a repeated page request can be answered without touching the platform.
use crate::model::{ChannelId, Message, MessageId};
use crate::stats::StatsStore;
use log::debug;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    message: Message,
    fetched_at: Instant,
    tick: u64,
}

#[derive(Debug)]
struct HistoryWindow {
    /// Newest first, contiguous in channel order.
    ids: Vec<MessageId>,
    /// The oldest id in `ids` is the start of the channel.
    exhausted: bool,
    fetched_at: Instant,
}

struct ChannelBucket {
    entries: LruCache<MessageId, CacheEntry>,
    window: Option<HistoryWindow>,
    /// Set by `clear`. A retired bucket stays empty; writers holding a
    /// stale handle to it drop their messages.
    retired: bool,
}

impl ChannelBucket {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            window: None,
            retired: false,
        }
    }
}

/// A page served from the cache.
#[derive(Debug, Clone)]
pub struct CachedPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub channels: usize,
    pub capacity: usize,
}

pub struct MessageCache {
    buckets: RwLock<HashMap<ChannelId, Arc<Mutex<ChannelBucket>>>>,
    max_entries: usize,
    ttl: Duration,
    /// Entries across all live buckets. Only changed under a bucket lock.
    len: AtomicUsize,
    clock: AtomicU64,
    evict_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    stats: Option<Arc<StatsStore>>,
}

impl MessageCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            evict_lock: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stats: None,
        }
    }

    /// Forward hit/miss counts to the statistics store.
    pub fn with_stats(mut self, stats: Arc<StatsStore>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Look up a message, falling back to `fetch` on a miss or a stale entry.
    /// A successful fetch is cached.
    pub async fn get_or_fetch<F, Fut, E>(
        &self,
        channel: ChannelId,
        id: MessageId,
        fetch: F,
    ) -> Result<Message, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Message, E>>,
    {
        if let Some(message) = self.lookup(channel, id) {
            self.note_hits(1);
            return Ok(message);
        }
        self.note_misses(1);
        let message = fetch().await?;
        self.put(channel, std::iter::once(message.clone()));
        Ok(message)
    }

    /// Up to `count` cached, unexpired messages of a channel, newest first.
    /// Does not touch recency.
    pub fn get_recent(&self, channel: ChannelId, count: usize) -> Vec<Message> {
        let Some(bucket) = self.bucket(channel) else {
            return Vec::new();
        };
        let bucket = bucket.lock();
        let mut messages: Vec<Message> = bucket
            .entries
            .iter()
            .filter(|(_, entry)| !self.expired(entry.fetched_at))
            .map(|(_, entry)| entry.message.clone())
            .collect();
        messages.sort_by(Message::newest_first);
        messages.truncate(count);
        messages
    }

    /// Replace (never patch) the cached copies of `messages`.
    pub fn put(&self, channel: ChannelId, messages: impl IntoIterator<Item = Message>) {
        {
            let bucket = self.bucket_or_insert(channel);
            let mut bucket = bucket.lock();
            self.insert_locked(&mut bucket, messages);
        }
        self.enforce_capacity();
    }

    /// Drop every entry. Lookups already holding a bucket lock finish against
    /// the pre-clear data; later lookups miss.
    pub fn clear(&self) {
        let mut buckets = self.buckets.write();
        let dropped = buckets.len();
        for bucket in buckets.values() {
            let mut bucket = bucket.lock();
            bucket.entries.clear();
            bucket.window = None;
            bucket.retired = true;
        }
        buckets.clear();
        self.len.store(0, Ordering::Relaxed);
        debug!("Cleared message cache ({dropped} channel buckets)");
    }

    pub fn stats(&self) -> CacheStats {
        let buckets: Vec<_> = self.buckets.read().values().cloned().collect();
        CacheStats {
            size: self.len.load(Ordering::Relaxed),
            hit_count: self.hits.load(Ordering::Relaxed),
            miss_count: self.misses.load(Ordering::Relaxed),
            channels: buckets.len(),
            capacity: self.max_entries,
        }
    }

    /// Serve a history page from the channel's cached window, if the window
    /// covers it completely and every message in it is still fresh.
    pub fn cached_page(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Option<CachedPage> {
        let bucket = self.bucket(channel)?;
        let mut guard = bucket.lock();
        let bucket = &mut *guard;

        let window = bucket.window.as_mut()?;
        if self.expired(window.fetched_at) {
            bucket.window = None;
            return None;
        }
        let start = match before {
            None => 0,
            Some(cursor) => window.ids.iter().position(|id| *id == cursor)? + 1,
        };
        let end = (start + limit).min(window.ids.len());
        if end - start < limit && !window.exhausted {
            return None;
        }

        let mut messages = Vec::with_capacity(end - start);
        for idx in start..end {
            let id = window.ids[idx];
            let fresh = match bucket.entries.get_mut(&id) {
                Some(entry) if !expired_at(entry.fetched_at, self.ttl) => {
                    entry.tick = self.clock.fetch_add(1, Ordering::Relaxed);
                    Some(entry.message.clone())
                }
                _ => None,
            };
            match fresh {
                Some(message) => messages.push(message),
                None => {
                    // Evicted or stale: the window is only trustworthy up to here.
                    window.ids.truncate(idx);
                    window.exhausted = false;
                    return None;
                }
            }
        }

        let has_more = end < window.ids.len() || !window.exhausted;
        drop(guard);
        self.note_hits(messages.len() as u64);
        Some(CachedPage { messages, has_more })
    }

    /// Store a page fetched from the platform and extend the channel window
    /// when the page continues it.
    pub fn record_page(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        messages: &[Message],
        has_more: bool,
    ) {
        self.note_misses(messages.len() as u64);
        {
            let bucket = self.bucket_or_insert(channel);
            let mut bucket = bucket.lock();
            self.insert_locked(&mut bucket, messages.iter().cloned());
            let ids = messages.iter().map(|m| m.id);
            match (before, bucket.window.as_mut()) {
                (None, _) => {
                    bucket.window = Some(HistoryWindow {
                        ids: ids.collect(),
                        exhausted: !has_more,
                        fetched_at: Instant::now(),
                    });
                }
                (Some(cursor), Some(window)) if window.ids.last() == Some(&cursor) => {
                    window.ids.extend(ids);
                    window.exhausted = !has_more;
                }
                _ => {}
            }
        }
        self.enforce_capacity();
    }

    fn lookup(&self, channel: ChannelId, id: MessageId) -> Option<Message> {
        let bucket = self.bucket(channel)?;
        let mut bucket = bucket.lock();
        if self.expired(bucket.entries.peek(&id)?.fetched_at) {
            bucket.entries.pop(&id);
            self.len.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        let entry = bucket.entries.get_mut(&id)?;
        entry.tick = self.clock.fetch_add(1, Ordering::Relaxed);
        Some(entry.message.clone())
    }

    fn insert_locked(
        &self,
        bucket: &mut ChannelBucket,
        messages: impl IntoIterator<Item = Message>,
    ) {
        if bucket.retired {
            return;
        }
        let now = Instant::now();
        for message in messages {
            let tick = self.clock.fetch_add(1, Ordering::Relaxed);
            let entry = CacheEntry {
                message,
                fetched_at: now,
                tick,
            };
            if bucket.entries.put(entry.message.id, entry).is_none() {
                self.len.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn over_capacity(&self) -> bool {
        self.len.load(Ordering::Relaxed) > self.max_entries
    }

    /// Evict globally least-recently-used entries until within capacity.
    fn enforce_capacity(&self) {
        if !self.over_capacity() {
            return;
        }
        let _evicting = self.evict_lock.lock();
        let buckets: Vec<_> = self.buckets.read().values().cloned().collect();
        while self.over_capacity() {
            let victim = buckets
                .iter()
                .filter_map(|b| {
                    let tick = b.lock().entries.peek_lru().map(|(_, e)| e.tick)?;
                    Some((tick, b))
                })
                .min_by_key(|(tick, _)| *tick)
                .map(|(_, b)| b);
            let Some(victim) = victim else {
                break;
            };
            let mut victim = victim.lock();
            if victim.entries.pop_lru().is_some() {
                self.len.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    fn bucket(&self, channel: ChannelId) -> Option<Arc<Mutex<ChannelBucket>>> {
        self.buckets.read().get(&channel).cloned()
    }

    fn bucket_or_insert(&self, channel: ChannelId) -> Arc<Mutex<ChannelBucket>> {
        if let Some(bucket) = self.bucket(channel) {
            return bucket;
        }
        self.buckets
            .write()
            .entry(channel)
            .or_insert_with(|| Arc::new(Mutex::new(ChannelBucket::new())))
            .clone()
    }

    fn expired(&self, fetched_at: Instant) -> bool {
        expired_at(fetched_at, self.ttl)
    }

    fn note_hits(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.hits.fetch_add(n, Ordering::Relaxed);
        if let Some(stats) = &self.stats {
            stats.record_cache_hits(n);
        }
    }

    fn note_misses(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.misses.fetch_add(n, Ordering::Relaxed);
        if let Some(stats) = &self.stats {
            stats.record_cache_misses(n);
        }
    }
}

fn expired_at(fetched_at: Instant, ttl: Duration) -> bool {
    fetched_at.elapsed() > ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserId;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn msg(channel: u64, id: u64) -> Message {
        Message {
            id: MessageId(id),
            channel_id: ChannelId(channel),
            author_id: UserId(1),
            author_name: "user".into(),
            content: format!("message {id}"),
            timestamp: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
            attachments: vec![],
        }
    }

    async fn must_not_fetch() -> Result<Message, ()> {
        panic!("fetch path must not run on a hit")
    }

    #[tokio::test]
    async fn hit_within_ttl_skips_fetch() {
        let stats = Arc::new(StatsStore::in_memory());
        let cache = MessageCache::new(10, Duration::from_secs(300)).with_stats(stats.clone());
        cache.put(ChannelId(1), vec![msg(1, 5)]);

        let got = cache
            .get_or_fetch(ChannelId(1), MessageId(5), must_not_fetch)
            .await
            .unwrap();
        assert_eq!(got.id, MessageId(5));
        assert_eq!(cache.stats().hit_count, 1);
        assert_eq!(stats.snapshot().cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entry_is_refetched() {
        let cache = MessageCache::new(10, Duration::from_secs(300));
        cache.put(ChannelId(1), vec![msg(1, 5)]);
        tokio::time::advance(Duration::from_secs(301)).await;

        let calls = AtomicUsize::new(0);
        let got: Result<Message, ()> = cache
            .get_or_fetch(ChannelId(1), MessageId(5), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(msg(1, 5))
            })
            .await;
        assert!(got.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().miss_count, 1);
    }

    #[tokio::test]
    async fn fetch_error_is_returned_and_not_cached() {
        let cache = MessageCache::new(10, Duration::from_secs(300));
        let got: Result<Message, &str> = cache
            .get_or_fetch(ChannelId(1), MessageId(5), || async { Err("gone") })
            .await;
        assert_eq!(got.unwrap_err(), "gone");
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn evicts_least_recently_used_across_channels() {
        let cache = MessageCache::new(3, Duration::from_secs(300));
        cache.put(ChannelId(1), vec![msg(1, 1)]);
        cache.put(ChannelId(2), vec![msg(2, 2)]);
        cache.put(ChannelId(1), vec![msg(1, 3)]);
        // Touch 1/1 so 2/2 becomes the oldest.
        assert!(cache.lookup(ChannelId(1), MessageId(1)).is_some());

        cache.put(ChannelId(3), vec![msg(3, 4)]);
        assert!(cache.lookup(ChannelId(2), MessageId(2)).is_none());
        assert!(cache.lookup(ChannelId(1), MessageId(1)).is_some());
        assert!(cache.lookup(ChannelId(1), MessageId(3)).is_some());
        assert!(cache.lookup(ChannelId(3), MessageId(4)).is_some());
        assert_eq!(cache.stats().size, 3);
    }

    #[test]
    fn get_recent_is_newest_first() {
        let cache = MessageCache::new(10, Duration::from_secs(300));
        cache.put(ChannelId(1), vec![msg(1, 2), msg(1, 9), msg(1, 4)]);
        let ids: Vec<u64> = cache
            .get_recent(ChannelId(1), 2)
            .iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec![9, 4]);
        assert!(cache.get_recent(ChannelId(2), 5).is_empty());
    }

    #[test]
    fn clear_empties_every_bucket() {
        let cache = MessageCache::new(10, Duration::from_secs(300));
        cache.put(ChannelId(1), vec![msg(1, 1)]);
        cache.put(ChannelId(2), vec![msg(2, 2)]);
        cache.clear();
        let stats = cache.stats();
        assert_eq!((stats.size, stats.channels), (0, 0));
        assert!(cache.cached_page(ChannelId(1), None, 1).is_none());
    }

    #[test]
    fn window_serves_contiguous_pages() {
        let cache = MessageCache::new(100, Duration::from_secs(300));
        let page1 = vec![msg(1, 10), msg(1, 9)];
        let page2 = vec![msg(1, 8)];
        cache.record_page(ChannelId(1), None, &page1, true);
        cache.record_page(ChannelId(1), Some(MessageId(9)), &page2, false);

        let first = cache.cached_page(ChannelId(1), None, 2).unwrap();
        assert_eq!(first.messages.len(), 2);
        assert!(first.has_more);
        let second = cache.cached_page(ChannelId(1), Some(MessageId(9)), 2).unwrap();
        assert_eq!(second.messages.len(), 1);
        assert!(!second.has_more);
        assert_eq!(cache.stats().hit_count, 3);
        assert_eq!(cache.stats().miss_count, 3);
    }

    #[test]
    fn window_with_evicted_message_is_not_trusted() {
        let cache = MessageCache::new(2, Duration::from_secs(300));
        cache.record_page(ChannelId(1), None, &[msg(1, 10), msg(1, 9)], true);
        cache.put(ChannelId(2), vec![msg(2, 1)]);
        // 1/10 was the oldest tick and got evicted.
        assert!(cache.cached_page(ChannelId(1), None, 2).is_none());
    }

    #[test]
    fn short_window_does_not_cover_longer_page() {
        let cache = MessageCache::new(100, Duration::from_secs(300));
        cache.record_page(ChannelId(1), None, &[msg(1, 10)], true);
        assert!(cache.cached_page(ChannelId(1), None, 5).is_none());
    }

    #[test]
    fn concurrent_puts_respect_capacity() {
        let cache = Arc::new(MessageCache::new(50, Duration::from_secs(300)));
        let handles: Vec<_> = (0..8u64)
            .map(|ch| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for id in 0..40 {
                        cache.put(ChannelId(ch), vec![msg(ch, id)]);
                        let _ = cache.get_recent(ChannelId(ch), 3);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.stats().size <= 50);
    }

    #[test]
    fn puts_under_capacity_skip_the_eviction_lock() {
        let cache = Arc::new(MessageCache::new(100, Duration::from_secs(300)));
        let _evicting = cache.evict_lock.lock();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        let writer = {
            let cache = cache.clone();
            std::thread::spawn(move || {
                for ch in 0..4u64 {
                    cache.put(ChannelId(ch), (0..10).map(|id| msg(ch, id)));
                    cache.record_page(ChannelId(ch), None, &[msg(ch, 50)], true);
                }
                done_tx.send(()).unwrap();
            })
        };
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("writes below capacity blocked on the eviction lock");
        writer.join().unwrap();
        assert_eq!(cache.stats().size, 44);
    }

    #[tokio::test(start_paused = true)]
    async fn entry_count_follows_replacements_expiry_and_clear() {
        let cache = MessageCache::new(3, Duration::from_secs(300));
        cache.put(ChannelId(1), vec![msg(1, 1), msg(1, 2)]);
        cache.put(ChannelId(1), vec![msg(1, 2)]);
        assert_eq!(cache.stats().size, 2);

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(cache.lookup(ChannelId(1), MessageId(1)).is_none());
        assert_eq!(cache.stats().size, 1);

        cache.put(ChannelId(2), vec![msg(2, 3), msg(2, 4), msg(2, 5)]);
        assert_eq!(cache.stats().size, 3);
        assert!(cache.lookup(ChannelId(1), MessageId(2)).is_none());

        cache.clear();
        assert_eq!(cache.stats().size, 0);
        cache.put(ChannelId(2), vec![msg(2, 6)]);
        assert_eq!(cache.stats().size, 1);
    }

    #[test]
    fn clear_is_atomic_for_concurrent_readers() {
        let page: Vec<Message> = (1..=10).rev().map(|id| msg(1, id)).collect();
        let cache = Arc::new(MessageCache::new(1000, Duration::from_secs(300)));
        cache.record_page(ChannelId(1), None, &page, false);
        cache.put(ChannelId(2), vec![msg(2, 5)]);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let clearer = {
            let (cache, stop, page) = (cache.clone(), stop.clone(), page.clone());
            std::thread::spawn(move || {
                for _ in 0..500 {
                    cache.clear();
                    cache.record_page(ChannelId(1), None, &page, false);
                    cache.put(ChannelId(2), vec![msg(2, 5)]);
                }
                stop.store(true, Ordering::SeqCst);
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let (cache, stop) = (cache.clone(), stop.clone());
                std::thread::spawn(move || {
                    let rt = tokio::runtime::Builder::new_current_thread()
                        .enable_time()
                        .build()
                        .unwrap();
                    let expected: Vec<u64> = (1..=10).rev().collect();
                    while !stop.load(Ordering::SeqCst) {
                        if let Some(hit) = cache.cached_page(ChannelId(1), None, 10) {
                            let ids: Vec<u64> = hit.messages.iter().map(|m| m.id.0).collect();
                            assert_eq!(ids, expected);
                        }
                        let recent = cache.get_recent(ChannelId(1), 10);
                        assert!(
                            recent.is_empty() || recent.len() == 10,
                            "partial: {}",
                            recent.len()
                        );

                        let got: Result<Message, ()> = rt.block_on(cache.get_or_fetch(
                            ChannelId(2),
                            MessageId(5),
                            || async { Ok(msg(2, 5)) },
                        ));
                        assert_eq!(got.unwrap().content, "message 5");
                    }
                })
            })
            .collect();

        clearer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    proptest! {
        #[test]
        fn full_cache_evicts_exactly_the_lru_entry(
            inserts in proptest::collection::vec((0u64..4, 0u64..1000), 5..40),
            capacity in 2usize..6,
        ) {
            let cache = MessageCache::new(capacity, Duration::from_secs(300));
            let mut order: Vec<(u64, u64)> = Vec::new();
            for (ch, id) in inserts {
                cache.put(ChannelId(ch), vec![msg(ch, id)]);
                order.retain(|k| *k != (ch, id));
                order.push((ch, id));
                if order.len() > capacity {
                    order.remove(0);
                }
            }
            prop_assert_eq!(cache.stats().size, order.len());
            for (ch, id) in &order {
                prop_assert!(cache.lookup(ChannelId(*ch), MessageId(*id)).is_some());
            }
        }
    }
}
