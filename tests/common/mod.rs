#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use msgscan::error::PlatformError;
use msgscan::model::{ChannelId, ChannelInfo, Member, Message, MessageId, UserId};
use msgscan::platform::ChatPlatform;
use msgscan::search::{MessageCache, RetryPolicy, ScanEngine, ScanLimits};
use msgscan::stats::StatsStore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const BASE_TS: i64 = 1_700_000_000;

/// A message whose id and timestamp both grow with `seq`.
pub fn msg(channel: u64, seq: u64, author: u64, content: &str) -> Message {
    Message {
        id: MessageId(channel * 1_000_000 + seq),
        channel_id: ChannelId(channel),
        author_id: UserId(author),
        author_name: format!("user{author}"),
        content: content.to_string(),
        timestamp: Utc.timestamp_opt(BASE_TS + seq as i64, 0).unwrap(),
        attachments: vec![],
    }
}

/// `count` filler messages, oldest first, with `content` at the given
/// sequence numbers.
pub fn history(channel: u64, count: u64, hits: &[(u64, &str)]) -> Vec<Message> {
    (1..=count)
        .map(|seq| {
            let content = hits
                .iter()
                .find(|(s, _)| *s == seq)
                .map(|(_, c)| *c)
                .unwrap_or("nothing to see here");
            msg(channel, seq, 1, content)
        })
        .collect()
}

/// Scripted in-memory chat platform.
#[derive(Default)]
pub struct FakePlatform {
    channels: Vec<ChannelInfo>,
    history: HashMap<ChannelId, Vec<Message>>,
    members: Vec<Member>,
    latency: HashMap<ChannelId, Duration>,
    always_fail: HashMap<ChannelId, PlatformError>,
    /// One-shot faults keyed by (channel, 1-based history call number).
    scripted: Mutex<HashMap<(ChannelId, usize), PlatformError>>,
    /// One-shot faults keyed by 1-based channel-listing call number.
    scripted_list: Mutex<HashMap<usize, PlatformError>>,
    history_calls: Mutex<HashMap<ChannelId, usize>>,
    list_calls: AtomicUsize,
    message_calls: AtomicUsize,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(mut self, id: u64, name: &str, messages: Vec<Message>) -> Self {
        let id = ChannelId(id);
        self.channels.push(ChannelInfo {
            id,
            name: name.to_string(),
            readable: true,
        });
        let mut messages = messages;
        messages.sort_by(Message::newest_first);
        self.history.insert(id, messages);
        self
    }

    pub fn latency(mut self, channel: u64, latency: Duration) -> Self {
        self.latency.insert(ChannelId(channel), latency);
        self
    }

    pub fn fail_always(mut self, channel: u64, error: PlatformError) -> Self {
        self.always_fail.insert(ChannelId(channel), error);
        self
    }

    pub fn fail_call(self, channel: u64, call: usize, error: PlatformError) -> Self {
        self.scripted.lock().insert((ChannelId(channel), call), error);
        self
    }

    pub fn fail_list_call(self, call: usize, error: PlatformError) -> Self {
        self.scripted_list.lock().insert(call, error);
        self
    }

    pub fn member(mut self, id: u64, name: &str, display_name: Option<&str>) -> Self {
        self.members.push(Member {
            id: UserId(id),
            name: name.to_string(),
            display_name: display_name.map(String::from),
        });
        self
    }

    pub fn history_calls(&self, channel: u64) -> usize {
        self.history_calls
            .lock()
            .get(&ChannelId(channel))
            .copied()
            .unwrap_or(0)
    }

    pub fn total_history_calls(&self) -> usize {
        self.history_calls.lock().values().sum()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn message_calls(&self) -> usize {
        self.message_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatPlatform for FakePlatform {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, PlatformError> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.scripted_list.lock().remove(&call) {
            return Err(error);
        }
        Ok(self.channels.clone())
    }

    async fn fetch_history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, PlatformError> {
        let call = {
            let mut calls = self.history_calls.lock();
            let n = calls.entry(channel).or_insert(0);
            *n += 1;
            *n
        };
        if let Some(latency) = self.latency.get(&channel) {
            tokio::time::sleep(*latency).await;
        }
        if let Some(error) = self.always_fail.get(&channel) {
            return Err(error.clone());
        }
        if let Some(error) = self.scripted.lock().remove(&(channel, call)) {
            return Err(error);
        }
        let history = self.history.get(&channel).ok_or(PlatformError::NotFound)?;
        let start = match before {
            None => 0,
            Some(cursor) => {
                history
                    .iter()
                    .position(|m| m.id == cursor)
                    .ok_or(PlatformError::NotFound)?
                    + 1
            }
        };
        Ok(history.iter().skip(start).take(limit).cloned().collect())
    }

    async fn fetch_message(
        &self,
        channel: ChannelId,
        id: MessageId,
    ) -> Result<Message, PlatformError> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.always_fail.get(&channel) {
            return Err(error.clone());
        }
        self.history
            .get(&channel)
            .and_then(|h| h.iter().find(|m| m.id == id))
            .cloned()
            .ok_or(PlatformError::NotFound)
    }

    async fn list_members(&self) -> Result<Vec<Member>, PlatformError> {
        Ok(self.members.clone())
    }
}

/// An engine whose cache holds at most `capacity` messages.
pub fn engine_with_cache(
    platform: Arc<FakePlatform>,
    limits: ScanLimits,
    capacity: usize,
) -> ScanEngine {
    let stats = Arc::new(StatsStore::in_memory());
    let cache =
        Arc::new(MessageCache::new(capacity, Duration::from_secs(300)).with_stats(stats.clone()));
    ScanEngine::new(platform, cache, stats, limits, fast_retry())
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        jitter: Duration::ZERO,
        max_rate_limit_waits: 5,
    }
}

pub fn limits(page_size: usize) -> ScanLimits {
    ScanLimits {
        page_size,
        ..ScanLimits::default()
    }
}

pub fn engine_with(platform: Arc<FakePlatform>, limits: ScanLimits) -> ScanEngine {
    engine_with_cache(platform, limits, 10_000)
}

pub fn engine(platform: Arc<FakePlatform>) -> ScanEngine {
    engine_with(platform, limits(10))
}
