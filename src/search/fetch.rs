//! Paginated history fetching under the platform's rate limit.
use crate::error::{FetchError, PlatformError};
use crate::metrics::Metrics;
use crate::model::{ChannelId, ChannelInfo, Member, Message, MessageId};
use crate::platform::ChatPlatform;
use crate::search::cache::MessageCache;
use log::{debug, warn};
use rand::Rng;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry and backoff limits for a single page request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts for a transient failure, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on random delay added to each backoff.
    pub jitter: Duration,
    /// Rate-limit waits tolerated for one page before giving up on it.
    pub max_rate_limit_waits: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(100),
            max_rate_limit_waits: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(extra)
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    /// Newest first.
    pub messages: Vec<Message>,
    pub has_more: bool,
    pub from_cache: bool,
}

pub struct FetchCoordinator {
    platform: Arc<dyn ChatPlatform>,
    cache: Arc<MessageCache>,
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl FetchCoordinator {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        cache: Arc<MessageCache>,
        policy: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            platform,
            cache,
            policy,
            metrics,
        }
    }

    /// The platform's channel list. Rate limits and transient failures are
    /// handled as for a history page.
    pub async fn list_channels(&self) -> Result<Vec<ChannelInfo>, PlatformError> {
        self.retry_listing("channels", || self.platform.list_channels()).await
    }

    pub async fn list_members(&self) -> Result<Vec<Member>, PlatformError> {
        self.retry_listing("members", || self.platform.list_members()).await
    }

    async fn retry_listing<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, PlatformError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut waits = 0;
        let mut attempt = 1;
        loop {
            match call().await {
                Err(PlatformError::RateLimited { retry_after })
                    if waits < self.policy.max_rate_limit_waits =>
                {
                    waits += 1;
                    self.metrics.rate_limit_waits.inc();
                    debug!("Listing {what} rate limited, waiting {retry_after:?}");
                    tokio::time::sleep(retry_after).await;
                }
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.jittered(attempt);
                    self.metrics.fetch_retries.inc();
                    warn!(
                        "Listing {what} failed: {e}; retry {attempt}/{} in {delay:?}",
                        self.policy.max_attempts - 1
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// One history page, cache first.
    ///
    /// A rate-limit signal suspends only this call for the signalled
    /// duration and then re-issues the same request. Other failures are
    /// classified and returned to the caller.
    pub async fn fetch_page(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
        refresh: bool,
    ) -> Result<Page, FetchError> {
        if !refresh {
            if let Some(page) = self.cache.cached_page(channel, before, limit) {
                return Ok(Page {
                    messages: page.messages,
                    has_more: page.has_more,
                    from_cache: true,
                });
            }
        }

        let mut waits = 0;
        loop {
            match self.platform.fetch_history(channel, before, limit).await {
                Ok(mut messages) => {
                    messages.sort_by(Message::newest_first);
                    let has_more = !messages.is_empty() && messages.len() >= limit;
                    self.cache.record_page(channel, before, &messages, has_more);
                    return Ok(Page {
                        messages,
                        has_more,
                        from_cache: false,
                    });
                }
                Err(PlatformError::RateLimited { retry_after }) => {
                    waits += 1;
                    if waits > self.policy.max_rate_limit_waits {
                        return Err(FetchError::Transient {
                            channel,
                            reason: format!("still rate limited after {} waits", waits - 1),
                        });
                    }
                    self.metrics.rate_limit_waits.inc();
                    debug!("Channel {channel} rate limited, waiting {retry_after:?}");
                    tokio::time::sleep(retry_after).await;
                }
                Err(other) => {
                    return Err(other.classify(channel).unwrap_or(FetchError::Transient {
                        channel,
                        reason: "unclassified platform failure".into(),
                    }));
                }
            }
        }
    }

    /// `fetch_page` with exponential backoff on transient failures, capped
    /// at `max_attempts`.
    pub async fn fetch_page_with_backoff(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
        refresh: bool,
    ) -> Result<Page, FetchError> {
        let mut attempt = 1;
        loop {
            match self.fetch_page(channel, before, limit, refresh).await {
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.jittered(attempt);
                    self.metrics.fetch_retries.inc();
                    warn!("{e}; retry {attempt}/{} in {delay:?}", self.policy.max_attempts - 1);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// A single message, served from the cache when fresh.
    pub async fn fetch_message(
        &self,
        channel: ChannelId,
        id: MessageId,
    ) -> Result<Message, FetchError> {
        self.cache
            .get_or_fetch(channel, id, || async {
                let mut waits = 0;
                loop {
                    match self.platform.fetch_message(channel, id).await {
                        Err(PlatformError::RateLimited { retry_after })
                            if waits < self.policy.max_rate_limit_waits =>
                        {
                            waits += 1;
                            self.metrics.rate_limit_waits.inc();
                            tokio::time::sleep(retry_after).await;
                        }
                        Err(e) => {
                            return Err(e.classify(channel).unwrap_or(FetchError::Transient {
                                channel,
                                reason: e.to_string(),
                            }))
                        }
                        Ok(message) => return Ok(message),
                    }
                }
            })
            .await
    }
}

/// Backward walk through one channel's history during a single scan pass.
///
/// Drops messages already seen in this pass, so a platform that returns
/// overlapping pages never makes a message count twice.
pub struct HistoryPass {
    channel: ChannelId,
    before: Option<MessageId>,
    seen: HashSet<MessageId>,
    refresh: bool,
    exhausted: bool,
}

impl HistoryPass {
    pub fn new(channel: ChannelId, refresh: bool) -> Self {
        Self {
            channel,
            before: None,
            seen: HashSet::new(),
            refresh,
            exhausted: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// The next batch of unseen messages, newest first. Empty once the start
    /// of the channel is reached.
    pub async fn next_page(
        &mut self,
        fetcher: &FetchCoordinator,
        limit: usize,
    ) -> Result<Vec<Message>, FetchError> {
        if self.exhausted || limit == 0 {
            return Ok(Vec::new());
        }
        let page = fetcher
            .fetch_page_with_backoff(self.channel, self.before, limit, self.refresh)
            .await?;
        if let Some(oldest) = page.messages.last() {
            self.before = Some(oldest.id);
        }
        let fresh: Vec<Message> = page
            .messages
            .into_iter()
            .filter(|m| self.seen.insert(m.id))
            .collect();
        if !page.has_more || fresh.is_empty() {
            self.exhausted = true;
        }
        Ok(fresh)
    }
}
