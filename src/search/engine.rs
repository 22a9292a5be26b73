//! Core scan engine: scope resolution, bounded per-channel workers and the
//! final newest-first merge.
use crate::config::Config;
use crate::error::{FetchError, Result, ScanError};
use crate::metrics::Metrics;
use crate::model::{
    ChannelId, ChannelInfo, MatchResult, MemberMatch, Message, MessageId, Pattern, Scope,
    SearchSpec, Strictness,
};
use crate::platform::ChatPlatform;
use crate::search::cache::MessageCache;
use crate::search::fetch::{FetchCoordinator, HistoryPass, RetryPolicy};
use crate::search::matcher::{BadWordList, ContextSource, ContextWindow, Matcher};
use crate::stats::{SearchRecord, StatsStore};
use log::{debug, error, info, warn};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Engine-wide bounds. See `Config::scan_limits` for the defaults.
#[derive(Debug, Clone)]
pub struct ScanLimits {
    pub page_size: usize,
    /// Channels scanned at once.
    pub max_concurrency: usize,
    /// Channels scanned by a non-deep search; 0 means no cap.
    pub channel_cap: usize,
    /// Per-channel depth multiplier for deep searches.
    pub deep_factor: usize,
    /// Most results returned by one scan.
    pub result_cap: usize,
    /// Neighbours attached on each side of a match.
    pub context_radius: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_concurrency: 4,
            channel_cap: 50,
            deep_factor: 10,
            result_cap: 5000,
            context_radius: 2,
        }
    }
}

/// What happened in one channel.
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub channel: ChannelId,
    pub name: String,
    pub messages_scanned: usize,
    pub matches: usize,
    pub elapsed: Duration,
    /// Set when the channel was skipped after a fetch failure.
    pub error: Option<FetchError>,
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    /// Newest first across all channels.
    pub results: Vec<MatchResult>,
    pub messages_scanned: u64,
    /// Matches found before the result cap was applied.
    pub matches_found: u64,
    pub channels: Vec<ChannelReport>,
    /// Channels dropped because the scan was cancelled before they finished.
    pub channels_abandoned: usize,
    /// The scan was cancelled; `results` covers completed channels only.
    pub incomplete: bool,
    pub truncated: bool,
    pub elapsed: Duration,
}

impl ScanOutcome {
    pub fn skipped_channels(&self) -> impl Iterator<Item = &ChannelReport> {
        self.channels.iter().filter(|c| c.error.is_some())
    }
}

struct ChannelScan {
    report: ChannelReport,
    results: Vec<MatchResult>,
}

/// Per-run parameters shared by every channel worker.
struct ChannelJob {
    scope: Scope,
    depth: usize,
    refresh: bool,
    page_size: usize,
}

pub struct ScanEngine {
    fetcher: Arc<FetchCoordinator>,
    cache: Arc<MessageCache>,
    stats: Arc<StatsStore>,
    metrics: Arc<Metrics>,
    bad_words: BadWordList,
    limits: ScanLimits,
}

impl ScanEngine {
    pub fn new(
        platform: Arc<dyn ChatPlatform>,
        cache: Arc<MessageCache>,
        stats: Arc<StatsStore>,
        limits: ScanLimits,
        retry: RetryPolicy,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let fetcher = Arc::new(FetchCoordinator::new(
            platform,
            cache.clone(),
            retry,
            metrics.clone(),
        ));
        Self {
            fetcher,
            cache,
            stats,
            metrics,
            bad_words: BadWordList::default(),
            limits,
        }
    }

    /// Wire an engine from configuration: stats file, cache bounds, retry
    /// policy and bad-word list.
    pub fn from_config(config: &Config, platform: Arc<dyn ChatPlatform>) -> anyhow::Result<Self> {
        let stats = Arc::new(StatsStore::open(&config.stats.path)?);
        let cache = Arc::new(
            MessageCache::new(config.cache.max_entries, config.cache.ttl())
                .with_stats(stats.clone()),
        );
        let mut words = config.badwords.words.clone();
        if let Some(path) = &config.badwords.path {
            words.extend(BadWordList::load(path)?.words().iter().cloned());
        }
        Ok(Self::new(
            platform,
            cache,
            stats,
            config.scan_limits(),
            config.fetch.retry_policy(),
        )
        .with_bad_words(BadWordList::from_words(words)))
    }

    pub fn with_bad_words(mut self, bad_words: BadWordList) -> Self {
        self.bad_words = bad_words;
        self
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<StatsStore> {
        &self.stats
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn run(&self, spec: &SearchSpec) -> Result<ScanOutcome> {
        self.execute(spec, CancellationToken::new(), None).await
    }

    /// Run until `cancel` fires. Cancellation is not an error: completed
    /// channels are returned and the outcome is flagged incomplete.
    pub async fn run_cancellable(
        &self,
        spec: &SearchSpec,
        cancel: CancellationToken,
    ) -> Result<ScanOutcome> {
        self.execute(spec, cancel, None).await
    }

    pub async fn run_until(&self, spec: &SearchSpec, deadline: Instant) -> Result<ScanOutcome> {
        self.execute(spec, CancellationToken::new(), Some(deadline))
            .await
    }

    /// A message plus its cached neighbours, fetching it if needed.
    pub async fn message_context(
        &self,
        channel: ChannelId,
        id: MessageId,
        radius: usize,
    ) -> std::result::Result<(Message, Vec<Message>), FetchError> {
        let message = self.fetcher.fetch_message(channel, id).await?;
        if radius > 0 {
            // Pull the older side into the cache; newer neighbours are only
            // known if an earlier scan saw them.
            if let Err(e) = self
                .fetcher
                .fetch_page_with_backoff(channel, Some(id), radius, false)
                .await
            {
                debug!("No older context for {channel}/{id}: {e}");
            }
        }
        let context = self.cache.neighbours(channel, id, radius);
        Ok((message, context))
    }

    /// Member names and display names that match the bad-word list.
    pub async fn scan_members(&self, strictness: Strictness) -> Result<Vec<MemberMatch>> {
        let matcher = Matcher::compile(&Pattern::BadWordList(strictness), &self.bad_words, 0)?;
        let members = self.fetcher.list_members().await?;
        let checked = members.len();
        let matches: Vec<MemberMatch> = members
            .into_iter()
            .filter_map(|member| {
                let (name, reason) = member
                    .names()
                    .find_map(|name| Some((name.to_string(), matcher.check(name)?)))?;
                Some(MemberMatch {
                    member,
                    matched_name: name,
                    match_reason: reason,
                })
            })
            .collect();
        debug!("Checked {checked} member name(s), {} match(es)", matches.len());
        Ok(matches)
    }

    async fn execute(
        &self,
        spec: &SearchSpec,
        cancel: CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<ScanOutcome> {
        let started = Instant::now();
        validate(spec)?;
        let matcher = Arc::new(Matcher::compile(
            &spec.pattern,
            &self.bad_words,
            self.limits.context_radius,
        )?);
        let channels = self.resolve_channels(spec).await?;

        let depth = if spec.deep {
            spec.depth_limit.saturating_mul(self.limits.deep_factor)
        } else {
            spec.depth_limit
        };
        info!(
            "Scanning {} channel(s), depth {depth}{}",
            channels.len(),
            if spec.deep { " (deep)" } else { "" }
        );

        let job = Arc::new(ChannelJob {
            scope: spec.scope.clone(),
            depth,
            refresh: spec.force_refresh,
            page_size: self.limits.page_size,
        });
        let semaphore = Arc::new(Semaphore::new(self.limits.max_concurrency.max(1)));
        let mut workers = JoinSet::new();
        for info in channels {
            let fetcher = self.fetcher.clone();
            let matcher = matcher.clone();
            let metrics = self.metrics.clone();
            let job = job.clone();
            let semaphore = semaphore.clone();
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                scan_channel(info, &fetcher, &matcher, &metrics, &job).await
            });
        }

        let expire = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(expire);

        let mut reports = Vec::new();
        let mut per_channel = Vec::new();
        let mut incomplete = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    incomplete = true;
                    break;
                }
                _ = &mut expire => {
                    incomplete = true;
                    break;
                }
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(scan)) => {
                        reports.push(scan.report);
                        per_channel.push(scan.results);
                    }
                    Some(Err(e)) => error!("Channel worker failed: {e}"),
                },
            }
        }
        let channels_abandoned = workers.len();
        workers.abort_all();
        if incomplete {
            warn!("Scan cancelled with {channels_abandoned} channel(s) unfinished");
        }

        if !incomplete && !reports.is_empty() && reports.iter().all(|r| r.error.is_some()) {
            return Err(ScanError::NoChannelsAccessible {
                failed: reports.len(),
            });
        }

        let messages_scanned: u64 = reports.iter().map(|r| r.messages_scanned as u64).sum();
        let matches_found: u64 = per_channel.iter().map(|r| r.len() as u64).sum();
        let (results, truncated) = merge_newest_first(per_channel, self.limits.result_cap);
        let elapsed = started.elapsed();

        self.stats.record(SearchRecord {
            query: spec.pattern.to_string(),
            requester: spec.requester,
            messages_scanned,
            matches_found,
            deep: spec.deep,
            cancelled: incomplete,
            elapsed,
        });
        info!(
            "Scan finished: {matches_found} match(es) in {messages_scanned} message(s) over {:.1}s",
            elapsed.as_secs_f64()
        );

        Ok(ScanOutcome {
            results,
            messages_scanned,
            matches_found,
            channels: reports,
            channels_abandoned,
            incomplete,
            truncated,
            elapsed,
        })
    }

    async fn resolve_channels(&self, spec: &SearchSpec) -> Result<Vec<ChannelInfo>> {
        let listed = self.fetcher.list_channels().await?;
        let mut channels: Vec<ChannelInfo> = listed
            .into_iter()
            .filter(|c| c.readable)
            .filter(|c| match &spec.scope {
                Scope::ChannelSet(set) => set.contains(&c.id),
                Scope::User(_) | Scope::All => true,
            })
            .filter(|c| spec.channel_include.as_ref().is_none_or(|inc| inc.contains(&c.id)))
            .filter(|c| spec.channel_exclude.as_ref().is_none_or(|exc| !exc.contains(&c.id)))
            .collect();

        if !spec.deep && self.limits.channel_cap > 0 && channels.len() > self.limits.channel_cap {
            debug!(
                "Capping scan at {} of {} channels",
                self.limits.channel_cap,
                channels.len()
            );
            channels.truncate(self.limits.channel_cap);
        }
        if channels.is_empty() {
            return Err(ScanError::NoChannelsAccessible { failed: 0 });
        }
        Ok(channels)
    }
}

fn validate(spec: &SearchSpec) -> Result<()> {
    if spec.channel_include.is_some() && spec.channel_exclude.is_some() {
        return Err(ScanError::InvalidSpec(
            "channel include and exclude lists are mutually exclusive".into(),
        ));
    }
    if spec.depth_limit == 0 {
        return Err(ScanError::InvalidSpec("depth limit must be positive".into()));
    }
    if let Scope::ChannelSet(set) = &spec.scope {
        if set.is_empty() {
            return Err(ScanError::InvalidSpec("channel set is empty".into()));
        }
    }
    Ok(())
}

async fn scan_channel(
    info: ChannelInfo,
    fetcher: &FetchCoordinator,
    matcher: &Matcher,
    metrics: &Metrics,
    job: &ChannelJob,
) -> ChannelScan {
    let started = Instant::now();
    let radius = matcher.context_radius();
    let mut pass = HistoryPass::new(info.id, job.refresh);
    let mut window = ContextWindow::new(radius);
    let mut scanned = 0usize;
    let mut results = Vec::new();
    let mut failure = None;

    let wanted = |message: &Message| match job.scope {
        Scope::User(user) => message.author_id == user,
        Scope::ChannelSet(_) | Scope::All => true,
    };

    while scanned < job.depth && !pass.is_exhausted() {
        let want = job.page_size.min(job.depth - scanned);
        let batch = match pass.next_page(fetcher, want).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Skipping channel #{} ({}): {e}", info.name, info.id);
                metrics.channels_skipped.inc();
                failure = Some(e);
                break;
            }
        };
        for message in batch {
            if scanned >= job.depth {
                break;
            }
            scanned += 1;
            window.push(message);
            while let Some(ready) = window.next_ready() {
                if wanted(&ready) {
                    results.extend(matcher.evaluate(&ready, &window));
                }
            }
        }
    }

    // Stopped at the depth limit: the older neighbours still exist.
    let needs_older = window
        .pending()
        .any(|m| wanted(m) && matcher.check(&m.content).is_some());
    if needs_older && failure.is_none() && !pass.is_exhausted() {
        match pass.next_page(fetcher, radius).await {
            Ok(older) => older.into_iter().for_each(|m| window.push_context(m)),
            Err(e) => debug!("No older context for #{}: {e}", info.name),
        }
    }
    while let Some(ready) = window.take_pending() {
        if wanted(&ready) {
            results.extend(matcher.evaluate(&ready, &window));
        }
    }

    metrics.messages_scanned.inc_by(scanned as u64);
    metrics.matches_found.inc_by(results.len() as u64);
    debug!(
        "Channel #{} scanned {scanned} message(s), {} match(es)",
        info.name,
        results.len()
    );

    ChannelScan {
        report: ChannelReport {
            channel: info.id,
            name: info.name,
            messages_scanned: scanned,
            matches: results.len(),
            elapsed: started.elapsed(),
            error: failure,
        },
        results,
    }
}

struct HeapItem {
    result: MatchResult,
    source: usize,
}

impl HeapItem {
    fn key(&self) -> (chrono::DateTime<chrono::Utc>, MessageId, ChannelId) {
        let m = &self.result.message;
        (m.timestamp, m.id, m.channel_id)
    }
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// K-way merge of per-channel newest-first lists into one newest-first list
/// of at most `cap` results (0 means no cap). Returns whether anything was
/// dropped by the cap.
pub fn merge_newest_first(lists: Vec<Vec<MatchResult>>, cap: usize) -> (Vec<MatchResult>, bool) {
    let total: usize = lists.iter().map(Vec::len).sum();
    let limit = if cap == 0 { total } else { cap.min(total) };
    let mut sources: Vec<std::vec::IntoIter<MatchResult>> =
        lists.into_iter().map(Vec::into_iter).collect();
    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (source, iter) in sources.iter_mut().enumerate() {
        if let Some(result) = iter.next() {
            heap.push(HeapItem { result, source });
        }
    }

    let mut merged = Vec::with_capacity(limit);
    while merged.len() < limit {
        let Some(HeapItem { result, source }) = heap.pop() else {
            break;
        };
        merged.push(result);
        if let Some(next) = sources[source].next() {
            heap.push(HeapItem {
                result: next,
                source,
            });
        }
    }
    (merged, total > limit)
}
