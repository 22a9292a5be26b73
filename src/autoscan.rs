//! Periodic bad-word scan over every accessible channel, followed by a
//! check of member names and display names against the same list.
//!
//! The scheduler is a small state machine (`Disabled -> Armed -> Running ->
//! Armed`) driven by one tokio task. The next run is always scheduled from
//! the completion time of the previous one, and a run requested while
//! another is in progress is dropped rather than queued.
use crate::config::AutoScanSettings;
use crate::error::{Result, ScanError};
use crate::model::{MatchResult, MemberMatch, Pattern, Scope, SearchSpec, Strictness};
use crate::search::engine::ScanEngine;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const RUN_HISTORY: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoScanConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoScanState {
    Disabled,
    Armed,
    Running,
}

impl fmt::Display for AutoScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AutoScanState::Disabled => write!(f, "disabled"),
            AutoScanState::Armed => write!(f, "armed"),
            AutoScanState::Running => write!(f, "running"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AutoScanStatus {
    pub state: AutoScanState,
    pub config: AutoScanConfig,
    /// Time left until the next scheduled run, when armed.
    pub next_run_in: Option<Duration>,
    pub runs_completed: u64,
    pub findings: usize,
}

#[derive(Debug, Clone)]
pub enum FindingKind {
    Message(MatchResult),
    MemberName(MemberMatch),
}

/// A match found by a periodic scan.
#[derive(Debug, Clone)]
pub struct Finding {
    pub found_at: DateTime<Utc>,
    pub kind: FindingKind,
}

impl Finding {
    fn now(kind: FindingKind) -> Self {
        Self {
            found_at: Utc::now(),
            kind,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            FindingKind::Message(result) => {
                let m = &result.message;
                write!(
                    f,
                    "[AUTO-SCAN] {} ({}) in {} > {} [{}]",
                    m.author_name, m.author_id, m.channel_id, m.content, result.match_reason
                )
            }
            FindingKind::MemberName(hit) => write!(
                f,
                "[AUTO-SCAN] member {} ({}) name '{}' [{}]",
                hit.member.name, hit.member.id, hit.matched_name, hit.match_reason
            ),
        }
    }
}

/// Standing log of findings, oldest evicted first once full.
#[derive(Debug)]
pub struct FindingsLog {
    entries: VecDeque<Finding>,
    capacity: usize,
    total: u64,
}

impl FindingsLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    pub fn push(&mut self, finding: Finding) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(finding);
        self.total += 1;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Findings ever recorded, including evicted ones.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finding> {
        self.entries.iter()
    }

    pub fn drain(&mut self) -> Vec<Finding> {
        self.entries.drain(..).collect()
    }
}

/// Summary of one periodic run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub started: Instant,
    pub finished: Instant,
    pub messages_scanned: u64,
    pub matches: usize,
    /// Members whose name matched.
    pub member_matches: usize,
    pub incomplete: bool,
    pub error: Option<String>,
}

impl RunReport {
    pub fn elapsed(&self) -> Duration {
        self.finished.saturating_duration_since(self.started)
    }
}

struct Schedule {
    config: AutoScanConfig,
    state: AutoScanState,
    next_due: Option<Instant>,
    runs_completed: u64,
}

impl Schedule {
    fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_minutes * 60)
    }

    fn settle(&mut self) {
        if self.config.enabled {
            self.state = AutoScanState::Armed;
            self.next_due = Some(Instant::now() + self.interval());
        } else {
            self.state = AutoScanState::Disabled;
            self.next_due = None;
        }
    }
}

pub struct AutoScanner {
    engine: Arc<ScanEngine>,
    depth_limit: usize,
    strictness: Strictness,
    scan_members: bool,
    schedule: Mutex<Schedule>,
    findings: Mutex<FindingsLog>,
    runs: Mutex<VecDeque<RunReport>>,
    wake: Notify,
    shutdown: CancellationToken,
}

fn check_interval(minutes: u64) -> Result<()> {
    if minutes == 0 {
        return Err(ScanError::InvalidConfig(
            "auto-scan interval must be at least 1 minute".into(),
        ));
    }
    Ok(())
}

impl AutoScanner {
    pub fn new(engine: Arc<ScanEngine>, settings: &AutoScanSettings) -> Result<Self> {
        check_interval(settings.interval_minutes)?;
        if settings.depth_limit == 0 {
            return Err(ScanError::InvalidConfig(
                "auto-scan depth limit must be positive".into(),
            ));
        }
        let mut schedule = Schedule {
            config: AutoScanConfig {
                enabled: settings.enabled,
                interval_minutes: settings.interval_minutes,
            },
            state: AutoScanState::Disabled,
            next_due: None,
            runs_completed: 0,
        };
        schedule.settle();
        Ok(Self {
            engine,
            depth_limit: settings.depth_limit,
            strictness: settings.strictness,
            scan_members: settings.scan_members,
            schedule: Mutex::new(schedule),
            findings: Mutex::new(FindingsLog::new(settings.findings_capacity)),
            runs: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Spawn the scheduler loop on the current runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let scanner = Arc::clone(self);
        tokio::spawn(async move { scanner.drive().await })
    }

    /// Stop the loop and cancel an in-flight run.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn toggle(&self, enabled: bool) {
        {
            let mut schedule = self.schedule.lock();
            if schedule.config.enabled == enabled {
                return;
            }
            schedule.config.enabled = enabled;
            // A running scan settles itself when it finishes.
            if schedule.state != AutoScanState::Running {
                schedule.settle();
            }
        }
        info!("Auto-scan {}", if enabled { "enabled" } else { "disabled" });
        self.wake.notify_one();
    }

    /// Change the interval; an armed timer restarts from now.
    pub fn set_interval(&self, minutes: u64) -> Result<()> {
        check_interval(minutes)?;
        {
            let mut schedule = self.schedule.lock();
            schedule.config.interval_minutes = minutes;
            if schedule.state == AutoScanState::Armed {
                schedule.settle();
            }
        }
        info!("Auto-scan interval set to {minutes} minute(s)");
        self.wake.notify_one();
        Ok(())
    }

    pub fn config(&self) -> AutoScanConfig {
        self.schedule.lock().config
    }

    pub fn state(&self) -> AutoScanState {
        self.schedule.lock().state
    }

    pub fn status(&self) -> AutoScanStatus {
        let schedule = self.schedule.lock();
        let now = Instant::now();
        AutoScanStatus {
            state: schedule.state,
            config: schedule.config,
            next_run_in: schedule
                .next_due
                .map(|due| due.saturating_duration_since(now)),
            runs_completed: schedule.runs_completed,
            findings: self.findings.lock().len(),
        }
    }

    pub fn findings(&self) -> Vec<Finding> {
        self.findings.lock().iter().cloned().collect()
    }

    pub fn take_findings(&self) -> Vec<Finding> {
        self.findings.lock().drain()
    }

    /// Most recent runs, oldest first.
    pub fn recent_runs(&self) -> Vec<RunReport> {
        self.runs.lock().iter().cloned().collect()
    }

    fn spec(&self) -> SearchSpec {
        SearchSpec::new(
            Scope::All,
            Pattern::BadWordList(self.strictness),
            self.depth_limit,
        )
        .force_refresh(true)
    }

    /// Perform one run now. Returns `None` if a run is already in progress.
    pub async fn run_now(&self) -> Option<RunReport> {
        {
            let mut schedule = self.schedule.lock();
            if schedule.state == AutoScanState::Running {
                debug!("Auto-scan already running, request dropped");
                return None;
            }
            schedule.state = AutoScanState::Running;
            schedule.next_due = None;
        }

        let started_at = Utc::now();
        let started = Instant::now();
        info!("Running auto-scan ({})", started_at.format("%Y-%m-%d %H:%M:%S"));
        let outcome = self
            .engine
            .run_cancellable(&self.spec(), self.shutdown.child_token())
            .await;
        let member_hits = self.scan_member_names().await;
        let finished = Instant::now();

        let mut report = RunReport {
            started_at,
            started,
            finished,
            messages_scanned: 0,
            matches: 0,
            member_matches: member_hits.len(),
            incomplete: false,
            error: None,
        };
        let found = match outcome {
            Ok(outcome) => {
                report.messages_scanned = outcome.messages_scanned;
                report.matches = outcome.results.len();
                report.incomplete = outcome.incomplete;
                outcome.results
            }
            Err(e) => {
                warn!("Auto-scan failed: {e}");
                report.error = Some(e.to_string());
                Vec::new()
            }
        };
        {
            let mut log = self.findings.lock();
            let kinds = found
                .into_iter()
                .map(FindingKind::Message)
                .chain(member_hits.into_iter().map(FindingKind::MemberName));
            for finding in kinds.map(Finding::now) {
                info!("{finding}");
                log.push(finding);
            }
        }

        {
            let mut schedule = self.schedule.lock();
            schedule.runs_completed += 1;
            schedule.settle();
            if let Some(due) = schedule.next_due {
                info!(
                    "Auto-scan complete: {} match(es) in {} message(s), next run in {}s",
                    report.matches,
                    report.messages_scanned,
                    due.saturating_duration_since(Instant::now()).as_secs()
                );
            }
        }
        self.wake.notify_one();
        let mut runs = self.runs.lock();
        if runs.len() == RUN_HISTORY {
            runs.pop_front();
        }
        runs.push_back(report.clone());
        Some(report)
    }

    /// Name check pass. A failure is logged and leaves the run's message
    /// findings intact.
    async fn scan_member_names(&self) -> Vec<MemberMatch> {
        if !self.scan_members || self.shutdown.is_cancelled() {
            return Vec::new();
        }
        match self.engine.scan_members(self.strictness).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!("Auto-scan member check failed: {e}");
                Vec::new()
            }
        }
    }

    async fn drive(&self) {
        loop {
            let due = self.schedule.lock().next_due;
            match due {
                Some(due) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => continue,
                        _ = tokio::time::sleep_until(due) => {
                            self.run_now().await;
                        }
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => continue,
                    }
                }
            }
        }
        debug!("Auto-scan loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelId, MatchReason, Member, Message, MessageId, UserId};

    fn reason() -> MatchReason {
        MatchReason::BadWord {
            word: "badword".into(),
            strictness: Strictness::Substring,
        }
    }

    fn finding(id: u64) -> Finding {
        Finding::now(FindingKind::Message(MatchResult {
            message: Message {
                id: MessageId(id),
                channel_id: ChannelId(1),
                author_id: UserId(9),
                author_name: "mallory".into(),
                content: "badword".into(),
                timestamp: Utc::now(),
                attachments: vec![],
            },
            context: vec![],
            match_reason: reason(),
        }))
    }

    #[test]
    fn findings_log_evicts_oldest() {
        let mut log = FindingsLog::new(2);
        for id in 1..=3 {
            log.push(finding(id));
        }
        let ids: Vec<u64> = log
            .iter()
            .filter_map(|f| match &f.kind {
                FindingKind::Message(r) => Some(r.message.id.0),
                FindingKind::MemberName(_) => None,
            })
            .collect();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(log.total_recorded(), 3);
    }

    #[test]
    fn finding_line_is_prefixed() {
        let line = finding(1).to_string();
        assert!(line.starts_with("[AUTO-SCAN] mallory (9) in 1 > badword"));
    }

    #[test]
    fn member_finding_names_the_member() {
        let line = Finding::now(FindingKind::MemberName(MemberMatch {
            member: Member {
                id: UserId(4),
                name: "eve".into(),
                display_name: Some("b4dword".into()),
            },
            matched_name: "b4dword".into(),
            match_reason: reason(),
        }))
        .to_string();
        assert_eq!(
            line,
            "[AUTO-SCAN] member eve (4) name 'b4dword' [bad word 'badword' (substring)]"
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(matches!(check_interval(0), Err(ScanError::InvalidConfig(_))));
        assert!(check_interval(1).is_ok());
    }
}
