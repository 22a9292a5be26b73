//! Scan pipeline: message cache, paginated fetching, matching and the
//! multi-channel engine that ties them together.
pub mod cache;
pub mod engine;
pub mod fetch;
pub mod matcher;

pub use cache::{CacheStats, MessageCache};
pub use engine::{merge_newest_first, ChannelReport, ScanEngine, ScanLimits, ScanOutcome};
pub use fetch::{FetchCoordinator, HistoryPass, Page, RetryPolicy};
pub use matcher::{BadWordList, ContextSource, ContextWindow, Matcher};
