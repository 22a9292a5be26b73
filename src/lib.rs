pub mod autoscan;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod platform;
pub mod search;
pub mod stats;

pub use crate::autoscan::{AutoScanConfig, AutoScanState, AutoScanner, Finding, FindingKind};
pub use crate::config::Config;
pub use crate::error::{FetchError, PlatformError, Result, ScanError};
pub use crate::model::{
    ChannelId, ChannelInfo, MatchReason, MatchResult, Member, MemberMatch, Message, MessageId,
    Pattern, Scope, SearchSpec, Strictness, UserId,
};
pub use crate::platform::{ArchivePlatform, ChatPlatform};
pub use crate::search::{BadWordList, MessageCache, ScanEngine, ScanOutcome};
pub use crate::stats::{ScanStats, StatsStore};
pub use clap::Parser;
