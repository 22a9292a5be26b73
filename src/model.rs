//! Plain data types shared by the cache, fetcher, matcher and engine
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

macro_rules! snowflake {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

snowflake!(ChannelId);
snowflake!(MessageId);
snowflake!(UserId);

/// A fetched chat message. Never mutated once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: ChannelId,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl Message {
    /// Newest-first ordering: later timestamp sorts first, ties broken by id.
    pub fn newest_first(a: &Message, b: &Message) -> Ordering {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    }
}

/// A channel as reported by the platform's channel listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub name: String,
    /// Whether the scanning identity may read this channel's history.
    #[serde(default = "default_readable")]
    pub readable: bool,
}

fn default_readable() -> bool {
    true
}

/// A member of the scanned community, as listed by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: UserId,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl Member {
    /// Account name first, then the display name if it differs.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let display = self
            .display_name
            .as_deref()
            .filter(|d| *d != self.name);
        std::iter::once(self.name.as_str()).chain(display)
    }
}

/// Which channels or users a scan applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Only messages authored by this user, across every accessible channel.
    User(UserId),
    ChannelSet(HashSet<ChannelId>),
    All,
}

/// Bad-word matcher recall level. Ordered by increasing recall.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    Exact,
    #[default]
    Substring,
    Fuzzy,
}

impl fmt::Display for Strictness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strictness::Exact => write!(f, "exact"),
            Strictness::Substring => write!(f, "substring"),
            Strictness::Fuzzy => write!(f, "fuzzy"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Keyword(String),
    Regex(String),
    BadWordList(Strictness),
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Keyword(k) => write!(f, "keyword '{k}'"),
            Pattern::Regex(r) => write!(f, "regex '{r}'"),
            Pattern::BadWordList(s) => write!(f, "bad words ({s})"),
        }
    }
}

/// A fully resolved search request.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub scope: Scope,
    pub pattern: Pattern,
    pub channel_include: Option<HashSet<ChannelId>>,
    pub channel_exclude: Option<HashSet<ChannelId>>,
    /// Messages inspected per channel, already resolved from any shorthand.
    pub depth_limit: usize,
    pub deep: bool,
    /// Ignore cached history windows and go to the platform for every page.
    pub force_refresh: bool,
    /// Who asked for the search, for per-user statistics.
    pub requester: Option<UserId>,
}

impl SearchSpec {
    pub fn new(scope: Scope, pattern: Pattern, depth_limit: usize) -> Self {
        Self {
            scope,
            pattern,
            channel_include: None,
            channel_exclude: None,
            depth_limit,
            deep: false,
            force_refresh: false,
            requester: None,
        }
    }

    pub fn include(mut self, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        self.channel_include = Some(channels.into_iter().collect());
        self
    }

    pub fn exclude(mut self, channels: impl IntoIterator<Item = ChannelId>) -> Self {
        self.channel_exclude = Some(channels.into_iter().collect());
        self
    }

    pub fn deep(mut self, deep: bool) -> Self {
        self.deep = deep;
        self
    }

    pub fn force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn requested_by(mut self, user: UserId) -> Self {
        self.requester = Some(user);
        self
    }
}

/// Why a message matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum MatchReason {
    Keyword(String),
    Regex { matched: String },
    BadWord { word: String, strictness: Strictness },
}

impl fmt::Display for MatchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchReason::Keyword(k) => write!(f, "keyword '{k}'"),
            MatchReason::Regex { matched } => write!(f, "regex matched '{matched}'"),
            MatchReason::BadWord { word, strictness } => {
                write!(f, "bad word '{word}' ({strictness})")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub message: Message,
    /// Surrounding messages, oldest first. Best effort.
    pub context: Vec<Message>,
    pub match_reason: MatchReason,
}

/// A member whose name or display name matched the bad-word list.
#[derive(Debug, Clone, Serialize)]
pub struct MemberMatch {
    pub member: Member,
    /// The name that matched.
    pub matched_name: String,
    pub match_reason: MatchReason,
}
