//! Keyword, regex and bad-word matching against message content.
//!
//! Patterns are compiled once per search. All modes compare against a
//! per-character lowercased copy of the content, which keeps the bad-word
//! strictness levels nested: anything `exact` finds, `substring` finds, and
//! anything `substring` finds, `fuzzy` finds.
use crate::error::{Result, ScanError};
use crate::model::{ChannelId, MatchReason, MatchResult, Message, MessageId, Pattern, Strictness};
use crate::search::cache::MessageCache;
use aho_corasick::AhoCorasick;
use anyhow::Context;
use log::warn;
use memchr::memmem;
use regex::{Regex, RegexBuilder};
use std::collections::{HashSet, VecDeque};
use std::path::Path;

/// Leetspeak substitutions applied by fuzzy matching, after lowercasing.
pub const FUZZY_SUBSTITUTIONS: &[(char, char)] = &[
    ('0', 'o'),
    ('1', 'i'),
    ('3', 'e'),
    ('4', 'a'),
    ('5', 's'),
    ('7', 't'),
    ('8', 'b'),
    ('9', 'g'),
    ('@', 'a'),
    ('$', 's'),
    ('!', 'i'),
    ('|', 'l'),
    ('+', 't'),
];

/// Characters dropped by fuzzy matching, in addition to whitespace.
pub const FUZZY_SEPARATORS: &[char] = &['.', '-', '_', '*', '~', '\'', '"'];

const REGEX_SIZE_LIMIT: usize = 32 * (1 << 20);

/// Lowercase one character at a time so that folding distributes over
/// concatenation.
pub fn fold(text: &str) -> String {
    text.chars().flat_map(char::to_lowercase).collect()
}

/// Fold, map leetspeak and drop separators: `B4d-W0rd` becomes `badword`.
pub fn normalize_fuzzy(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| !c.is_whitespace() && !FUZZY_SEPARATORS.contains(c))
        .map(|c| {
            FUZZY_SUBSTITUTIONS
                .iter()
                .find(|(from, _)| *from == c)
                .map_or(c, |(_, to)| *to)
        })
        .collect()
}

/// The configurable bad-word list. Words are stored folded and deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadWordList {
    words: Vec<String>,
}

impl BadWordList {
    pub fn from_words<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut list = Vec::new();
        for word in words {
            let word = fold(word.as_ref().trim());
            // Words made only of separators could never match fuzzily.
            if word.is_empty() || normalize_fuzzy(&word).is_empty() {
                continue;
            }
            if seen.insert(word.clone()) {
                list.push(word);
            }
        }
        Self { words: list }
    }

    /// One word per line; blank lines are skipped.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read bad-word list: {}", path.display()))?;
        Ok(Self::from_words(content.lines()))
    }

    pub fn words(&self) -> &[String] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

enum Compiled {
    Keyword {
        needle: String,
        finder: memmem::Finder<'static>,
    },
    Regex(Regex),
    Exact {
        regex: Regex,
    },
    Substring {
        automaton: AhoCorasick,
        words: Vec<String>,
    },
    Fuzzy {
        automaton: AhoCorasick,
        words: Vec<String>,
    },
    Nothing,
}

pub struct Matcher {
    compiled: Compiled,
    strictness: Option<Strictness>,
    context_radius: usize,
}

impl Matcher {
    /// Compile a pattern. A malformed regex fails here, before any fetch.
    pub fn compile(
        pattern: &Pattern,
        bad_words: &BadWordList,
        context_radius: usize,
    ) -> Result<Self> {
        let (compiled, strictness) = match pattern {
            Pattern::Keyword(keyword) => {
                let needle = fold(keyword);
                if needle.is_empty() {
                    return Err(ScanError::InvalidSpec("keyword must not be empty".into()));
                }
                let finder = memmem::Finder::new(needle.as_bytes()).into_owned();
                (Compiled::Keyword { needle, finder }, None)
            }
            Pattern::Regex(source) => {
                let regex = RegexBuilder::new(source)
                    .case_insensitive(true)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|source_err| ScanError::InvalidPattern {
                        pattern: source.clone(),
                        source: source_err,
                    })?;
                (Compiled::Regex(regex), None)
            }
            Pattern::BadWordList(strictness) => {
                if bad_words.is_empty() {
                    warn!("Bad-word scan requested with an empty word list");
                    (Compiled::Nothing, Some(*strictness))
                } else {
                    (compile_bad_words(bad_words, *strictness)?, Some(*strictness))
                }
            }
        };
        Ok(Self {
            compiled,
            strictness,
            context_radius,
        })
    }

    pub fn context_radius(&self) -> usize {
        self.context_radius
    }

    /// Decide whether `content` matches, without building context.
    pub fn check(&self, content: &str) -> Option<MatchReason> {
        match &self.compiled {
            Compiled::Keyword { needle, finder } => {
                let folded = fold(content);
                finder
                    .find(folded.as_bytes())
                    .map(|_| MatchReason::Keyword(needle.clone()))
            }
            Compiled::Regex(regex) => regex.find(content).map(|m| MatchReason::Regex {
                matched: m.as_str().to_string(),
            }),
            Compiled::Exact { regex } => {
                let folded = fold(content);
                let word = regex.captures(&folded)?.get(1)?;
                Some(self.bad_word(word.as_str().to_string()))
            }
            Compiled::Substring { automaton, words } => {
                let folded = fold(content);
                automaton
                    .find(&folded)
                    .map(|m| self.bad_word(words[m.pattern().as_usize()].clone()))
            }
            Compiled::Fuzzy { automaton, words } => {
                let normalized = normalize_fuzzy(content);
                automaton
                    .find(&normalized)
                    .map(|m| self.bad_word(words[m.pattern().as_usize()].clone()))
            }
            Compiled::Nothing => None,
        }
    }

    /// Match a message and attach its neighbours from `source`.
    pub fn evaluate<C>(&self, message: &Message, source: &C) -> Option<MatchResult>
    where
        C: ContextSource + ?Sized,
    {
        let match_reason = self.check(&message.content)?;
        let context = if self.context_radius == 0 {
            Vec::new()
        } else {
            source.neighbours(message.channel_id, message.id, self.context_radius)
        };
        Some(MatchResult {
            message: message.clone(),
            context,
            match_reason,
        })
    }

    fn bad_word(&self, word: String) -> MatchReason {
        MatchReason::BadWord {
            word,
            strictness: self.strictness.unwrap_or_default(),
        }
    }
}

fn compile_bad_words(list: &BadWordList, strictness: Strictness) -> Result<Compiled> {
    match strictness {
        Strictness::Exact => {
            let alternation = list
                .words()
                .iter()
                .map(|w| regex::escape(w))
                .collect::<Vec<_>>()
                .join("|");
            // Capture the word itself; the edges may consume a separator.
            let source = format!(r"(?:^|\W)({alternation})(?:$|\W)");
            let regex = RegexBuilder::new(&source)
                .size_limit(REGEX_SIZE_LIMIT)
                .build()
                .map_err(|source_err| ScanError::InvalidPattern {
                    pattern: "bad-word list".into(),
                    source: source_err,
                })?;
            Ok(Compiled::Exact { regex })
        }
        Strictness::Substring => {
            let words = list.words().to_vec();
            let automaton = AhoCorasick::new(&words)
                .map_err(|e| ScanError::InvalidConfig(format!("bad-word list: {e}")))?;
            Ok(Compiled::Substring { automaton, words })
        }
        Strictness::Fuzzy => {
            let mut seen = HashSet::new();
            let mut patterns = Vec::new();
            let mut words = Vec::new();
            for word in list.words() {
                let normalized = normalize_fuzzy(word);
                if seen.insert(normalized.clone()) {
                    patterns.push(normalized);
                    words.push(word.clone());
                }
            }
            let automaton = AhoCorasick::new(&patterns)
                .map_err(|e| ScanError::InvalidConfig(format!("bad-word list: {e}")))?;
            Ok(Compiled::Fuzzy { automaton, words })
        }
    }
}

/// Where `Matcher::evaluate` looks up the messages around a match.
pub trait ContextSource {
    /// Up to `radius` older and `radius` newer neighbours of `id`, oldest
    /// first. Neighbours the source does not know are left out.
    fn neighbours(&self, channel: ChannelId, id: MessageId, radius: usize) -> Vec<Message>;
}

impl ContextSource for MessageCache {
    fn neighbours(&self, channel: ChannelId, id: MessageId, radius: usize) -> Vec<Message> {
        let recent = self.get_recent(channel, usize::MAX);
        context_from(&recent, id, radius)
    }
}

/// Sliding window over one channel's newest-first history.
///
/// A pushed message becomes ready for evaluation once `radius` older
/// messages have arrived behind it, so its context is complete without
/// depending on what the cache still holds. Only the `radius` messages in
/// front of the oldest pending one are retained.
#[derive(Debug)]
pub struct ContextWindow {
    radius: usize,
    messages: VecDeque<Message>,
    /// Scanned messages not yet handed out, just ahead of `context_only`.
    pending: usize,
    /// Trailing messages pushed with `push_context`.
    context_only: usize,
}

impl ContextWindow {
    pub fn new(radius: usize) -> Self {
        Self {
            radius,
            messages: VecDeque::with_capacity(2 * radius + 2),
            pending: 0,
            context_only: 0,
        }
    }

    /// Append the next older scanned message.
    pub fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        self.pending += 1;
        self.trim();
    }

    /// Append an older message that only serves as context. Scanned
    /// messages must not be pushed after it.
    pub fn push_context(&mut self, message: Message) {
        self.messages.push_back(message);
        self.context_only += 1;
        self.trim();
    }

    /// The oldest pending message whose older side is complete.
    pub fn next_ready(&mut self) -> Option<Message> {
        if self.pending + self.context_only <= self.radius {
            return None;
        }
        self.take_pending()
    }

    /// Hand out a pending message regardless of its older side. Used once
    /// the channel has nothing older to offer.
    pub fn take_pending(&mut self) -> Option<Message> {
        if self.pending == 0 {
            return None;
        }
        let idx = self.oldest_pending();
        self.pending -= 1;
        self.messages.get(idx).cloned()
    }

    /// Scanned messages still waiting for older context, newest first.
    pub fn pending(&self) -> impl Iterator<Item = &Message> {
        let start = self.oldest_pending();
        self.messages.range(start..start + self.pending)
    }

    fn oldest_pending(&self) -> usize {
        self.messages.len() - self.context_only - self.pending
    }

    fn trim(&mut self) {
        while self.oldest_pending() > self.radius {
            self.messages.pop_front();
        }
    }
}

impl ContextSource for ContextWindow {
    fn neighbours(&self, _channel: ChannelId, id: MessageId, radius: usize) -> Vec<Message> {
        let Some(pos) = self.messages.iter().position(|m| m.id == id) else {
            return Vec::new();
        };
        let older_end = (pos + 1 + radius).min(self.messages.len());
        let older = self.messages.range(pos + 1..older_end);
        let newer = self.messages.range(pos.saturating_sub(radius)..pos);
        older.rev().chain(newer.rev()).cloned().collect()
    }
}

/// Up to `radius` older and `radius` newer neighbours of `target`, oldest
/// first, taken from a newest-first slice. Missing neighbours are skipped.
fn context_from(recent: &[Message], target: MessageId, radius: usize) -> Vec<Message> {
    let Some(pos) = recent.iter().position(|m| m.id == target) else {
        return Vec::new();
    };
    let newer = &recent[pos.saturating_sub(radius)..pos];
    let older_end = (pos + 1 + radius).min(recent.len());
    let older = &recent[pos + 1..older_end];
    older.iter().rev().chain(newer.iter().rev()).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChannelId, UserId};
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use std::time::Duration;

    fn words() -> BadWordList {
        BadWordList::from_words(["badword", "Heck", "  ", "..."])
    }

    fn msg(id: u64, content: &str) -> Message {
        Message {
            id: MessageId(id),
            channel_id: ChannelId(1),
            author_id: UserId(1),
            author_name: "u".into(),
            content: content.into(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + id as i64, 0).unwrap(),
            attachments: vec![],
        }
    }

    fn matcher(pattern: Pattern) -> Matcher {
        Matcher::compile(&pattern, &words(), 2).unwrap()
    }

    #[test]
    fn word_list_is_folded_and_filtered() {
        assert_eq!(words().words(), &["badword".to_string(), "heck".to_string()]);
    }

    #[test]
    fn keyword_is_case_insensitive_substring() {
        let m = matcher(Pattern::Keyword("FoO".into()));
        assert!(m.check("a food fight").is_some());
        assert!(m.check("FOOTBALL").is_some());
        assert!(m.check("fo o").is_none());
    }

    #[test]
    fn empty_keyword_is_rejected() {
        let err = Matcher::compile(&Pattern::Keyword(String::new()), &words(), 0);
        assert!(matches!(err, Err(ScanError::InvalidSpec(_))));
    }

    #[test]
    fn malformed_regex_fails_compile() {
        let err = Matcher::compile(&Pattern::Regex("(unclosed".into()), &words(), 0);
        assert!(matches!(err, Err(ScanError::InvalidPattern { .. })));
    }

    #[test]
    fn regex_reports_matched_text() {
        let m = matcher(Pattern::Regex(r"\b\w+ing\b".into()));
        assert_eq!(
            m.check("I was Running late"),
            Some(MatchReason::Regex {
                matched: "Running".into()
            })
        );
    }

    #[test]
    fn strictness_levels() {
        let exact = matcher(Pattern::BadWordList(Strictness::Exact));
        let substring = matcher(Pattern::BadWordList(Strictness::Substring));
        let fuzzy = matcher(Pattern::BadWordList(Strictness::Fuzzy));

        assert!(exact.check("what the HECK").is_some());
        assert!(exact.check("checkmate").is_none());
        assert!(substring.check("checkmate").is_some());
        assert!(substring.check("b4dw0rd").is_none());
        assert!(fuzzy.check("b4dw0rd").is_some());
        assert!(fuzzy.check("b.a.d w-o-r-d").is_some());
        assert!(fuzzy.check("a perfectly fine sentence").is_none());
    }

    #[test]
    fn bad_word_reason_names_the_word() {
        let fuzzy = matcher(Pattern::BadWordList(Strictness::Fuzzy));
        assert_eq!(
            fuzzy.check("h3ck"),
            Some(MatchReason::BadWord {
                word: "heck".into(),
                strictness: Strictness::Fuzzy
            })
        );
    }

    #[test]
    fn empty_word_list_matches_nothing() {
        let m = Matcher::compile(
            &Pattern::BadWordList(Strictness::Exact),
            &BadWordList::default(),
            0,
        )
        .unwrap();
        assert!(m.check("anything at all").is_none());
    }

    #[test]
    fn context_is_oldest_first_and_best_effort() {
        // newest first: 5 4 3 2 1
        let recent: Vec<Message> = (1..=5).rev().map(|i| msg(i, "x")).collect();
        let ids = |v: Vec<Message>| v.iter().map(|m| m.id.0).collect::<Vec<_>>();
        assert_eq!(ids(context_from(&recent, MessageId(3), 1)), vec![2, 4]);
        assert_eq!(ids(context_from(&recent, MessageId(1), 2)), vec![2, 3]);
        assert_eq!(ids(context_from(&recent, MessageId(5), 2)), vec![3, 4]);
        assert!(context_from(&recent, MessageId(42), 2).is_empty());
    }

    #[test]
    fn evaluate_attaches_cached_neighbours() {
        let cache = MessageCache::new(100, Duration::from_secs(300));
        cache.put(
            ChannelId(1),
            vec![msg(1, "hi"), msg(2, "foo here"), msg(3, "bye")],
        );
        let m = matcher(Pattern::Keyword("foo".into()));
        let result = m.evaluate(&msg(2, "foo here"), &cache).unwrap();
        assert_eq!(result.context.len(), 2);
        assert_eq!(result.context[0].id, MessageId(1));
        assert!(m.evaluate(&msg(1, "hi"), &cache).is_none());
    }

    #[test]
    fn exact_matches_words_with_symbol_edges() {
        let list = BadWordList::from_words(["@ss", "a$$", "heck"]);
        let exact = Matcher::compile(&Pattern::BadWordList(Strictness::Exact), &list, 0).unwrap();
        assert_eq!(
            exact.check("you @ss here"),
            Some(MatchReason::BadWord {
                word: "@ss".into(),
                strictness: Strictness::Exact
            })
        );
        assert!(exact.check("A$$").is_some());
        assert!(exact.check("oh heck.").is_some());
        assert!(exact.check("mail x@ss now").is_none());
        assert!(exact.check("class").is_none());
    }

    #[test]
    fn window_releases_messages_once_older_context_arrives() {
        let mut window = ContextWindow::new(2);
        let mut released = Vec::new();
        // Pushed newest first, as history pages arrive.
        for id in (1..=6).rev() {
            window.push(msg(id, "x"));
            while let Some(ready) = window.next_ready() {
                let context = window.neighbours(ChannelId(1), ready.id, 2);
                released.push((ready.id.0, context.iter().map(|m| m.id.0).collect::<Vec<_>>()));
            }
        }
        assert_eq!(
            released,
            vec![(6, vec![4, 5]), (5, vec![3, 4, 6]), (4, vec![2, 3, 5, 6]), (3, vec![1, 2, 4, 5])]
        );

        window.push_context(msg(0, "older, unscanned"));
        let ready = window.take_pending().unwrap();
        assert_eq!(ready.id, MessageId(2));
        let ids: Vec<u64> = window
            .neighbours(ChannelId(1), ready.id, 2)
            .iter()
            .map(|m| m.id.0)
            .collect();
        assert_eq!(ids, vec![0, 1, 3, 4]);
        assert_eq!(window.take_pending().map(|m| m.id), Some(MessageId(1)));
        assert!(window.pending().next().is_none());
    }

    proptest! {
        #[test]
        fn strictness_is_monotone(content in "[a-zA-Z0-9 .!@$|*_-]{0,40}", word in "[a-z]{2,6}") {
            let list = BadWordList::from_words([word.as_str()]);
            let at = |s| Matcher::compile(&Pattern::BadWordList(s), &list, 0).unwrap();
            let content = format!("{content} {word}x");
            let exact = at(Strictness::Exact).check(&content).is_some();
            let substring = at(Strictness::Substring).check(&content).is_some();
            let fuzzy = at(Strictness::Fuzzy).check(&content).is_some();
            prop_assert!(!exact || substring);
            prop_assert!(!substring || fuzzy);
        }

        #[test]
        fn regex_verdict_is_deterministic(content in ".{0,60}", pattern in "[a-z]{1,3}(\\.\\*)?[a-z]?") {
            let m = Matcher::compile(&Pattern::Regex(pattern), &BadWordList::default(), 0).unwrap();
            prop_assert_eq!(m.check(&content), m.check(&content));
        }
    }
}
