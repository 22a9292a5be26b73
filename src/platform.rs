//! Boundary to the chat platform that owns the message history.
//!
//! The scan core needs the list of channels visible to the scanning
//! identity, a cursor-paginated history read ("messages before X, at most
//! N") and, for auto-scan name checks, the member list. Gateway connections,
//! command parsing and permissions live behind this trait.
use crate::error::PlatformError;
use crate::model::{ChannelId, ChannelInfo, Member, Message, MessageId};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, PlatformError>;

    /// Up to `limit` messages strictly older than `before` (or the newest
    /// messages when `before` is `None`), newest first.
    async fn fetch_history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, PlatformError>;

    async fn fetch_message(
        &self,
        channel: ChannelId,
        id: MessageId,
    ) -> Result<Message, PlatformError>;

    async fn list_members(&self) -> Result<Vec<Member>, PlatformError>;
}

#[derive(Debug, Deserialize)]
struct ArchiveFile {
    channels: Vec<ArchivedChannel>,
    #[serde(default)]
    members: Vec<Member>,
}

#[derive(Debug, Deserialize)]
struct ArchivedChannel {
    #[serde(flatten)]
    info: ChannelInfo,
    #[serde(default)]
    messages: Vec<Message>,
}

/// A platform backed by a static JSON dump of channel histories.
///
/// ```json
/// { "channels": [ { "id": 1, "name": "general", "messages": [ ... ] } ],
///   "members": [ { "id": 7, "name": "alice", "display_name": "Al" } ] }
/// ```
pub struct ArchivePlatform {
    channels: Vec<ChannelInfo>,
    history: HashMap<ChannelId, Vec<Message>>,
    members: Vec<Member>,
}

impl ArchivePlatform {
    pub fn new(channels: Vec<(ChannelInfo, Vec<Message>)>) -> Self {
        let mut infos = Vec::with_capacity(channels.len());
        let mut history = HashMap::with_capacity(channels.len());
        for (info, mut messages) in channels {
            messages.sort_by(Message::newest_first);
            history.insert(info.id, messages);
            infos.push(info);
        }
        Self {
            channels: infos,
            history,
            members: Vec::new(),
        }
    }

    pub fn with_members(mut self, members: Vec<Member>) -> Self {
        self.members = members;
        self
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let file: ArchiveFile =
            serde_json::from_str(json).context("Failed to parse message archive")?;
        Ok(Self::new(
            file.channels
                .into_iter()
                .map(|c| (c.info, c.messages))
                .collect(),
        )
        .with_members(file.members))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read archive: {}", path.display()))?;
        Self::from_json(&content)
    }

    fn readable(&self, channel: ChannelId) -> Result<&[Message], PlatformError> {
        let info = self
            .channels
            .iter()
            .find(|c| c.id == channel)
            .ok_or(PlatformError::NotFound)?;
        if !info.readable {
            return Err(PlatformError::Forbidden);
        }
        Ok(self.history.get(&channel).map(Vec::as_slice).unwrap_or(&[]))
    }
}

#[async_trait]
impl ChatPlatform for ArchivePlatform {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>, PlatformError> {
        Ok(self.channels.clone())
    }

    async fn fetch_history(
        &self,
        channel: ChannelId,
        before: Option<MessageId>,
        limit: usize,
    ) -> Result<Vec<Message>, PlatformError> {
        let messages = self.readable(channel)?;
        let start = match before {
            None => 0,
            Some(cursor) => {
                messages
                    .iter()
                    .position(|m| m.id == cursor)
                    .ok_or(PlatformError::NotFound)?
                    + 1
            }
        };
        Ok(messages.iter().skip(start).take(limit).cloned().collect())
    }

    async fn fetch_message(
        &self,
        channel: ChannelId,
        id: MessageId,
    ) -> Result<Message, PlatformError> {
        self.readable(channel)?
            .iter()
            .find(|m| m.id == id)
            .cloned()
            .ok_or(PlatformError::NotFound)
    }

    async fn list_members(&self) -> Result<Vec<Member>, PlatformError> {
        Ok(self.members.clone())
    }
}
