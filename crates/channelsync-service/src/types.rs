//! Records exchanged with the upstream API and the store.
use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::enrichment::EnrichmentLevel;

/// Identifies a single refreshable upstream entity, such as a channel, video or comment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl Borrow<str> for ResourceKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A normalized search query.
///
/// Two raw queries that only differ in case or whitespace map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchKey(String);

impl SearchKey {
    /// Normalizes a raw query: trims it, lowercases it and collapses inner whitespace.
    ///
    /// Returns `None` if nothing is left.
    pub fn normalize(raw: &str) -> Option<Self> {
        let normalized = raw
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");

        (!normalized.is_empty()).then_some(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SearchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for SearchKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A channel, the parent record of every sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ResourceKey,
    /// The playlist holding all uploads, used to page through the channel's videos.
    pub uploads_playlist_id: String,
    pub name: String,
    pub description: String,
    pub thumbnail_url: Option<String>,
    pub subscriber_count: u64,
    /// How often the channel was viewed, gated by the cooldown.
    pub search_count: u64,
    /// When the last comment sync finished. `None` for channels that were only
    /// discovered through a search.
    pub last_synced_at: Option<DateTime<Utc>>,
    pub enrichment: EnrichmentLevel,
}

impl Channel {
    /// Takes over the locally owned fields of a previously stored version of this channel.
    ///
    /// Freshly fetched records only carry upstream metadata, while view counts, sync
    /// timestamps and the enrichment level are only known locally.
    pub fn merge_local_state(&mut self, stored: &Channel) {
        self.search_count = stored.search_count;
        self.last_synced_at = stored.last_synced_at;
        self.enrichment = self.enrichment.max(stored.enrichment);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: ResourceKey,
    pub channel_id: ResourceKey,
    pub title: String,
    pub thumbnail_url: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// A top level comment on a video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: ResourceKey,
    pub video_id: ResourceKey,
    pub author_id: Option<String>,
    pub author_name: String,
    pub author_thumbnail_url: Option<String>,
    pub content: String,
    pub like_count: u64,
    pub reply_count: u64,
    pub published_at: DateTime<Utc>,
}

/// A reply to a comment. Replies are served from upstream and never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub author_name: String,
    pub author_thumbnail_url: Option<String>,
    pub content: String,
    pub like_count: u64,
    pub published_at: DateTime<Utc>,
}

/// One page of a paginated upstream listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            next_page_token: None,
        }
    }
}

/// Sort order for [`Store::find_top_channels`](crate::store::Store::find_top_channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    /// Most viewed first.
    SearchCount,
    /// Largest first.
    SubscriberCount,
}
