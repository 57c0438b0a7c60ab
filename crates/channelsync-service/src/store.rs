//! The contract of the local persistence layer.
use async_trait::async_trait;

use crate::types::{Channel, ChannelOrder, Comment, ResourceKey, Video};

/// Local storage for synced records.
///
/// All upserts are idempotent by primary key. Implementations decide on their own isolation,
/// readers may observe the partial writes of a sync that is still running.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Inserts or updates channels.
    ///
    /// The search count of a known channel is left untouched, it only ever changes through
    /// [`increment_search_count`](Self::increment_search_count).
    async fn upsert_channels(&self, channels: &[Channel]) -> anyhow::Result<()>;

    async fn upsert_videos(&self, videos: &[Video]) -> anyhow::Result<()>;

    async fn upsert_comments(&self, comments: &[Comment]) -> anyhow::Result<()>;

    async fn find_channel(&self, key: &ResourceKey) -> anyhow::Result<Option<Channel>>;

    /// Finds the known channels among `keys`, largest first.
    async fn find_channels(&self, keys: &[ResourceKey]) -> anyhow::Result<Vec<Channel>>;

    /// The first `n` channels by the given order.
    async fn find_top_channels(&self, order: ChannelOrder, n: usize)
    -> anyhow::Result<Vec<Channel>>;

    /// Deletes channels together with their videos and comments.
    async fn delete_channels(&self, keys: &[ResourceKey]) -> anyhow::Result<()>;

    /// Increments the search count of a channel.
    ///
    /// Returns `false` if the channel is unknown.
    async fn increment_search_count(&self, key: &ResourceKey) -> anyhow::Result<bool>;

    /// A page of the comments on all videos of a channel, most liked first.
    async fn find_comments(
        &self,
        channel: &ResourceKey,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Comment>>;
}
