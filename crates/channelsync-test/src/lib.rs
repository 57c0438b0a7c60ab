//! Helpers for testing the sync orchestrator.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - [`MockUpstream`] answers from scripted records. Anything that was not scripted behaves
//!    like an empty upstream: unknown channels are `404`, every listing is empty. Every call is
//!    counted, so tests can assert on how much upstream quota an operation would have used.
//!
//!  - [`MemoryStore`] is a complete in-memory [`Store`]. Inspect it directly to check what a
//!    sync persisted.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use channelsync_service::config::SyncConfig;
use channelsync_service::enrichment::EnrichmentLevel;
use channelsync_service::service::ChannelSync;
use channelsync_service::store::Store;
use channelsync_service::types::{
    Channel, ChannelOrder, Comment, Page, Reply, ResourceKey, SearchKey, Video,
};
use channelsync_service::upstream::{Upstream, UpstreamError};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `channelsync_service` crate and
///    mutes all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("channelsync_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A fixed point in time, so records compare equal across test runs.
pub fn timestamp() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// A channel record as the upstream returns it.
pub fn channel(id: &str, subscribers: u64) -> Channel {
    Channel {
        id: id.into(),
        uploads_playlist_id: format!("UU{id}"),
        name: format!("Channel {id}"),
        description: String::new(),
        thumbnail_url: None,
        subscriber_count: subscribers,
        search_count: 0,
        last_synced_at: None,
        enrichment: EnrichmentLevel::None,
    }
}

pub fn video(channel: &str, id: &str) -> Video {
    Video {
        id: id.into(),
        channel_id: channel.into(),
        title: format!("Video {id}"),
        thumbnail_url: None,
        published_at: timestamp(),
    }
}

/// `n` videos of a channel, named `{channel}-v{i}`.
pub fn videos(channel: &str, n: usize) -> Vec<Video> {
    (0..n)
        .map(|i| video(channel, &format!("{channel}-v{i}")))
        .collect()
}

pub fn comment(video: &str, id: &str, likes: u64) -> Comment {
    Comment {
        id: id.into(),
        video_id: video.into(),
        author_id: Some(format!("author-{id}")),
        author_name: format!("Author {id}"),
        author_thumbnail_url: None,
        content: format!("Comment {id}"),
        like_count: likes,
        reply_count: 0,
        published_at: timestamp(),
    }
}

/// `n` comments on a video, named `{video}-c{i}`.
pub fn comments(video: &str, n: usize) -> Vec<Comment> {
    (0..n)
        .map(|i| comment(video, &format!("{video}-c{i}"), i as u64))
        .collect()
}

pub fn reply(content: &str) -> Reply {
    Reply {
        author_name: "Replier".into(),
        author_thumbnail_url: None,
        content: content.into(),
        like_count: 0,
        published_at: timestamp(),
    }
}

/// Shorthand for a set of resource keys.
pub fn keys(keys: &[&str]) -> BTreeSet<ResourceKey> {
    keys.iter().map(|key| ResourceKey::from(*key)).collect()
}

/// A config with the default depths, and no background sweeping during tests.
pub fn sync_config() -> SyncConfig {
    SyncConfig {
        cooldown_sweep_interval: Duration::from_secs(24 * 60 * 60),
        ..Default::default()
    }
}

/// Creates an orchestrator over the given fakes.
pub fn channel_sync(
    config: SyncConfig,
    upstream: &Arc<MockUpstream>,
    store: &Arc<MemoryStore>,
) -> ChannelSync {
    ChannelSync::new(config, upstream.clone(), store.clone())
}

#[derive(Default)]
struct Script {
    searches: HashMap<SearchKey, Result<BTreeSet<ResourceKey>, UpstreamError>>,
    channels: HashMap<ResourceKey, Result<Channel, UpstreamError>>,
    videos: HashMap<ResourceKey, Result<Vec<Video>, UpstreamError>>,
    comments: HashMap<ResourceKey, Result<Vec<Comment>, UpstreamError>>,
    replies: HashMap<(ResourceKey, Option<String>), Result<Page<Reply>, UpstreamError>>,
}

/// A scripted [`Upstream`].
#[derive(Default)]
pub struct MockUpstream {
    script: Mutex<Script>,
    calls: Mutex<Vec<(&'static str, String)>>,
    latency: Mutex<Option<Duration>>,
}

impl MockUpstream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delays every call by `latency`, so that concurrent callers overlap.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn set_search(&self, query: &str, members: BTreeSet<ResourceKey>) {
        let key = SearchKey::normalize(query).unwrap();
        self.script.lock().unwrap().searches.insert(key, Ok(members));
    }

    pub fn fail_search(&self, query: &str, error: UpstreamError) {
        let key = SearchKey::normalize(query).unwrap();
        self.script.lock().unwrap().searches.insert(key, Err(error));
    }

    pub fn add_channel(&self, channel: Channel) {
        let mut script = self.script.lock().unwrap();
        script.channels.insert(channel.id.clone(), Ok(channel));
    }

    pub fn fail_channel(&self, key: &str, error: UpstreamError) {
        let mut script = self.script.lock().unwrap();
        script.channels.insert(key.into(), Err(error));
    }

    pub fn set_videos(&self, channel: &str, videos: Vec<Video>) {
        let mut script = self.script.lock().unwrap();
        script.videos.insert(channel.into(), Ok(videos));
    }

    /// Fails the video listing of a channel on every page.
    pub fn fail_videos(&self, channel: &str, error: UpstreamError) {
        let mut script = self.script.lock().unwrap();
        script.videos.insert(channel.into(), Err(error));
    }

    pub fn set_comments(&self, video: &str, comments: Vec<Comment>) {
        let mut script = self.script.lock().unwrap();
        script.comments.insert(video.into(), Ok(comments));
    }

    pub fn fail_comments(&self, video: &str, error: UpstreamError) {
        let mut script = self.script.lock().unwrap();
        script.comments.insert(video.into(), Err(error));
    }

    pub fn set_replies(&self, comment: &str, page_token: Option<&str>, page: Page<Reply>) {
        let mut script = self.script.lock().unwrap();
        let key = (comment.into(), page_token.map(str::to_owned));
        script.replies.insert(key, Ok(page));
    }

    pub fn fail_replies(&self, comment: &str, page_token: Option<&str>, error: UpstreamError) {
        let mut script = self.script.lock().unwrap();
        let key = (comment.into(), page_token.map(str::to_owned));
        script.replies.insert(key, Err(error));
    }

    /// The number of calls of one kind, such as `"fetch_channel"`.
    pub fn calls(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, _)| *op == operation)
            .count()
    }

    /// The number of calls of one kind for one key.
    pub fn calls_for(&self, operation: &str, key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(op, k)| *op == operation && k == key)
            .count()
    }

    /// The total number of upstream calls.
    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    async fn record(&self, operation: &'static str, key: impl ToString) {
        self.calls
            .lock()
            .unwrap()
            .push((operation, key.to_string()));

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn not_found() -> UpstreamError {
    UpstreamError::Status {
        status: 404,
        reason: Some("notFound".into()),
        body: String::new(),
    }
}

#[async_trait]
impl Upstream for MockUpstream {
    async fn search_channels(
        &self,
        query: &SearchKey,
    ) -> Result<BTreeSet<ResourceKey>, UpstreamError> {
        self.record("search_channels", query).await;
        let script = self.script.lock().unwrap();
        script.searches.get(query).cloned().unwrap_or(Ok(BTreeSet::new()))
    }

    async fn fetch_channel(&self, key: &ResourceKey) -> Result<Channel, UpstreamError> {
        self.record("fetch_channel", key).await;
        let script = self.script.lock().unwrap();
        script.channels.get(key).cloned().unwrap_or(Err(not_found()))
    }

    async fn fetch_video_page(
        &self,
        channel: &Channel,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<Page<Video>, UpstreamError> {
        self.record("fetch_video_page", &channel.id).await;
        let script = self.script.lock().unwrap();
        let videos = match script.videos.get(&channel.id) {
            Some(Ok(videos)) => videos,
            Some(Err(error)) => return Err(error.clone()),
            None => return Ok(Page::default()),
        };

        let offset: usize = page_token.map_or(0, |token| token.parse().unwrap());
        let end = (offset + max_results).min(videos.len());
        Ok(Page {
            items: videos[offset.min(end)..end].to_vec(),
            next_page_token: (end < videos.len()).then(|| end.to_string()),
        })
    }

    async fn fetch_comments(
        &self,
        video: &Video,
        limit: usize,
    ) -> Result<Vec<Comment>, UpstreamError> {
        self.record("fetch_comments", &video.id).await;
        let script = self.script.lock().unwrap();
        match script.comments.get(&video.id) {
            Some(Ok(comments)) => Ok(comments.iter().take(limit).cloned().collect()),
            Some(Err(error)) => Err(error.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_replies(
        &self,
        comment: &ResourceKey,
        page_token: Option<&str>,
    ) -> Result<Page<Reply>, UpstreamError> {
        self.record("fetch_replies", comment).await;
        let script = self.script.lock().unwrap();
        let key = (comment.clone(), page_token.map(str::to_owned));
        script.replies.get(&key).cloned().unwrap_or(Ok(Page::default()))
    }
}

#[derive(Default)]
struct Tables {
    channels: BTreeMap<ResourceKey, Channel>,
    videos: BTreeMap<ResourceKey, Video>,
    comments: BTreeMap<ResourceKey, Comment>,
}

/// An in-memory [`Store`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following store call fail.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Stores a channel as is, including its local state.
    pub fn insert_channel(&self, channel: Channel) {
        let mut tables = self.tables.lock().unwrap();
        tables.channels.insert(channel.id.clone(), channel);
    }

    pub fn channel(&self, key: &str) -> Option<Channel> {
        self.tables.lock().unwrap().channels.get(key).cloned()
    }

    pub fn channel_keys(&self) -> BTreeSet<ResourceKey> {
        self.tables.lock().unwrap().channels.keys().cloned().collect()
    }

    /// The stored videos of a channel, by key.
    pub fn videos_of(&self, channel: &str) -> Vec<Video> {
        let tables = self.tables.lock().unwrap();
        tables
            .videos
            .values()
            .filter(|video| video.channel_id.as_str() == channel)
            .cloned()
            .collect()
    }

    /// The stored comments of a video, by key.
    pub fn comments_of(&self, video: &str) -> Vec<Comment> {
        let tables = self.tables.lock().unwrap();
        tables
            .comments
            .values()
            .filter(|comment| comment.video_id.as_str() == video)
            .cloned()
            .collect()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_channels(&self, channels: &[Channel]) -> anyhow::Result<()> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        for channel in channels {
            let mut channel = channel.clone();
            if let Some(stored) = tables.channels.get(&channel.id) {
                channel.search_count = stored.search_count;
            }
            tables.channels.insert(channel.id.clone(), channel);
        }
        Ok(())
    }

    async fn upsert_videos(&self, videos: &[Video]) -> anyhow::Result<()> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        for video in videos {
            tables.videos.insert(video.id.clone(), video.clone());
        }
        Ok(())
    }

    async fn upsert_comments(&self, comments: &[Comment]) -> anyhow::Result<()> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        for comment in comments {
            tables.comments.insert(comment.id.clone(), comment.clone());
        }
        Ok(())
    }

    async fn find_channel(&self, key: &ResourceKey) -> anyhow::Result<Option<Channel>> {
        self.check()?;
        Ok(self.tables.lock().unwrap().channels.get(key).cloned())
    }

    async fn find_channels(&self, keys: &[ResourceKey]) -> anyhow::Result<Vec<Channel>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let mut channels: Vec<_> = keys
            .iter()
            .filter_map(|key| tables.channels.get(key).cloned())
            .collect();
        channels.sort_by(|a, b| b.subscriber_count.cmp(&a.subscriber_count));
        Ok(channels)
    }

    async fn find_top_channels(
        &self,
        order: ChannelOrder,
        n: usize,
    ) -> anyhow::Result<Vec<Channel>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let mut channels: Vec<_> = tables.channels.values().cloned().collect();
        match order {
            ChannelOrder::SearchCount => {
                channels.sort_by(|a, b| b.search_count.cmp(&a.search_count))
            }
            ChannelOrder::SubscriberCount => {
                channels.sort_by(|a, b| b.subscriber_count.cmp(&a.subscriber_count))
            }
        }
        channels.truncate(n);
        Ok(channels)
    }

    async fn delete_channels(&self, keys: &[ResourceKey]) -> anyhow::Result<()> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        let Tables {
            channels,
            videos,
            comments,
        } = &mut *tables;

        for key in keys {
            channels.remove(key);
        }
        let deleted_videos: BTreeSet<_> = videos
            .values()
            .filter(|video| keys.contains(&video.channel_id))
            .map(|video| video.id.clone())
            .collect();
        videos.retain(|key, _| !deleted_videos.contains(key));
        comments.retain(|_, comment| !deleted_videos.contains(&comment.video_id));
        Ok(())
    }

    async fn increment_search_count(&self, key: &ResourceKey) -> anyhow::Result<bool> {
        self.check()?;
        let mut tables = self.tables.lock().unwrap();
        match tables.channels.get_mut(key) {
            Some(channel) => {
                channel.search_count += 1;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find_comments(
        &self,
        channel: &ResourceKey,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Comment>> {
        self.check()?;
        let tables = self.tables.lock().unwrap();
        let mut comments: Vec<_> = tables
            .comments
            .values()
            .filter(|comment| {
                tables
                    .videos
                    .get(&comment.video_id)
                    .is_some_and(|video| &video.channel_id == channel)
            })
            .cloned()
            .collect();
        comments.sort_by(|a, b| b.like_count.cmp(&a.like_count));
        Ok(comments.into_iter().skip(offset).take(limit).collect())
    }
}
