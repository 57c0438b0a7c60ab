//! The sync orchestrator.
//!
//! [`ChannelSync`] decides for every request whether local data can be served as is, and
//! otherwise runs a single shared refresh against the upstream API:
//!
//! 1. fetch the channel record and upsert it,
//! 2. fetch up to the target depth of recent videos and upsert them,
//! 3. fetch the top comments of every video and upsert them,
//! 4. raise the channel's enrichment level to the target and stamp its sync time.
//!
//! A refresh that fails part way leaves everything it already wrote in place, but never
//! advances the enrichment level. The level is what tells whether a channel is fresh.
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::classify::Classifier;
use crate::config::SyncConfig;
use crate::cooldown::CooldownGate;
use crate::enrichment::EnrichmentLevel;
use crate::error::{Operation, SyncError};
use crate::search_cache::{MemberSource, Reconciliation, SearchCache};
use crate::singleflight::SingleFlight;
use crate::store::Store;
use crate::types::{Channel, ChannelOrder, Comment, Page, Reply, ResourceKey, SearchKey};
use crate::upstream::Upstream;

/// The result of a single channel refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// The channel was synced and is now at the given level.
    Synced(EnrichmentLevel),
    /// The channel does not exist upstream.
    Missing,
}

/// The result of [`ChannelSync::refresh_top_channels`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Channels that were refreshed successfully, in batch order.
    pub refreshed: Vec<ResourceKey>,
    /// Channels whose refresh failed, with the reason.
    pub failed: Vec<(ResourceKey, SyncError)>,
}

impl BatchReport {
    /// Whether the batch was cut short by the upstream quota.
    pub fn is_rate_limited(&self) -> bool {
        self.failed
            .last()
            .is_some_and(|(_, error)| error.is_throttling())
    }
}

type ReplyCache = moka::future::Cache<(ResourceKey, Option<String>), Page<Reply>>;

/// Keeps channels, videos and comments in the local [`Store`] in sync with the [`Upstream`].
///
/// Cloning is cheap, all clones share the same in-flight refreshes and caches.
#[derive(Clone)]
pub struct ChannelSync {
    config: Arc<SyncConfig>,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn Store>,
    classifier: Arc<Classifier>,
    channel_flights: SingleFlight<ResourceKey, Result<ChannelOutcome, SyncError>>,
    search_flights: SingleFlight<SearchKey, Result<BTreeSet<ResourceKey>, SyncError>>,
    searches: Arc<SearchCache>,
    cooldown: Arc<CooldownGate>,
    replies: ReplyCache,
}

impl fmt::Debug for ChannelSync {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSync")
            .field("config", &self.config)
            .field("channel_flights", &self.channel_flights)
            .field("search_flights", &self.search_flights)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl ChannelSync {
    /// Creates the orchestrator and starts its background cooldown sweeper.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime, or if the cooldown sweep interval is zero.
    /// [`SyncConfig::validate`] rejects the latter up front.
    pub fn new(config: SyncConfig, upstream: Arc<dyn Upstream>, store: Arc<dyn Store>) -> Self {
        let cooldown = CooldownGate::start(config.cooldown_window, config.cooldown_sweep_interval);
        let replies = moka::future::Cache::builder()
            .max_capacity(config.replies_capacity)
            .name("replies")
            .time_to_live(config.replies_ttl)
            .build();

        Self {
            classifier: Arc::new(Classifier::new(config.skippable_denials.iter().cloned())),
            channel_flights: SingleFlight::new("channel"),
            search_flights: SingleFlight::new("search"),
            searches: Arc::new(SearchCache::new(config.search_staleness)),
            cooldown,
            replies,
            config: Arc::new(config),
            upstream,
            store,
        }
    }

    /// Makes sure a channel is synced to at least `target`, refreshing it if needed.
    ///
    /// A refresh is needed if the channel is unknown, below `target`, or older than the
    /// configured maximum age. Concurrent callers for one channel share a single refresh.
    ///
    /// Returns the level the channel is at afterwards.
    pub async fn ensure_fresh(
        &self,
        key: &ResourceKey,
        target: EnrichmentLevel,
    ) -> Result<EnrichmentLevel, SyncError> {
        loop {
            if let Some(channel) = self.store.find_channel(key).await? {
                if !self.needs_refresh(&channel, target) {
                    return Ok(channel.enrichment);
                }
            }

            match self.run_refresh(key, target).await? {
                (ChannelOutcome::Missing, _) => return Err(SyncError::not_found(key)),
                (ChannelOutcome::Synced(level), true) => return Ok(level),
                // We joined a refresh that was already running. It may have aimed lower or
                // been a parent-only pass that does not renew the sync time, so check again.
                (ChannelOutcome::Synced(level), false) => {
                    tracing::debug!(channel = %key, %level, %target, "Joined a running sync");
                }
            }
        }
    }

    /// Refreshes a channel to `target`, regardless of how fresh it is.
    ///
    /// Joins a refresh of the channel that is already running, unless that one aims lower.
    pub async fn refresh(
        &self,
        key: &ResourceKey,
        target: EnrichmentLevel,
    ) -> Result<EnrichmentLevel, SyncError> {
        loop {
            match self.run_refresh(key, target).await? {
                (ChannelOutcome::Missing, _) => return Err(SyncError::not_found(key)),
                (ChannelOutcome::Synced(level), started)
                    if started || !level.is_below(target) =>
                {
                    return Ok(level);
                }
                (ChannelOutcome::Synced(_), _) => continue,
            }
        }
    }

    /// Resolves a search query to the keys of the matching channels.
    ///
    /// Served from the search cache where possible. Concurrent searches for the same
    /// normalized query share one resolution.
    pub async fn resolve_search(&self, query: &str) -> Result<BTreeSet<ResourceKey>, SyncError> {
        let key =
            SearchKey::normalize(query).ok_or_else(|| SyncError::InvalidQuery(query.to_owned()))?;

        let this = self.clone();
        let flight_key = key.clone();
        let resolution = self.search_flights.run_once(key, async move {
            let source = SearchMembers(&this);
            let (members, _) = this.searches.resolve(&flight_key, &source).await?;
            Ok(members)
        });

        resolution.await.unwrap_or_else(|canceled| {
            tracing::error!(search = query, "Search resolution was dropped");
            Err(SyncError::from_std_error(canceled))
        })
    }

    /// Searches for channels, largest first.
    pub async fn search_channels(&self, query: &str) -> Result<Vec<Channel>, SyncError> {
        let members = self.resolve_search(query).await?;
        let keys: Vec<_> = members.into_iter().collect();
        Ok(self.store.find_channels(&keys).await?)
    }

    /// Drops the cached result of a search query.
    pub fn evict_search(&self, query: &str) {
        if let Some(key) = SearchKey::normalize(query) {
            self.searches.evict(&key);
        }
    }

    /// Whether `actor` may bump a counter of `key` now. At most once per cooldown window.
    pub fn allow_counter_increment(&self, actor: &str, key: &ResourceKey) -> bool {
        self.cooldown.allow(actor, key)
    }

    /// Counts a view of a channel by `actor`, unless the actor viewed it recently.
    ///
    /// Views of channels that are not stored yet are not counted and do not start a cooldown.
    /// Returns whether the view was counted.
    pub async fn record_view(&self, actor: &str, key: &ResourceKey) -> Result<bool, SyncError> {
        if self.store.find_channel(key).await?.is_none() {
            tracing::debug!(channel = %key, "Not counting view of unknown channel");
            return Ok(false);
        }
        if !self.allow_counter_increment(actor, key) {
            return Ok(false);
        }
        Ok(self.store.increment_search_count(key).await?)
    }

    /// A page of a channel's comments, most liked first, after syncing it to `target`.
    pub async fn comments(
        &self,
        key: &ResourceKey,
        target: EnrichmentLevel,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Comment>, SyncError> {
        self.ensure_fresh(key, target).await?;
        Ok(self.store.find_comments(key, offset, limit).await?)
    }

    /// A page of replies to a comment.
    ///
    /// Pages are kept in memory for a while. Identical concurrent requests share one upstream
    /// call, failures are not kept.
    pub async fn replies(
        &self,
        comment: &ResourceKey,
        page_token: Option<&str>,
    ) -> Result<Page<Reply>, SyncError> {
        let cache_key = (comment.clone(), page_token.map(str::to_owned));
        let page = self
            .replies
            .try_get_with(cache_key, async {
                let result = self.upstream.fetch_replies(comment, page_token).await;
                self.classifier
                    .record(result, comment, Operation::FetchReplies)
                    .map(Option::unwrap_or_default)
            })
            .await;

        page.map_err(|error| SyncError::clone(&error))
    }

    /// Refreshes the first `n` stored channels by `order` to `target`, one after another.
    ///
    /// Failures of single channels are collected and the batch continues, except when the
    /// upstream quota runs out. Then the batch stops right away.
    pub async fn refresh_top_channels(
        &self,
        order: ChannelOrder,
        n: usize,
        target: EnrichmentLevel,
    ) -> Result<BatchReport, SyncError> {
        let channels = self.store.find_top_channels(order, n).await?;
        tracing::info!(channels = channels.len(), ?order, %target, "Refreshing top channels");

        let mut report = BatchReport::default();
        for channel in channels {
            match self.refresh(&channel.id, target).await {
                Ok(_) => report.refreshed.push(channel.id),
                Err(error) => {
                    let throttled = error.is_throttling();
                    report.failed.push((channel.id, error));
                    if throttled {
                        tracing::warn!(
                            refreshed = report.refreshed.len(),
                            "Stopping batch refresh, upstream quota exhausted"
                        );
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    /// The first `n` stored channels by `order`.
    pub async fn top_channels(
        &self,
        order: ChannelOrder,
        n: usize,
    ) -> Result<Vec<Channel>, SyncError> {
        Ok(self.store.find_top_channels(order, n).await?)
    }

    /// Stops background work. Refreshes that are still running complete on their own.
    pub fn shutdown(&self) {
        self.cooldown.shutdown();
    }

    fn needs_refresh(&self, channel: &Channel, target: EnrichmentLevel) -> bool {
        if channel.enrichment.is_below(target) {
            return true;
        }

        match (self.config.channel_max_age, channel.last_synced_at) {
            (Some(max_age), Some(synced_at)) => Utc::now()
                .signed_duration_since(synced_at)
                .to_std()
                .is_ok_and(|age| age > max_age),
            _ => false,
        }
    }

    /// Joins or starts the refresh of a channel.
    ///
    /// Also returns whether this call started the refresh, in which case it ran to `target`.
    async fn run_refresh(
        &self,
        key: &ResourceKey,
        target: EnrichmentLevel,
    ) -> Result<(ChannelOutcome, bool), SyncError> {
        let this = self.clone();
        let flight_key = key.clone();
        let (started, refresh) = self
            .channel_flights
            .run_or_join(key.clone(), async move { this.sync_channel(flight_key, target).await });

        let outcome = refresh.await.unwrap_or_else(|canceled| {
            tracing::error!(channel = %key, "Channel sync was dropped");
            Err(SyncError::from_std_error(canceled))
        })?;
        Ok((outcome, started))
    }

    async fn sync_channel(
        self,
        key: ResourceKey,
        target: EnrichmentLevel,
    ) -> Result<ChannelOutcome, SyncError> {
        let start = Instant::now();
        tracing::debug!(channel = %key, %target, "Syncing channel");

        let result = self.sync_channel_inner(&key, target).await;

        let duration = start.elapsed();
        metric!(timer("sync.duration") = duration, "level" => target.as_str());
        match &result {
            Ok(outcome) => tracing::info!(
                channel = %key,
                %target,
                ?outcome,
                duration = %humantime::format_duration(duration),
                "Synced channel"
            ),
            Err(error) => tracing::warn!(
                channel = %key,
                %target,
                %error,
                duration = %humantime::format_duration(duration),
                "Failed to sync channel"
            ),
        }

        result
    }

    async fn sync_channel_inner(
        &self,
        key: &ResourceKey,
        target: EnrichmentLevel,
    ) -> Result<ChannelOutcome, SyncError> {
        let depth = self.config.depths.for_target(target);

        let fetched = self.upstream.fetch_channel(key).await;
        let Some(mut channel) = self
            .classifier
            .record(fetched, key, Operation::FetchChannel)?
        else {
            return Ok(ChannelOutcome::Missing);
        };

        if let Some(stored) = self.store.find_channel(key).await? {
            channel.merge_local_state(&stored);
        }
        self.store
            .upsert_channels(std::slice::from_ref(&channel))
            .await?;

        if depth.videos > 0 {
            let videos = self.upstream.fetch_videos(&channel, depth.videos).await;
            let videos = self
                .classifier
                .container(videos, key, Operation::FetchVideos)?;
            self.store.upsert_videos(&videos).await?;
            metric!(histogram("sync.videos") = videos.len() as u64, "level" => target.as_str());
            tracing::trace!(channel = %key, videos = videos.len(), "Stored videos");

            if depth.comments_per_video > 0 {
                for video in &videos {
                    let comments = self
                        .upstream
                        .fetch_comments(video, depth.comments_per_video)
                        .await;
                    let comments =
                        self.classifier
                            .child_item(comments, &video.id, Operation::FetchComments)?;
                    if !comments.is_empty() {
                        self.store.upsert_comments(&comments).await?;
                    }
                }
            }
        }

        // A parent-only pass says nothing about the children, so it must not look like a sync.
        if target > EnrichmentLevel::None {
            channel.enrichment.advance_to(target);
            channel.last_synced_at = Some(Utc::now());
            self.store
                .upsert_channels(std::slice::from_ref(&channel))
                .await?;
        }

        Ok(ChannelOutcome::Synced(channel.enrichment))
    }
}

/// Feeds the search cache from the upstream and applies member changes to the store.
struct SearchMembers<'a>(&'a ChannelSync);

#[async_trait]
impl MemberSource for SearchMembers<'_> {
    async fn fetch(&self, key: &SearchKey) -> Result<BTreeSet<ResourceKey>, SyncError> {
        let result = self.0.upstream.search_channels(key).await;
        let members = self.0.classifier.record(result, key, Operation::Search)?;
        Ok(members.unwrap_or_default())
    }

    async fn reconcile(&self, change: &Reconciliation) -> Result<(), SyncError> {
        let sync = self.0;

        if !change.removed.is_empty() {
            let removed: Vec<_> = change.removed.iter().cloned().collect();
            sync.store.delete_channels(&removed).await?;
        }

        for key in &change.added {
            if sync.store.find_channel(key).await?.is_some() {
                continue;
            }
            // through the channel flight, so this never races a deeper sync of the same channel
            let (outcome, _) = sync.run_refresh(key, EnrichmentLevel::None).await?;
            if outcome == ChannelOutcome::Missing {
                tracing::debug!(channel = %key, "Search result vanished upstream");
            }
        }

        Ok(())
    }
}
