//! Cached search results with a staleness horizon and fuzzy key reuse.
//!
//! Every search key maps to the set of channel keys it found. An entry is served as is until
//! it is older than the staleness horizon, then refreshed by diffing it against a new upstream
//! result. A query that has no entry of its own may reuse the entry of a similar query, so
//! typos and plurals do not each cost upstream quota.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::SyncError;
use crate::similarity;
use crate::types::{ResourceKey, SearchKey};

/// The difference between a cached member set and a freshly fetched one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Members that are no longer part of the result.
    pub removed: BTreeSet<ResourceKey>,
    /// Members that are new to the result.
    pub added: BTreeSet<ResourceKey>,
}

impl Reconciliation {
    pub fn between(old: &BTreeSet<ResourceKey>, new: &BTreeSet<ResourceKey>) -> Self {
        Self {
            removed: old.difference(new).cloned().collect(),
            added: new.difference(old).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Where cache misses and refreshes get their data from.
#[async_trait]
pub trait MemberSource: Send + Sync {
    /// Fetches the current member set of a search.
    async fn fetch(&self, key: &SearchKey) -> Result<BTreeSet<ResourceKey>, SyncError>;

    /// Applies a member change, for example by deleting removed and persisting added members.
    async fn reconcile(&self, change: &Reconciliation) -> Result<(), SyncError>;
}

#[derive(Debug)]
struct CacheEntry {
    members: BTreeSet<ResourceKey>,
    last_refreshed_at: Instant,
}

/// How a search was answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The exact entry was fresh.
    Hit,
    /// The entry of a similar key was reused.
    Similar(SearchKey),
    /// A new entry was created.
    Miss,
    /// The exact entry was stale and has been reconciled.
    Refreshed,
}

impl Resolution {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Hit => "hit",
            Self::Similar(_) => "similar",
            Self::Miss => "miss",
            Self::Refreshed => "refresh",
        }
    }
}

/// The search result cache.
///
/// Entries are never evicted on their own, only replaced by refreshes or removed through
/// [`evict`](Self::evict). Writers of one key must be serialized by the caller.
#[derive(Debug)]
pub struct SearchCache {
    staleness: Duration,
    entries: moka::sync::Cache<SearchKey, Arc<CacheEntry>>,
}

impl SearchCache {
    /// Creates an empty cache whose entries are refreshed once they are `staleness` old.
    pub fn new(staleness: Duration) -> Self {
        Self {
            staleness,
            entries: moka::sync::Cache::builder().name("search").build(),
        }
    }

    /// Resolves a search key to its member set.
    ///
    /// A failed fetch or reconciliation leaves the cache untouched.
    pub async fn resolve(
        &self,
        key: &SearchKey,
        source: &dyn MemberSource,
    ) -> Result<(BTreeSet<ResourceKey>, Resolution), SyncError> {
        let (members, resolution) = match self.entries.get(key) {
            Some(entry) if entry.last_refreshed_at.elapsed() < self.staleness => {
                (entry.members.clone(), Resolution::Hit)
            }
            Some(entry) => {
                let members = source.fetch(key).await?;
                let change = Reconciliation::between(&entry.members, &members);
                tracing::debug!(
                    search = %key,
                    removed = change.removed.len(),
                    added = change.added.len(),
                    "Reconciling stale search entry"
                );
                source.reconcile(&change).await?;
                self.insert(key, members.clone());
                (members, Resolution::Refreshed)
            }
            None => match self.find_similar(key) {
                Some((similar, entry)) => (entry.members.clone(), Resolution::Similar(similar)),
                None => {
                    let members = source.fetch(key).await?;
                    let change = Reconciliation::between(&BTreeSet::new(), &members);
                    source.reconcile(&change).await?;
                    self.insert(key, members.clone());
                    (members, Resolution::Miss)
                }
            },
        };

        metric!(counter(&format!("search.{}", resolution.as_str())) += 1);
        tracing::trace!(search = %key, resolution = ?resolution, "Resolved search");
        Ok((members, resolution))
    }

    /// Drops the entry of a search key.
    pub fn evict(&self, key: &SearchKey) {
        self.entries.invalidate(key);
    }

    /// The cached members of exactly this key, regardless of staleness.
    pub fn peek(&self, key: &SearchKey) -> Option<BTreeSet<ResourceKey>> {
        self.entries.get(key).map(|entry| entry.members.clone())
    }

    fn insert(&self, key: &SearchKey, members: BTreeSet<ResourceKey>) {
        let entry = CacheEntry {
            members,
            last_refreshed_at: Instant::now(),
        };
        self.entries.insert(key.clone(), Arc::new(entry));
    }

    /// The entry of the most similar cached key. Ties go to the smallest key.
    fn find_similar(&self, key: &SearchKey) -> Option<(SearchKey, Arc<CacheEntry>)> {
        let keys: BTreeSet<SearchKey> = self.entries.iter().map(|(k, _)| (*k).clone()).collect();
        let similar = similarity::most_similar(key.as_str(), keys.iter().map(SearchKey::as_str))?;
        let similar = keys.get(similar)?.clone();
        let entry = self.entries.get(&similar)?;
        Some((similar, entry))
    }
}
