use std::time::Duration;

use channelsync_service::enrichment::EnrichmentLevel;
use channelsync_service::error::SyncError;
use channelsync_service::upstream::UpstreamError;
use channelsync_test as test;

use crate::setup_service;

#[tokio::test]
async fn test_search_stores_channels() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.set_search("cat", test::keys(&["UC1", "UC2"]));
    upstream.add_channel(test::channel("UC1", 10));
    upstream.add_channel(test::channel("UC2", 500));
    upstream.set_videos("UC1", test::videos("UC1", 3));

    let channels = sync.search_channels("  Cat ").await.unwrap();
    let found: Vec<_> = channels.iter().map(|channel| channel.id.as_str()).collect();
    assert_eq!(found, ["UC2", "UC1"]);

    // search results only get the channel record itself
    let channel = store.channel("UC1").unwrap();
    assert_eq!(channel.enrichment, EnrichmentLevel::None);
    assert_eq!(channel.last_synced_at, None);
    assert_eq!(upstream.calls("fetch_video_page"), 0);
}

#[tokio::test]
async fn test_search_is_cached() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.set_search("cat", test::keys(&["UC1"]));
    upstream.add_channel(test::channel("UC1", 10));

    let first = sync.resolve_search("cat").await.unwrap();
    let second = sync.resolve_search("CAT").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(upstream.calls("search_channels"), 1);
    assert_eq!(upstream.calls("fetch_channel"), 1);
}

#[tokio::test]
async fn test_similar_search_is_reused() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.set_search("cat", test::keys(&["UC1"]));
    upstream.set_search("cats", test::keys(&["UC2"]));
    upstream.set_search("dog", test::keys(&["UC3"]));
    for key in ["UC1", "UC2", "UC3"] {
        upstream.add_channel(test::channel(key, 10));
    }

    assert_eq!(sync.resolve_search("cat").await, Ok(test::keys(&["UC1"])));
    assert_eq!(sync.resolve_search("cats").await, Ok(test::keys(&["UC1"])));
    assert_eq!(upstream.calls("search_channels"), 1);

    assert_eq!(sync.resolve_search("dog").await, Ok(test::keys(&["UC3"])));
    assert_eq!(upstream.calls("search_channels"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_search_is_reconciled() {
    let (sync, upstream, store) = setup_service(|config| {
        config.search_staleness = Duration::from_secs(3600);
    });

    for key in ["UC1", "UC2", "UC3"] {
        upstream.add_channel(test::channel(key, 10));
    }
    upstream.set_search("cat", test::keys(&["UC1", "UC2"]));
    sync.resolve_search("cat").await.unwrap();
    assert_eq!(store.channel_keys(), test::keys(&["UC1", "UC2"]));

    upstream.set_search("cat", test::keys(&["UC2", "UC3"]));

    tokio::time::advance(Duration::from_secs(3599)).await;
    assert_eq!(
        sync.resolve_search("cat").await,
        Ok(test::keys(&["UC1", "UC2"]))
    );
    assert_eq!(upstream.calls("search_channels"), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(
        sync.resolve_search("cat").await,
        Ok(test::keys(&["UC2", "UC3"]))
    );
    assert_eq!(upstream.calls("search_channels"), 2);
    assert_eq!(store.channel_keys(), test::keys(&["UC2", "UC3"]));
    // UC2 was known already and is not fetched again
    assert_eq!(upstream.calls_for("fetch_channel", "UC2"), 1);
}

#[tokio::test]
async fn test_search_keeps_enriched_channels() {
    let (sync, upstream, store) = setup_service(|_| ());

    let mut enriched = test::channel("UC1", 10);
    enriched.enrichment = EnrichmentLevel::Extended;
    store.insert_channel(enriched);

    upstream.set_search("cat", test::keys(&["UC1"]));
    upstream.add_channel(test::channel("UC1", 10));

    sync.resolve_search("cat").await.unwrap();
    assert_eq!(
        store.channel("UC1").unwrap().enrichment,
        EnrichmentLevel::Extended
    );
    assert_eq!(upstream.calls("fetch_channel"), 0);
}

#[tokio::test]
async fn test_vanished_search_result_is_skipped() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.set_search("cat", test::keys(&["UC1", "UC404"]));
    upstream.add_channel(test::channel("UC1", 10));

    let channels = sync.search_channels("cat").await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(store.channel_keys(), test::keys(&["UC1"]));
}

#[tokio::test]
async fn test_empty_query() {
    let (sync, upstream, _store) = setup_service(|_| ());

    assert_eq!(
        sync.resolve_search(" \t ").await,
        Err(SyncError::InvalidQuery(" \t ".into()))
    );
    assert_eq!(upstream.total_calls(), 0);
}

#[tokio::test]
async fn test_rate_limited_search_is_not_cached() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.fail_search("cat", UpstreamError::status(403, "quotaExceeded"));
    assert_eq!(
        sync.resolve_search("cat").await,
        Err(SyncError::RateLimited)
    );

    upstream.set_search("cat", test::keys(&["UC1"]));
    upstream.add_channel(test::channel("UC1", 10));
    assert_eq!(sync.resolve_search("cat").await, Ok(test::keys(&["UC1"])));
    assert_eq!(upstream.calls("search_channels"), 2);
}

#[tokio::test]
async fn test_concurrent_searches_share_one_call() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.set_latency(Duration::from_millis(20));
    upstream.set_search("cat", test::keys(&["UC1"]));
    upstream.add_channel(test::channel("UC1", 10));

    let searches = (0..5).map(|_| sync.resolve_search("cat"));
    for result in futures::future::join_all(searches).await {
        assert_eq!(result, Ok(test::keys(&["UC1"])));
    }
    assert_eq!(upstream.calls("search_channels"), 1);
    assert_eq!(upstream.calls("fetch_channel"), 1);
}

#[tokio::test]
async fn test_evict_search() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.set_search("cat", test::keys(&["UC1"]));
    upstream.add_channel(test::channel("UC1", 10));

    sync.resolve_search("cat").await.unwrap();
    sync.evict_search("Cat");
    sync.resolve_search("cat").await.unwrap();
    assert_eq!(upstream.calls("search_channels"), 2);
}
