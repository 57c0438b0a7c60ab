use std::time::Duration;

use chrono::Utc;

use channelsync_service::enrichment::{EnrichmentLevel, SyncDepth};
use channelsync_service::error::{Operation, SyncError};
use channelsync_service::upstream::UpstreamError;
use channelsync_test as test;

use crate::setup_service;

#[tokio::test]
async fn test_basic_sync() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 40));
    for video in test::videos("UC1", 40) {
        upstream.set_comments(video.id.as_str(), test::comments(video.id.as_str(), 35));
    }

    let level = sync
        .ensure_fresh(&"UC1".into(), EnrichmentLevel::Basic)
        .await;
    assert_eq!(level, Ok(EnrichmentLevel::Basic));

    let channel = store.channel("UC1").unwrap();
    assert_eq!(channel.enrichment, EnrichmentLevel::Basic);
    assert!(channel.last_synced_at.is_some());

    let videos = store.videos_of("UC1");
    assert_eq!(videos.len(), 33);
    for video in &videos {
        assert_eq!(store.comments_of(video.id.as_str()).len(), 30);
    }

    assert_eq!(upstream.calls("fetch_channel"), 1);
    assert_eq!(upstream.calls("fetch_video_page"), 1);
    assert_eq!(upstream.calls("fetch_comments"), 33);
}

#[tokio::test]
async fn test_fresh_channel_is_served_locally() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 3));

    let key = "UC1".into();
    sync.ensure_fresh(&key, EnrichmentLevel::Basic).await.unwrap();
    let calls = upstream.total_calls();

    assert_eq!(
        sync.ensure_fresh(&key, EnrichmentLevel::Basic).await,
        Ok(EnrichmentLevel::Basic)
    );
    assert_eq!(
        sync.ensure_fresh(&key, EnrichmentLevel::None).await,
        Ok(EnrichmentLevel::Basic)
    );
    assert_eq!(upstream.total_calls(), calls);
}

#[tokio::test]
async fn test_extended_sync_pages_through_videos() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 120));

    let key = "UC1".into();
    sync.ensure_fresh(&key, EnrichmentLevel::Basic).await.unwrap();
    assert_eq!(store.videos_of("UC1").len(), 33);

    assert_eq!(
        sync.ensure_fresh(&key, EnrichmentLevel::Extended).await,
        Ok(EnrichmentLevel::Extended)
    );
    assert_eq!(store.videos_of("UC1").len(), 100);
    // one page for the basic sync, two pages of 50 for the extended one
    assert_eq!(upstream.calls("fetch_video_page"), 3);

    // an extended channel is fresh for basic requests as well
    let calls = upstream.total_calls();
    assert_eq!(
        sync.ensure_fresh(&key, EnrichmentLevel::Basic).await,
        Ok(EnrichmentLevel::Extended)
    );
    assert_eq!(upstream.total_calls(), calls);
}

#[tokio::test]
async fn test_enrichment_never_downgrades() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 5));

    let key = "UC1".into();
    sync.ensure_fresh(&key, EnrichmentLevel::Extended).await.unwrap();

    assert_eq!(
        sync.refresh(&key, EnrichmentLevel::Basic).await,
        Ok(EnrichmentLevel::Extended)
    );
    assert_eq!(
        sync.refresh(&key, EnrichmentLevel::None).await,
        Ok(EnrichmentLevel::Extended)
    );
    assert_eq!(
        store.channel("UC1").unwrap().enrichment,
        EnrichmentLevel::Extended
    );
    assert_eq!(upstream.calls("fetch_channel"), 3);
}

#[tokio::test]
async fn test_skip_on_disabled_comments() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 3));
    upstream.set_comments("UC1-v0", test::comments("UC1-v0", 5));
    upstream.fail_comments("UC1-v1", UpstreamError::status(403, "commentsDisabled"));
    upstream.set_comments("UC1-v2", test::comments("UC1-v2", 5));

    let level = sync
        .ensure_fresh(&"UC1".into(), EnrichmentLevel::Basic)
        .await;
    assert_eq!(level, Ok(EnrichmentLevel::Basic));

    assert_eq!(store.videos_of("UC1").len(), 3);
    assert_eq!(store.comments_of("UC1-v0").len(), 5);
    assert_eq!(store.comments_of("UC1-v1").len(), 0);
    assert_eq!(store.comments_of("UC1-v2").len(), 5);
    assert_eq!(
        store.channel("UC1").unwrap().enrichment,
        EnrichmentLevel::Basic
    );
}

#[tokio::test]
async fn test_abort_on_quota() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 3));
    upstream.set_comments("UC1-v0", test::comments("UC1-v0", 5));
    upstream.fail_comments("UC1-v1", UpstreamError::status(403, "quotaExceeded"));
    upstream.set_comments("UC1-v2", test::comments("UC1-v2", 5));

    let level = sync
        .ensure_fresh(&"UC1".into(), EnrichmentLevel::Basic)
        .await;
    assert_eq!(level, Err(SyncError::RateLimited));
    assert!(level.unwrap_err().is_throttling());

    // the rest of the batch was not even attempted
    assert_eq!(upstream.calls_for("fetch_comments", "UC1-v1"), 1);
    assert_eq!(upstream.calls_for("fetch_comments", "UC1-v2"), 0);

    // what was written stays, but the channel does not count as synced
    assert_eq!(store.videos_of("UC1").len(), 3);
    assert_eq!(store.comments_of("UC1-v0").len(), 5);
    let channel = store.channel("UC1").unwrap();
    assert_eq!(channel.enrichment, EnrichmentLevel::None);
    assert_eq!(channel.last_synced_at, None);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_sync() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.set_latency(Duration::from_millis(20));
    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 3));

    let key = "UC1".into();
    let requests = (0..10).map(|_| sync.ensure_fresh(&key, EnrichmentLevel::Basic));
    let results = futures::future::join_all(requests).await;

    for result in results {
        assert_eq!(result, Ok(EnrichmentLevel::Basic));
    }
    assert_eq!(upstream.calls("fetch_channel"), 1);
    assert_eq!(upstream.calls("fetch_comments"), 3);
    assert_eq!(store.videos_of("UC1").len(), 3);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_failure() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.set_latency(Duration::from_millis(20));
    upstream.fail_channel("UC1", UpstreamError::Transport("connection reset".into()));

    let key = "UC1".into();
    let (first, second) = futures::join!(
        sync.ensure_fresh(&key, EnrichmentLevel::Basic),
        sync.ensure_fresh(&key, EnrichmentLevel::Basic),
    );

    assert!(matches!(
        first,
        Err(SyncError::UpstreamFailure {
            operation: Operation::FetchChannel,
            ..
        })
    ));
    assert_eq!(first, second);
    assert_eq!(upstream.calls("fetch_channel"), 1);
}

#[tokio::test]
async fn test_joining_shallower_sync_goes_deeper() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.set_latency(Duration::from_millis(20));
    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 3));

    let key = "UC1".into();
    let (shallow, deep) = futures::join!(sync.refresh(&key, EnrichmentLevel::None), async {
        tokio::task::yield_now().await;
        sync.ensure_fresh(&key, EnrichmentLevel::Basic).await
    });

    assert_eq!(shallow, Ok(EnrichmentLevel::None));
    assert_eq!(deep, Ok(EnrichmentLevel::Basic));
    assert_eq!(upstream.calls("fetch_channel"), 2);
    assert_eq!(
        store.channel("UC1").unwrap().enrichment,
        EnrichmentLevel::Basic
    );
}

#[tokio::test]
async fn test_joining_parent_only_pass_still_resyncs_outdated() {
    let (sync, upstream, store) = setup_service(|config| {
        config.channel_max_age = Some(Duration::from_secs(3600));
    });

    let mut outdated = test::channel("UC1", 1000);
    outdated.enrichment = EnrichmentLevel::Basic;
    outdated.last_synced_at = Some(Utc::now() - chrono::Duration::hours(2));
    store.insert_channel(outdated);

    upstream.set_latency(Duration::from_millis(20));
    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 3));

    let key = "UC1".into();
    let (shallow, deep) = futures::join!(sync.refresh(&key, EnrichmentLevel::None), async {
        tokio::task::yield_now().await;
        sync.ensure_fresh(&key, EnrichmentLevel::Basic).await
    });

    assert_eq!(shallow, Ok(EnrichmentLevel::Basic));
    assert_eq!(deep, Ok(EnrichmentLevel::Basic));
    // the parent-only pass does not renew the sync time, so a full sync followed it
    assert_eq!(upstream.calls("fetch_channel"), 2);
    assert_eq!(upstream.calls("fetch_video_page"), 1);
    let synced_at = store.channel("UC1").unwrap().last_synced_at.unwrap();
    assert!(Utc::now() - synced_at < chrono::Duration::minutes(1));
}

#[tokio::test]
async fn test_failure_is_not_cached() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.fail_channel("UC1", UpstreamError::from_response(503, ""));

    let key = "UC1".into();
    let failed = sync.ensure_fresh(&key, EnrichmentLevel::Basic).await;
    assert_eq!(
        failed,
        Err(SyncError::UpstreamFailure {
            resource: "UC1".into(),
            operation: Operation::FetchChannel,
            details: "upstream responded with 503: no reason".into(),
        })
    );

    upstream.add_channel(test::channel("UC1", 1000));
    assert_eq!(
        sync.ensure_fresh(&key, EnrichmentLevel::Basic).await,
        Ok(EnrichmentLevel::Basic)
    );
    assert_eq!(upstream.calls("fetch_channel"), 2);
}

#[tokio::test]
async fn test_missing_channel() {
    let (sync, _upstream, store) = setup_service(|_| ());

    let result = sync
        .ensure_fresh(&"UC404".into(), EnrichmentLevel::Basic)
        .await;
    assert_eq!(
        result,
        Err(SyncError::UpstreamFailure {
            resource: "UC404".into(),
            operation: Operation::FetchChannel,
            details: "not found".into(),
        })
    );
    assert!(store.channel("UC404").is_none());
}

#[tokio::test]
async fn test_missing_videos_are_empty() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.fail_videos("UC1", UpstreamError::status(404, "playlistNotFound"));

    let level = sync
        .ensure_fresh(&"UC1".into(), EnrichmentLevel::Basic)
        .await;
    assert_eq!(level, Ok(EnrichmentLevel::Basic));
    assert!(store.videos_of("UC1").is_empty());
    assert_eq!(upstream.calls("fetch_comments"), 0);
}

#[tokio::test]
async fn test_custom_depths() {
    let (sync, upstream, store) = setup_service(|config| {
        config.depths.basic = SyncDepth {
            videos: 2,
            comments_per_video: 1,
        };
    });

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 5));
    upstream.set_comments("UC1-v0", test::comments("UC1-v0", 5));

    sync.ensure_fresh(&"UC1".into(), EnrichmentLevel::Basic)
        .await
        .unwrap();
    assert_eq!(store.videos_of("UC1").len(), 2);
    assert_eq!(store.comments_of("UC1-v0").len(), 1);
}

#[tokio::test]
async fn test_outdated_channel_is_synced_again() {
    let (sync, upstream, store) = setup_service(|config| {
        config.channel_max_age = Some(Duration::from_secs(3600));
    });

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.add_channel(test::channel("UC2", 1000));

    let mut outdated = test::channel("UC1", 1000);
    outdated.enrichment = EnrichmentLevel::Basic;
    outdated.last_synced_at = Some(Utc::now() - chrono::Duration::hours(2));
    store.insert_channel(outdated);

    let mut recent = test::channel("UC2", 1000);
    recent.enrichment = EnrichmentLevel::Basic;
    recent.last_synced_at = Some(Utc::now() - chrono::Duration::minutes(5));
    store.insert_channel(recent);

    sync.ensure_fresh(&"UC1".into(), EnrichmentLevel::Basic)
        .await
        .unwrap();
    sync.ensure_fresh(&"UC2".into(), EnrichmentLevel::Basic)
        .await
        .unwrap();

    assert_eq!(upstream.calls_for("fetch_channel", "UC1"), 1);
    assert_eq!(upstream.calls_for("fetch_channel", "UC2"), 0);
    let synced_at = store.channel("UC1").unwrap().last_synced_at.unwrap();
    assert!(Utc::now() - synced_at < chrono::Duration::minutes(1));
}

#[tokio::test]
async fn test_parent_only_refresh() {
    let (sync, upstream, store) = setup_service(|_| ());

    let mut stored = test::channel("UC1", 10);
    stored.enrichment = EnrichmentLevel::Basic;
    stored.last_synced_at = Some(test::timestamp());
    stored.search_count = 7;
    store.insert_channel(stored);

    upstream.add_channel(test::channel("UC1", 999));
    upstream.set_videos("UC1", test::videos("UC1", 3));

    let level = sync.refresh(&"UC1".into(), EnrichmentLevel::None).await;
    assert_eq!(level, Ok(EnrichmentLevel::Basic));

    let channel = store.channel("UC1").unwrap();
    assert_eq!(channel.subscriber_count, 999);
    assert_eq!(channel.search_count, 7);
    assert_eq!(channel.enrichment, EnrichmentLevel::Basic);
    assert_eq!(channel.last_synced_at, Some(test::timestamp()));
    assert_eq!(upstream.calls("fetch_video_page"), 0);
}

#[tokio::test]
async fn test_comments_most_liked_first() {
    let (sync, upstream, _store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    upstream.set_videos("UC1", test::videos("UC1", 2));
    upstream.set_comments("UC1-v0", test::comments("UC1-v0", 5));
    upstream.set_comments("UC1-v1", test::comments("UC1-v1", 5));

    let comments = sync
        .comments(&"UC1".into(), EnrichmentLevel::Basic, 0, 3)
        .await
        .unwrap();
    let likes: Vec<_> = comments.iter().map(|comment| comment.like_count).collect();
    assert_eq!(likes, [4, 4, 3]);

    let rest = sync
        .comments(&"UC1".into(), EnrichmentLevel::Basic, 8, 10)
        .await
        .unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(upstream.calls("fetch_channel"), 1);
}

#[tokio::test]
async fn test_store_failure_is_internal() {
    let (sync, upstream, store) = setup_service(|_| ());

    upstream.add_channel(test::channel("UC1", 1000));
    store.set_failing(true);

    let result = sync
        .ensure_fresh(&"UC1".into(), EnrichmentLevel::Basic)
        .await;
    assert_eq!(result, Err(SyncError::Internal));
}
