use std::sync::Arc;

use channelsync_service::config::SyncConfig;
use channelsync_service::service::ChannelSync;
use channelsync_test as test;

pub use test::{MemoryStore, MockUpstream};

/// Setup tests and create a test service.
///
/// This function returns the orchestrator under test together with the fakes it runs against.
/// Script the upstream and inspect the store through the returned handles.
///
/// The `update_config` closure can modify any default configuration if needed before the
/// service is created.
pub fn setup_service(
    update_config: impl FnOnce(&mut SyncConfig),
) -> (ChannelSync, Arc<MockUpstream>, Arc<MemoryStore>) {
    test::setup();

    let mut config = test::sync_config();
    update_config(&mut config);

    let upstream = MockUpstream::new();
    let store = MemoryStore::new();
    let sync = test::channel_sync(config, &upstream, &store);

    (sync, upstream, store)
}
