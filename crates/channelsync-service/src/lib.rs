//! Keeps a local store of channel, video and comment metadata in sync with a rate-limited
//! upstream metadata API.
//!
//! The entry point is [`ChannelSync`](service::ChannelSync), which composes:
//!
//! - a keyed [`SingleFlight`](singleflight::SingleFlight) coordinator that runs each refresh
//!   at most once concurrently,
//! - the [`SearchCache`](search_cache::SearchCache) freshness policy with fuzzy key reuse,
//! - the monotonic [`EnrichmentLevel`](enrichment::EnrichmentLevel),
//! - the [`CooldownGate`](cooldown::CooldownGate) for per-actor counters,
//! - and the upstream failure [classifier](classify).

#[macro_use]
pub mod metrics;

pub mod classify;
pub mod config;
pub mod cooldown;
pub mod enrichment;
pub mod error;
pub mod logging;
pub mod search_cache;
pub mod service;
pub mod similarity;
pub mod singleflight;
pub mod store;
pub mod types;
pub mod upstream;
pub mod utils;
