//! The contract of the external metadata API.
//!
//! Implementations own the HTTP plumbing, request timeouts and response decoding. They report
//! failures as an [`UpstreamError`] value, which the [classifier](crate::classify) turns into
//! a retry, skip or abort decision.
use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::types::{Channel, Comment, Page, Reply, ResourceKey, SearchKey, Video};

/// The largest page the upstream hands out for video listings.
pub const MAX_PAGE_SIZE: usize = 50;

/// A failed upstream call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// The upstream answered with an error response.
    ///
    /// `reason` is the machine readable error reason, if the body carried one.
    #[error("upstream responded with {status}: {}", reason.as_deref().unwrap_or("no reason"))]
    Status {
        status: u16,
        reason: Option<String>,
        body: String,
    },
    /// No response was received, for example because of a timeout or connection loss.
    #[error("upstream request failed: {0}")]
    Transport(String),
    /// A response was received but could not be decoded.
    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Deserialize)]
struct ErrorDetails {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    reason: Option<String>,
}

impl UpstreamError {
    /// Creates a [`Status`](Self::Status) error from a raw error response.
    ///
    /// The reason is taken from the first entry of `error.errors` in a JSON body.
    pub fn from_response(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        let reason = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => parsed
                .error
                .errors
                .into_iter()
                .next()
                .and_then(|item| item.reason),
            Err(e) => {
                tracing::debug!(error = %e, status, "Could not parse upstream error body");
                None
            }
        };

        Self::Status {
            status,
            reason,
            body,
        }
    }

    /// Shorthand for a status error with a known reason and no body.
    pub fn status(status: u16, reason: &str) -> Self {
        Self::Status {
            status,
            reason: Some(reason.to_owned()),
            body: String::new(),
        }
    }
}

/// The external metadata API.
#[async_trait]
pub trait Upstream: Send + Sync + 'static {
    /// Searches for channels matching a query.
    async fn search_channels(&self, query: &SearchKey)
    -> Result<BTreeSet<ResourceKey>, UpstreamError>;

    /// Fetches a channel record.
    async fn fetch_channel(&self, key: &ResourceKey) -> Result<Channel, UpstreamError>;

    /// Fetches one page of the channel's uploads, newest first.
    async fn fetch_video_page(
        &self,
        channel: &Channel,
        page_token: Option<&str>,
        max_results: usize,
    ) -> Result<Page<Video>, UpstreamError>;

    /// Fetches the top comments of a video, ordered by relevance.
    async fn fetch_comments(
        &self,
        video: &Video,
        limit: usize,
    ) -> Result<Vec<Comment>, UpstreamError>;

    /// Fetches one page of replies to a comment.
    async fn fetch_replies(
        &self,
        comment: &ResourceKey,
        page_token: Option<&str>,
    ) -> Result<Page<Reply>, UpstreamError>;

    /// Fetches up to `limit` of the most recent videos of a channel.
    ///
    /// Pages through [`fetch_video_page`](Self::fetch_video_page) until enough videos were
    /// collected or the listing ends.
    async fn fetch_videos(
        &self,
        channel: &Channel,
        limit: usize,
    ) -> Result<Vec<Video>, UpstreamError> {
        let mut videos = Vec::new();
        let mut page_token: Option<String> = None;

        while videos.len() < limit {
            let max_results = (limit - videos.len()).min(MAX_PAGE_SIZE);
            let page = self
                .fetch_video_page(channel, page_token.as_deref(), max_results)
                .await?;

            let received = page.items.len();
            videos.extend(page.items.into_iter().take(max_results));

            page_token = page.next_page_token;
            if received == 0 || page_token.is_none() {
                break;
            }
        }

        Ok(videos)
    }
}
