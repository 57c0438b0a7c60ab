use std::fmt;

use thiserror::Error;

use crate::types::ResourceKey;

/// The upstream call a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Search,
    FetchChannel,
    FetchVideos,
    FetchComments,
    FetchReplies,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::FetchChannel => "fetch_channel",
            Self::FetchVideos => "fetch_videos",
            Self::FetchComments => "fetch_comments",
            Self::FetchReplies => "fetch_replies",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error surfaced by the sync orchestrator.
///
/// This is shared between all waiters of a single refresh, hence `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// The upstream quota is exhausted.
    ///
    /// The refresh was aborted and must not be retried within the same request.
    #[error("upstream rate limit exceeded")]
    RateLimited,
    /// Any other upstream failure, with the resource and operation it happened in.
    #[error("{operation} failed for {resource}: {details}")]
    UpstreamFailure {
        resource: String,
        operation: Operation,
        details: String,
    },
    /// The search query was empty after normalization.
    #[error("invalid search query: {0:?}")]
    InvalidQuery(String),
    /// An unexpected error in the orchestrator or its store.
    #[error("internal error")]
    Internal,
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        let dynerr: &(dyn std::error::Error + 'static) = err.as_ref();
        tracing::error!(error = dynerr, "internal sync error");
        Self::Internal
    }
}

impl SyncError {
    /// Logs an unexpected error and collapses it to [`Internal`](Self::Internal).
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr, "internal sync error");
        Self::Internal
    }

    pub(crate) fn upstream(
        resource: impl fmt::Display,
        operation: Operation,
        details: impl fmt::Display,
    ) -> Self {
        Self::UpstreamFailure {
            resource: resource.to_string(),
            operation,
            details: details.to_string(),
        }
    }

    /// A parent record that does not exist upstream.
    pub(crate) fn not_found(resource: &ResourceKey) -> Self {
        Self::upstream(resource, Operation::FetchChannel, "not found")
    }

    /// Whether callers should be answered with a throttling response.
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::RateLimited)
    }
}
