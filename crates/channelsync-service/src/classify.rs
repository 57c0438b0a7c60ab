//! Turns upstream failures into retry, skip or abort decisions.
//!
//! Classification happens right at the call site. Depending on what was fetched, some classes
//! are absorbed into an empty result while the rest become a [`SyncError`]:
//!
//! | class               | [`record`](Classifier::record) | [`container`](Classifier::container) | [`child_item`](Classifier::child_item) |
//! |---------------------|--------|-----------|----------------------------------|
//! | `RateLimited`       | abort  | abort     | abort                            |
//! | `NotFound`          | absent | empty     | empty                            |
//! | `PermissionDenied`  | error  | error     | empty if the reason is skippable |
//! | transient and fatal | error  | error     | error                            |
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Operation, SyncError};
use crate::upstream::UpstreamError;

/// Reasons attached to a 403 response that mean the quota is exhausted.
const RATE_LIMIT_REASONS: &[&str] = &[
    "quotaExceeded",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "dailyLimitExceeded",
];

/// The outcome class of a failed upstream call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    RateLimited,
    NotFound,
    /// Access was denied with the given reason.
    PermissionDenied(String),
    /// A timeout, a lost connection or a server side error.
    TransientFailure,
    Fatal,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::NotFound => "not_found",
            Self::PermissionDenied(_) => "permission_denied",
            Self::TransientFailure => "transient",
            Self::Fatal => "fatal",
        }
    }
}

/// Classifies an upstream failure.
pub fn classify(error: &UpstreamError) -> Classification {
    match error {
        UpstreamError::Status { status, reason, .. } => match *status {
            429 => Classification::RateLimited,
            403 => match reason.as_deref() {
                Some(reason) if RATE_LIMIT_REASONS.contains(&reason) => {
                    Classification::RateLimited
                }
                reason => Classification::PermissionDenied(reason.unwrap_or("forbidden").into()),
            },
            404 => Classification::NotFound,
            408 => Classification::TransientFailure,
            500.. => Classification::TransientFailure,
            _ => Classification::Fatal,
        },
        UpstreamError::Transport(_) => Classification::TransientFailure,
        UpstreamError::Malformed(_) => Classification::Fatal,
    }
}

/// Applies the per call site failure policy.
#[derive(Debug, Clone, Default)]
pub struct Classifier {
    skippable_denials: BTreeSet<String>,
}

impl Classifier {
    /// Creates a classifier that skips child items denied with one of the given reasons.
    pub fn new<I, S>(skippable_denials: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            skippable_denials: skippable_denials.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether a denial of a single child item can be treated as "no data".
    pub fn is_skippable(&self, reason: &str) -> bool {
        self.skippable_denials.contains(reason)
    }

    /// A single record: absence is `None`.
    pub fn record<T>(
        &self,
        result: Result<T, UpstreamError>,
        resource: impl fmt::Display,
        operation: Operation,
    ) -> Result<Option<T>, SyncError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) => match self.observe(&error, &resource, operation) {
                Classification::NotFound => Ok(None),
                class => Err(self.failure(class, error, resource, operation)),
            },
        }
    }

    /// A collection of children: absence is an empty collection.
    pub fn container<T>(
        &self,
        result: Result<Vec<T>, UpstreamError>,
        resource: impl fmt::Display,
        operation: Operation,
    ) -> Result<Vec<T>, SyncError> {
        match result {
            Ok(items) => Ok(items),
            Err(error) => match self.observe(&error, &resource, operation) {
                Classification::NotFound => Ok(Vec::new()),
                class => Err(self.failure(class, error, resource, operation)),
            },
        }
    }

    /// The children of one item within a batch.
    ///
    /// Absence and skippable denials are an empty collection so that siblings keep going.
    pub fn child_item<T>(
        &self,
        result: Result<Vec<T>, UpstreamError>,
        resource: impl fmt::Display,
        operation: Operation,
    ) -> Result<Vec<T>, SyncError> {
        match result {
            Ok(items) => Ok(items),
            Err(error) => match self.observe(&error, &resource, operation) {
                Classification::NotFound => Ok(Vec::new()),
                Classification::PermissionDenied(reason) if self.is_skippable(&reason) => {
                    tracing::debug!(%resource, %operation, %reason, "Skipping disabled item");
                    Ok(Vec::new())
                }
                class => Err(self.failure(class, error, resource, operation)),
            },
        }
    }

    fn observe(
        &self,
        error: &UpstreamError,
        resource: &dyn fmt::Display,
        operation: Operation,
    ) -> Classification {
        let class = classify(error);
        metric!(
            counter("upstream.errors") += 1,
            "class" => class.as_str(),
            "operation" => operation.as_str(),
        );
        tracing::trace!(
            %resource,
            %operation,
            class = class.as_str(),
            %error,
            "Upstream call failed"
        );
        class
    }

    fn failure(
        &self,
        class: Classification,
        error: UpstreamError,
        resource: impl fmt::Display,
        operation: Operation,
    ) -> SyncError {
        match class {
            Classification::RateLimited => {
                tracing::warn!(%resource, %operation, "Upstream quota exhausted");
                SyncError::RateLimited
            }
            Classification::NotFound => SyncError::upstream(resource, operation, "not found"),
            _ => SyncError::upstream(resource, operation, error),
        }
    }
}
