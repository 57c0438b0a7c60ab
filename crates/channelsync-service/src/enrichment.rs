//! How deeply the related data of a channel has been fetched.
//!
//! Every channel carries an [`EnrichmentLevel`] next to its own record. A sync declares the
//! level it is going for up front, the amount of videos and comments it pulls is derived from
//! that target via [`SyncDepths`], and on success the stored level is raised to the target.
//! Levels never go down: a cheap `Basic` pass over an `Extended` channel leaves it `Extended`.
use std::fmt;

use serde::{Deserialize, Serialize};

/// The depth of data known for a channel, ordered from shallow to deep.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentLevel {
    /// Only the channel record itself is known.
    #[default]
    None,
    /// Recent videos and their top comments were fetched once.
    Basic,
    /// A deep pass over many more videos was done. Terminal.
    Extended,
}

impl EnrichmentLevel {
    /// Raises `self` to `target`, never lowering it.
    ///
    /// Returns `true` if the level changed.
    pub fn advance_to(&mut self, target: EnrichmentLevel) -> bool {
        let next = (*self).max(target);
        let changed = next != *self;
        *self = next;
        changed
    }

    /// Whether a channel at this level still needs a sync to reach `target`.
    pub fn is_below(self, target: EnrichmentLevel) -> bool {
        self < target
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Basic => "basic",
            Self::Extended => "extended",
        }
    }
}

impl fmt::Display for EnrichmentLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many child and grandchild records a single sync pulls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SyncDepth {
    /// Most recent videos of the channel.
    pub videos: usize,
    /// Top comments per video.
    pub comments_per_video: usize,
}

impl SyncDepth {
    /// Only the channel record, no children.
    pub const PARENT_ONLY: SyncDepth = SyncDepth {
        videos: 0,
        comments_per_video: 0,
    };
}

/// The [`SyncDepth`] used for each target level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncDepths {
    pub basic: SyncDepth,
    pub extended: SyncDepth,
}

impl Default for SyncDepths {
    fn default() -> Self {
        Self {
            basic: SyncDepth {
                videos: 33,
                comments_per_video: 30,
            },
            extended: SyncDepth {
                videos: 100,
                comments_per_video: 30,
            },
        }
    }
}

impl SyncDepths {
    /// The depth of a sync aiming for `target`.
    ///
    /// This depends on the target alone, never on the level a channel currently has.
    pub fn for_target(&self, target: EnrichmentLevel) -> SyncDepth {
        match target {
            EnrichmentLevel::None => SyncDepth::PARENT_ONLY,
            EnrichmentLevel::Basic => self.basic,
            EnrichmentLevel::Extended => self.extended,
        }
    }
}
