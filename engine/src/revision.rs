//! Revision identifiers for causal ordering of document writes.
//!
//! Every write to a document produces a new revision. Revisions provide a
//! total order, which conflict resolution and the change event bus rely on.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A document revision.
///
/// Ordering rules:
/// 1. Higher height wins
/// 2. If heights are equal, lexicographically higher hash wins
///
/// The textual form is `"<height>-<hash>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionId {
    /// Number of writes in the document's history
    pub height: u64,
    /// Distinguishes concurrent writes at the same height
    pub hash: String,
}

impl RevisionId {
    /// Largest height accepted from the textual form.
    ///
    /// Matches the largest integer a JSON number holds exactly, and leaves
    /// room for local writes on top of any parsed revision.
    pub const MAX_HEIGHT: u64 = (1 << 53) - 1;

    /// Create a revision with an explicit height and hash.
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }

    /// The revision of a freshly created document.
    pub fn first() -> Self {
        Self::new(1, random_hash())
    }

    /// The revision that follows this one.
    pub fn next(&self) -> Self {
        // Unreachable from parsed revisions, see MAX_HEIGHT
        Self::new(self.height.saturating_add(1), random_hash())
    }

    /// Check if this revision strictly precedes another.
    pub fn happened_before(&self, other: &RevisionId) -> bool {
        self < other
    }

    /// Check if two revisions are concurrent (same height, different hash).
    pub fn is_concurrent_with(&self, other: &RevisionId) -> bool {
        self.height == other.height && self.hash != other.hash
    }
}

fn random_hash() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.height.cmp(&other.height) {
            Ordering::Equal => self.hash.cmp(&other.hash),
            other => other,
        }
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

impl FromStr for RevisionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (height, hash) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRevision(s.to_string()))?;
        let height = height
            .parse::<u64>()
            .map_err(|_| Error::InvalidRevision(s.to_string()))?;
        if height == 0 || height > Self::MAX_HEIGHT || hash.is_empty() {
            return Err(Error::InvalidRevision(s.to_string()));
        }
        Ok(Self::new(height, hash))
    }
}
