//! Conflict resolution for replicated writes.
//!
//! When a replicated document targets a key that already has a local
//! revision, a [`ConflictHandler`] decides which side wins. The default is
//! [`LastWriteWins`]: the higher revision wins, ties on height are broken by
//! hash order, and an incoming write without a revision is a new write on
//! top of the local one.

use crate::{Document, Fields, RevisionId};
use serde::{Deserialize, Serialize};

/// How a conflict was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictResolution {
    /// Local document is kept
    LocalWins,
    /// Incoming document replaces the local one
    RemoteWins,
    /// The handler declined to pick a winner
    Unresolved(String),
}

/// A replicated write meeting an existing local document.
#[derive(Debug, Clone, Copy)]
pub struct Conflict<'a> {
    /// Document currently stored
    pub local: &'a Document,
    /// Incoming fields, already modified and validated
    pub incoming: &'a Fields,
    /// Revision carried by the incoming write, if any
    pub incoming_revision: Option<&'a RevisionId>,
    /// Whether the incoming write is a deletion
    pub incoming_deleted: bool,
}

/// Pluggable conflict policy.
pub trait ConflictHandler: Send + Sync {
    /// Pick the winner of a conflict.
    fn resolve(&self, conflict: &Conflict<'_>) -> ConflictResolution;
}

impl<F> ConflictHandler for F
where
    F: Fn(&Conflict<'_>) -> ConflictResolution + Send + Sync,
{
    fn resolve(&self, conflict: &Conflict<'_>) -> ConflictResolution {
        self(conflict)
    }
}

/// Higher revision wins (default policy).
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictHandler for LastWriteWins {
    fn resolve(&self, conflict: &Conflict<'_>) -> ConflictResolution {
        match conflict.incoming_revision {
            None => ConflictResolution::RemoteWins,
            Some(incoming) if incoming > &conflict.local.revision => {
                ConflictResolution::RemoteWins
            }
            Some(_) => ConflictResolution::LocalWins,
        }
    }
}
