//! Replication checkpoints.
//!
//! A checkpoint is an opaque token handed out by the pull source. The engine
//! never inspects it; it only stores the last acknowledged one per
//! replication identifier and hands it back to the pull handler.

use crate::{CollectionName, MemoryStorage};
use serde::{Deserialize, Serialize};

/// Opaque replication-progress token from the pull source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(serde_json::Value);

impl Checkpoint {
    /// Wrap a JSON value returned by the pull source.
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// The raw JSON value.
    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

    /// Unwrap into the raw JSON value.
    pub fn into_value(self) -> serde_json::Value {
        self.0
    }
}

impl From<serde_json::Value> for Checkpoint {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Checkpoint rows of one collection, keyed by replication identifier.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    storage: MemoryStorage,
    collection: CollectionName,
}

impl CheckpointStore {
    /// Create a store over the checkpoint rows of `collection`.
    pub fn new(storage: MemoryStorage, collection: impl Into<CollectionName>) -> Self {
        Self {
            storage,
            collection: collection.into(),
        }
    }

    /// Last acknowledged checkpoint for a replication.
    pub fn load(&self, identifier: &str) -> Option<Checkpoint> {
        self.storage.checkpoint(&self.collection, identifier)
    }

    /// Persist a checkpoint. Last write wins.
    pub fn save(&self, identifier: &str, checkpoint: Checkpoint) {
        tracing::trace!(
            collection = %self.collection,
            identifier = %identifier,
            "Saving checkpoint"
        );
        self.storage
            .set_checkpoint(&self.collection, identifier, checkpoint);
    }

    /// Forget the checkpoint of a replication.
    pub fn clear(&self, identifier: &str) {
        self.storage.remove_checkpoint(&self.collection, identifier);
    }
}
