//! Storage - the in-memory document container.
//!
//! Storage holds every document revision per collection and the checkpoint
//! rows of every replication. It is cheap to clone: clones share state, which
//! is how a database can be closed and reopened against the same data.
//!
//! Each collection lives in its own map entry, so a bulk write to one
//! collection is atomic with respect to readers of that collection.

use crate::{
    snapshot::StorageSnapshot, Checkpoint, CollectionName, Document, PrimaryKey, SchemaVersion,
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Documents of one collection, keyed by primary key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredCollection {
    documents: BTreeMap<PrimaryKey, Document>,
}

impl StoredCollection {
    /// Create an empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a document by primary key (including deleted).
    pub fn get(&self, primary_key: &str) -> Option<&Document> {
        self.documents.get(primary_key)
    }

    /// Insert or replace a document.
    pub fn insert(&mut self, document: Document) {
        self.documents
            .insert(document.primary_key.clone(), document);
    }

    /// Check if a document exists (including deleted).
    pub fn contains(&self, primary_key: &str) -> bool {
        self.documents.contains_key(primary_key)
    }

    /// Get all active (non-deleted) documents.
    pub fn active_documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values().filter(|d| d.is_active())
    }

    /// Get all documents including deleted.
    pub fn all_documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Count of active documents.
    pub fn len(&self) -> usize {
        self.active_documents().count()
    }

    /// Check if collection has no active documents.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
struct Inner {
    collections: DashMap<CollectionName, StoredCollection>,
    checkpoints: DashMap<(CollectionName, String), Checkpoint>,
}

/// Shared in-memory storage for one database.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore storage from a snapshot.
    pub fn from_snapshot(snapshot: StorageSnapshot) -> Self {
        let storage = Self::new();
        for (collection, documents) in snapshot.collections {
            let mut stored = StoredCollection::new();
            for (_, document) in documents {
                stored.insert(document);
            }
            storage.inner.collections.insert(collection, stored);
        }
        for (collection, rows) in snapshot.checkpoints {
            for (identifier, checkpoint) in rows {
                storage
                    .inner
                    .checkpoints
                    .insert((collection.clone(), identifier), checkpoint);
            }
        }
        storage
    }

    /// Export everything as a snapshot with deterministic ordering.
    pub fn export_snapshot(&self) -> StorageSnapshot {
        let mut snapshot = StorageSnapshot::new();
        for entry in self.inner.collections.iter() {
            for document in entry.value().all_documents() {
                snapshot.add_document(entry.key(), document.clone());
            }
        }
        for entry in self.inner.checkpoints.iter() {
            let (collection, identifier) = entry.key();
            snapshot.add_checkpoint(collection, identifier, entry.value().clone());
        }
        snapshot
    }

    /// Get a document including deleted ones.
    pub fn get(&self, collection: &str, primary_key: &str) -> Option<Document> {
        self.inner
            .collections
            .get(collection)
            .and_then(|c| c.get(primary_key).cloned())
    }

    /// Get every document of a collection, tombstones included.
    pub fn all_documents(&self, collection: &str) -> Vec<Document> {
        self.inner
            .collections
            .get(collection)
            .map(|c| c.all_documents().cloned().collect())
            .unwrap_or_default()
    }

    /// Get the active documents matching a predicate, in primary-key order.
    pub fn filter<F>(&self, collection: &str, predicate: F) -> Vec<Document>
    where
        F: Fn(&Document) -> bool,
    {
        self.inner
            .collections
            .get(collection)
            .map(|c| {
                c.active_documents()
                    .filter(|d| predicate(d))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Documents whose schema marker is below `version`.
    pub fn documents_below_version(
        &self,
        collection: &str,
        version: SchemaVersion,
    ) -> Vec<Document> {
        self.inner
            .collections
            .get(collection)
            .map(|c| {
                c.all_documents()
                    .filter(|d| d.metadata.schema_version < version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Highest schema marker of any stored document.
    pub fn max_schema_version(&self, collection: &str) -> Option<SchemaVersion> {
        self.inner.collections.get(collection).and_then(|c| {
            c.all_documents()
                .map(|d| d.metadata.schema_version)
                .max()
        })
    }

    /// Count documents in a collection.
    pub fn count(&self, collection: &str, include_deleted: bool) -> usize {
        self.inner
            .collections
            .get(collection)
            .map(|c| {
                if include_deleted {
                    c.documents.len()
                } else {
                    c.len()
                }
            })
            .unwrap_or(0)
    }

    /// Write a single document.
    pub fn write(&self, collection: &str, document: Document) {
        self.inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(document);
    }

    /// Write several documents as one atomic step.
    pub fn bulk_write(&self, collection: &str, documents: Vec<Document>) {
        let mut stored = self
            .inner
            .collections
            .entry(collection.to_string())
            .or_default();
        for document in documents {
            stored.insert(document);
        }
    }

    /// Physically remove tombstones. Returns the removed rows.
    pub fn purge_tombstones(&self, collection: &str) -> Vec<Document> {
        let Some(mut stored) = self.inner.collections.get_mut(collection) else {
            return Vec::new();
        };

        let mut purged = Vec::new();
        stored.documents.retain(|_, d| {
            if d.is_active() {
                return true;
            }
            purged.push(d.clone());
            false
        });
        purged
    }

    /// Load a checkpoint row.
    pub fn checkpoint(&self, collection: &str, identifier: &str) -> Option<Checkpoint> {
        self.inner
            .checkpoints
            .get(&(collection.to_string(), identifier.to_string()))
            .map(|c| c.clone())
    }

    /// Store a checkpoint row.
    pub fn set_checkpoint(&self, collection: &str, identifier: &str, checkpoint: Checkpoint) {
        self.inner
            .checkpoints
            .insert((collection.to_string(), identifier.to_string()), checkpoint);
    }

    /// Delete a checkpoint row.
    pub fn remove_checkpoint(&self, collection: &str, identifier: &str) {
        self.inner
            .checkpoints
            .remove(&(collection.to_string(), identifier.to_string()));
    }

    /// Check whether any replication references a collection.
    pub fn has_checkpoints(&self, collection: &str) -> bool {
        self.inner
            .checkpoints
            .iter()
            .any(|entry| entry.key().0 == collection)
    }

    /// Remove all documents and checkpoints.
    pub fn clear(&self) {
        self.inner.collections.clear();
        self.inner.checkpoints.clear();
    }
}
