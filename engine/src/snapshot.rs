//! Point-in-time copies of a [`MemoryStorage`](crate::MemoryStorage).
//!
//! A snapshot holds every document row, tombstones included, and every
//! replication checkpoint row. Restoring one is how a restart is modelled:
//! replications resume from the saved checkpoints and the migration engine
//! picks up documents stored under older schema versions.

use crate::{
    error::Result, Checkpoint, CollectionName, CollectionSchema, Document, Error, PrimaryKey,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Highest snapshot format this build reads.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Serializable storage contents.
///
/// Maps are ordered, so equal storage always serializes to the same JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageSnapshot {
    pub format_version: u32,
    /// Collection name to primary key to document
    pub collections: BTreeMap<CollectionName, BTreeMap<PrimaryKey, Document>>,
    /// Collection name to replication identifier to checkpoint
    #[serde(default)]
    pub checkpoints: BTreeMap<CollectionName, BTreeMap<String, Checkpoint>>,
}

impl Default for StorageSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageSnapshot {
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            collections: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
        }
    }

    /// Store a document row, replacing any row with the same key.
    pub fn add_document(&mut self, collection: &str, document: Document) {
        let rows = self.collections.entry(collection.to_string()).or_default();
        rows.insert(document.primary_key.clone(), document);
    }

    /// Store a checkpoint row.
    pub fn add_checkpoint(&mut self, collection: &str, identifier: &str, checkpoint: Checkpoint) {
        let rows = self.checkpoints.entry(collection.to_string()).or_default();
        rows.insert(identifier.to_string(), checkpoint);
    }

    pub fn get_document(&self, collection: &str, primary_key: &str) -> Option<&Document> {
        self.collections.get(collection)?.get(primary_key)
    }

    /// Rows across all collections, tombstones included.
    pub fn document_count(&self) -> usize {
        self.documents().count()
    }

    /// Rows across all collections that are not tombstones.
    pub fn active_document_count(&self) -> usize {
        self.documents().filter(|d| d.is_active()).count()
    }

    fn documents(&self) -> impl Iterator<Item = &Document> {
        self.collections.values().flat_map(BTreeMap::values)
    }

    /// Validate the documents of one collection against its schema.
    ///
    /// Documents stored under an older version are left to the migration
    /// engine; documents from a newer version are rejected.
    pub fn validate(&self, schema: &CollectionSchema) -> Result<()> {
        let Some(documents) = self.collections.get(&schema.name) else {
            return Ok(());
        };

        for document in documents.values() {
            let version = document.metadata.schema_version;
            if version > schema.version {
                return Err(Error::SchemaVersionMismatch {
                    expected: schema.version,
                    actual: version,
                });
            }
            if version == schema.version && document.is_active() {
                schema.validate_payload(&document.fields)?;
            }
        }

        Ok(())
    }

    /// Compact JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(invalid)
    }

    /// Indented JSON, for files meant to be read by people.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(invalid)
    }

    /// Parse a snapshot, refusing formats newer than this build.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(json).map_err(invalid)?;
        snapshot.check_format()?;
        Ok(snapshot)
    }

    fn check_format(&self) -> Result<()> {
        if self.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "format version {} is newer than supported version {}",
                self.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        Ok(())
    }
}

fn invalid(err: serde_json::Error) -> Error {
    Error::InvalidSnapshot(err.to_string())
}

/// Counts describing a snapshot, cheap to log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub format_version: u32,
    /// Collections with at least one row
    pub collection_count: usize,
    /// Rows, tombstones included
    pub document_count: usize,
    pub checkpoint_count: usize,
}

impl From<&StorageSnapshot> for SnapshotMetadata {
    fn from(snapshot: &StorageSnapshot) -> Self {
        Self {
            format_version: snapshot.format_version,
            collection_count: snapshot.collections.len(),
            document_count: snapshot.document_count(),
            checkpoint_count: snapshot.checkpoints.values().map(BTreeMap::len).sum(),
        }
    }
}
