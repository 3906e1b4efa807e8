//! Document types for storing data.

use crate::{Fields, PrimaryKey, RevisionId, SchemaVersion, Timestamp};
use serde::{Deserialize, Serialize};

/// Origin of the last write to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Written locally (insert, update, migration)
    Local,
    /// Received through replication
    Remote,
}

/// Metadata associated with a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    /// When the document was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the document was last written (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Whether the last write was local or replicated
    pub origin: Origin,
    /// Schema version the fields conform to
    pub schema_version: SchemaVersion,
}

impl DocumentMetadata {
    /// Create metadata for a new document.
    pub fn new(timestamp: Timestamp, origin: Origin, schema_version: SchemaVersion) -> Self {
        Self {
            created_at: timestamp,
            updated_at: timestamp,
            origin,
            schema_version,
        }
    }

    /// Update metadata for a modification.
    pub fn touch(&mut self, timestamp: Timestamp, origin: Origin) {
        self.updated_at = timestamp;
        self.origin = origin;
    }
}

/// A document in a collection.
///
/// `fields` always carries the primary-key field, mirroring `primary_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Immutable primary key
    pub primary_key: PrimaryKey,
    /// Field values, shaped by the collection schema
    pub fields: Fields,
    /// Revision of the last write
    pub revision: RevisionId,
    /// Soft delete flag (tombstone)
    pub deleted: bool,
    /// Document metadata
    pub metadata: DocumentMetadata,
}

impl Document {
    /// Create a new local document at its first revision.
    pub fn new(
        primary_key: impl Into<PrimaryKey>,
        fields: Fields,
        schema_version: SchemaVersion,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            primary_key: primary_key.into(),
            fields,
            revision: RevisionId::first(),
            deleted: false,
            metadata: DocumentMetadata::new(timestamp, Origin::Local, schema_version),
        }
    }

    /// Check if document is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Get a single field value.
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }

    /// The document fields as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.fields.clone())
    }

    /// Replace the fields, bumping the revision.
    pub fn write_fields(&mut self, fields: Fields, timestamp: Timestamp, origin: Origin) {
        self.fields = fields;
        self.deleted = false;
        self.revision = self.revision.next();
        self.metadata.touch(timestamp, origin);
    }

    /// Mark document as deleted (tombstone).
    pub fn mark_deleted(&mut self, timestamp: Timestamp, origin: Origin) {
        self.deleted = true;
        self.revision = self.revision.next();
        self.metadata.touch(timestamp, origin);
    }
}

/// Milliseconds since the epoch.
pub(crate) fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
