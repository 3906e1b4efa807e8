//! Error types for the Tether engine.

use crate::{CollectionName, PrimaryKey, SchemaVersion};
use thiserror::Error;

/// All possible errors from the Tether engine.
///
/// Errors are `Clone` so that they can be fanned out on a replication's
/// error sequence to every subscriber.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("collection not found: {0}")]
    CollectionNotFound(CollectionName),

    #[error("collection already exists: {0}")]
    CollectionAlreadyExists(CollectionName),

    #[error("document not found: {0}")]
    DocumentNotFound(PrimaryKey),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    #[error("invalid revision: {0}")]
    InvalidRevision(String),

    // Write errors
    #[error("document already exists: {0}")]
    DocumentAlreadyExists(PrimaryKey),

    #[error("operation on deleted document: {0}")]
    OperationOnDeleted(PrimaryKey),

    #[error("primary key of document '{0}' cannot be changed")]
    PrimaryKeyImmutable(PrimaryKey),

    #[error("collection is closed: {0}")]
    CollectionClosed(CollectionName),

    // Migration errors
    #[error("missing migration strategy for collection '{collection}' from version {from_version}")]
    MigrationStrategyMissing {
        collection: CollectionName,
        from_version: SchemaVersion,
    },

    #[error("unexpected migration strategy for collection '{collection}' from version {from_version}")]
    UnexpectedMigrationStrategy {
        collection: CollectionName,
        from_version: SchemaVersion,
    },

    #[error("migration of collection '{collection}' failed: {reason}")]
    MigrationStepFailed {
        collection: CollectionName,
        reason: String,
    },

    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch {
        expected: SchemaVersion,
        actual: SchemaVersion,
    },

    // Replication errors
    #[error("pull handler failed after {attempts} attempts: {reason}")]
    PullHandlerFailed { attempts: u32, reason: String },

    #[error("batch rejected: {0}")]
    BatchModifierRejected(String),

    #[error("conflict on document '{document}' left unresolved: {reason}")]
    ConflictUnresolved { document: PrimaryKey, reason: String },

    #[error("pull stream closed")]
    StreamClosed,

    #[error("replication '{0}' was canceled")]
    ReplicationCanceled(String),

    #[error("replication '{0}' is already running")]
    ReplicationAlreadyRunning(String),

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
