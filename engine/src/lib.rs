//! # Tether Engine
//!
//! A local-first document store with schema migration and live pull
//! replication.
//!
//! Documents live in collections. Each collection is bound to one schema
//! version; documents stored under an older version are upgraded by a chain
//! of migration strategies before anything else touches the collection.
//! A replication pulls documents from a remote source, both through a
//! request/response handler and through a live stream, and applies them
//! through the same write path as local writes.
//!
//! ## Design Principles
//!
//! - **Migration first**: reads, local writes and replication wait until the
//!   collection's migration is done
//! - **Nothing dropped**: stream batches arriving during migration or the
//!   initial sync are queued and applied in arrival order
//! - **One writer**: migration, local writes and replicated batches go
//!   through a single writer per collection
//! - **Monotonic events**: subscribers never see a document's revision go
//!   backwards
//!
//! ## Core Concepts
//!
//! ### Documents
//!
//! A [`Document`] has:
//! - Primary key (immutable)
//! - JSON fields
//! - Revision ([`RevisionId`], totally ordered)
//! - Soft delete flag (tombstone)
//! - Metadata (timestamps, origin, schema version marker)
//!
//! ### Migration
//!
//! [`MigrationStrategy`] functions are keyed by the version they migrate
//! *from*. The [`SchemaRegistry`] checks at open time that the chain has no
//! gaps. A migration commits all rewrites at once or nothing.
//!
//! ### Replication
//!
//! [`Collection::replicate`] starts a pull replication. Its progress is
//! tracked per identifier with a [`Checkpoint`], stored next to the
//! documents so it survives a restart.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{
//!     CollectionOptions, CollectionSchema, Database, EngineConfig, FieldDef, FieldType,
//!     MemoryStorage,
//! };
//! use serde_json::json;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! // 1. Define a schema
//! let schema = CollectionSchema::new(
//!     "items",
//!     0,
//!     "id",
//!     vec![FieldDef::optional("foo", FieldType::String)],
//! );
//!
//! // 2. Open a database and add the collection
//! let db = Database::open("app", MemoryStorage::new(), EngineConfig::default()).unwrap();
//! let items = db.add_collection(CollectionOptions::new(schema)).await.unwrap();
//!
//! // 3. Write and query
//! items.insert(json!({"id": "a", "foo": "bar"})).await.unwrap();
//! let found = items.find_one("a").exec().await.unwrap().unwrap();
//! assert_eq!(found.get("foo"), Some(&json!("bar")));
//! # });
//! ```
//!
//! ## Persistence
//!
//! Use [`MemoryStorage::export_snapshot`] and [`MemoryStorage::from_snapshot`]
//! with [`StorageSnapshot`] for persistence. Snapshots are serializable to
//! JSON with deterministic ordering.

pub mod checkpoint;
pub mod collection;
pub mod config;
pub mod conflict;
pub mod database;
pub mod document;
pub mod error;
pub mod events;
pub mod fanout;
pub mod migration;
pub mod query;
pub mod replication;
pub mod revision;
pub mod schema;
pub mod snapshot;
pub mod storage;

// Re-export main types at crate root
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use collection::{Collection, CollectionOptions};
pub use config::EngineConfig;
pub use conflict::{Conflict, ConflictHandler, ConflictResolution, LastWriteWins};
pub use database::Database;
pub use document::{Document, DocumentMetadata, Origin};
pub use error::{Error, Result};
pub use events::ChangeEventBus;
pub use fanout::{Fanout, Subscription};
pub use migration::{MigrationProgress, MigrationReport, MigrationStatus};
pub use query::{Find, FindOne, Selector};
pub use replication::{
    pull_stream, PullBatch, PullOptions, PullStream, PullStreamEvent, PullStreamSender,
    ReplicationError, ReplicationHandle, ReplicationOptions, ReplicationState, ReplicationStatus,
};
pub use revision::RevisionId;
pub use schema::{CollectionSchema, FieldDef, FieldType, MigrationStrategy, SchemaRegistry};
pub use snapshot::{SnapshotMetadata, StorageSnapshot, SNAPSHOT_FORMAT_VERSION};
pub use storage::{MemoryStorage, StoredCollection};

/// Type aliases for clarity
pub type PrimaryKey = String;
pub type CollectionName = String;
pub type SchemaVersion = u32;
pub type Timestamp = u64;
pub type Fields = serde_json::Map<String, serde_json::Value>;
