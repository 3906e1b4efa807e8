//! Collections: the unit of schema, storage, migration and replication.
//!
//! Every write to a collection (local, migration or replicated) goes through
//! one writer lock, lands in storage, and is then published on the
//! collection's change event bus. Reads and writes wait until the
//! collection's migration has finished.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};

use crate::document::now_millis;
use crate::migration::{MigrationEngine, MigrationReport, MigrationStatus};
use crate::query::{Find, FindOne, Selector};
use crate::replication::{ReplicationHandle, ReplicationOptions};
use crate::{
    error::Result, ChangeEventBus, CheckpointStore, CollectionName, CollectionSchema, Conflict,
    ConflictHandler, ConflictResolution, Document, EngineConfig, Error, Fields, LastWriteWins,
    MemoryStorage, MigrationStrategy, Origin, PrimaryKey, RevisionId, SchemaRegistry,
    SchemaVersion,
};

/// Options for adding a collection to a database.
#[derive(Clone)]
pub struct CollectionOptions {
    /// Schema at the version documents must conform to
    pub schema: CollectionSchema,
    /// Strategies keyed by the version they migrate from
    pub migration_strategies: BTreeMap<SchemaVersion, MigrationStrategy>,
    /// Policy for replicated writes meeting local ones
    pub conflict_handler: Arc<dyn ConflictHandler>,
    /// Run the migration while the collection is added
    pub auto_migrate: bool,
}

impl CollectionOptions {
    /// Options with no strategies, last-write-wins conflicts and auto migration.
    pub fn new(schema: CollectionSchema) -> Self {
        Self {
            schema,
            migration_strategies: BTreeMap::new(),
            conflict_handler: Arc::new(LastWriteWins),
            auto_migrate: true,
        }
    }

    /// Add the strategy migrating documents out of `from_version`.
    pub fn migration_strategy(mut self, from_version: SchemaVersion, strategy: MigrationStrategy) -> Self {
        self.migration_strategies.insert(from_version, strategy);
        self
    }

    /// Replace the conflict handler.
    pub fn conflict_handler(mut self, handler: impl ConflictHandler + 'static) -> Self {
        self.conflict_handler = Arc::new(handler);
        self
    }

    /// Enable or disable migration on open.
    pub fn auto_migrate(mut self, enabled: bool) -> Self {
        self.auto_migrate = enabled;
        self
    }
}

impl std::fmt::Debug for CollectionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionOptions")
            .field("schema", &self.schema)
            .field(
                "migration_strategies",
                &self.migration_strategies.keys().collect::<Vec<_>>(),
            )
            .field("auto_migrate", &self.auto_migrate)
            .finish()
    }
}

/// A replicated document, stripped of replication meta fields.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct IncomingDocument {
    pub(crate) primary_key: PrimaryKey,
    pub(crate) fields: Fields,
    pub(crate) revision: Option<RevisionId>,
    pub(crate) deleted: bool,
}

/// Result of applying one replicated batch.
#[derive(Debug, Default)]
pub(crate) struct RemoteWriteOutcome {
    /// Documents written, in batch order
    pub(crate) applied: Vec<Document>,
    /// Conflicts the handler left unresolved
    pub(crate) unresolved: Vec<Error>,
}

struct CollectionInner {
    schema: CollectionSchema,
    registry: SchemaRegistry,
    storage: MemoryStorage,
    bus: ChangeEventBus,
    checkpoints: CheckpointStore,
    conflict_handler: Arc<dyn ConflictHandler>,
    config: EngineConfig,
    /// Serializes every write to the collection
    writer: Mutex<()>,
    migration: watch::Sender<MigrationStatus>,
    closed: AtomicBool,
    replications: DashMap<String, ReplicationHandle>,
}

/// Handle to an open collection. Cheap to clone.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    /// Open a collection over `storage`.
    ///
    /// Fails when the strategy set does not cover every version below the
    /// schema version, or when storage holds documents of a newer version.
    pub(crate) fn open(
        storage: MemoryStorage,
        options: CollectionOptions,
        config: EngineConfig,
    ) -> Result<Self> {
        let CollectionOptions {
            schema,
            migration_strategies,
            conflict_handler,
            ..
        } = options;
        let name = schema.name.clone();

        let registry =
            SchemaRegistry::from_strategies(name.clone(), schema.version, migration_strategies)?;

        if let Some(newest) = storage.max_schema_version(&name) {
            if newest > schema.version {
                return Err(Error::SchemaVersionMismatch {
                    expected: schema.version,
                    actual: newest,
                });
            }
        }

        let initial = if storage.documents_below_version(&name, schema.version).is_empty() {
            MigrationStatus::Done
        } else {
            MigrationStatus::NotStarted
        };
        tracing::debug!(
            collection = %name,
            version = schema.version,
            migration = ?initial,
            "Opening collection"
        );

        let (migration, _) = watch::channel(initial);
        Ok(Self {
            inner: Arc::new(CollectionInner {
                bus: ChangeEventBus::new(name.clone(), storage.all_documents(&name)),
                checkpoints: CheckpointStore::new(storage.clone(), name),
                schema,
                registry,
                storage,
                conflict_handler,
                config,
                writer: Mutex::new(()),
                migration,
                closed: AtomicBool::new(false),
                replications: DashMap::new(),
            }),
        })
    }

    /// Collection name.
    pub fn name(&self) -> &CollectionName {
        &self.inner.schema.name
    }

    /// Current schema.
    pub fn schema(&self) -> &CollectionSchema {
        &self.inner.schema
    }

    /// Change event bus of this collection.
    pub fn bus(&self) -> &ChangeEventBus {
        &self.inner.bus
    }

    pub(crate) fn storage(&self) -> &MemoryStorage {
        &self.inner.storage
    }

    pub(crate) fn checkpoints(&self) -> &CheckpointStore {
        &self.inner.checkpoints
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Whether the collection was closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::CollectionClosed(self.name().clone()));
        }
        Ok(())
    }

    /// Wait until the migration finished.
    pub(crate) async fn ready(&self) -> Result<()> {
        self.ensure_open()?;

        let closed = &self.inner.closed;
        let mut status = self.inner.migration.subscribe();
        let finished = status
            .wait_for(|s| s.is_finished() || closed.load(Ordering::SeqCst))
            .await
            .map(|s| s.clone());

        self.ensure_open()?;
        match finished {
            Ok(MigrationStatus::Failed(reason)) => Err(Error::MigrationStepFailed {
                collection: self.name().clone(),
                reason,
            }),
            Ok(_) => Ok(()),
            Err(_) => Err(Error::CollectionClosed(self.name().clone())),
        }
    }

    // Migration

    /// Current migration status.
    pub fn migration_status(&self) -> MigrationStatus {
        self.inner.migration.borrow().clone()
    }

    /// Receiver following every migration status change.
    pub fn watch_migration_status(&self) -> watch::Receiver<MigrationStatus> {
        self.inner.migration.subscribe()
    }

    /// Whether stored documents are below the schema version.
    pub fn migration_needed(&self) -> bool {
        !self
            .inner
            .storage
            .documents_below_version(self.name(), self.inner.schema.version)
            .is_empty()
    }

    /// Migrate stale documents to the schema version.
    ///
    /// A no-op once the migration is done. A failed migration can be run
    /// again. Concurrent calls run the migration once.
    pub async fn migrate(&self) -> Result<MigrationReport> {
        self.ensure_open()?;
        if self.migration_status() == MigrationStatus::Done {
            return Ok(MigrationReport::default());
        }

        let _writer = self.inner.writer.lock().await;
        // Another caller may have finished while we waited for the writer
        if self.migration_status() == MigrationStatus::Done {
            return Ok(MigrationReport::default());
        }

        MigrationEngine {
            schema: &self.inner.schema,
            registry: &self.inner.registry,
            storage: &self.inner.storage,
            bus: &self.inner.bus,
            status: &self.inner.migration,
        }
        .run()
        .await
    }

    // Local writes

    /// Insert a new document.
    ///
    /// A tombstone under the same key is revived.
    pub async fn insert(&self, value: serde_json::Value) -> Result<Document> {
        self.ready().await?;
        let fields = self.checked_fields(value)?;
        let primary_key = self.inner.schema.primary_key_of(&fields)?.to_string();

        let _writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        let document = match self.inner.storage.get(self.name(), &primary_key) {
            Some(existing) if existing.is_active() => {
                return Err(Error::DocumentAlreadyExists(primary_key));
            }
            Some(mut tombstone) => {
                tombstone.write_fields(fields, now_millis(), Origin::Local);
                tombstone.metadata.schema_version = self.inner.schema.version;
                tombstone
            }
            None => self.create(primary_key, fields, None),
        };

        self.commit(document.clone());
        Ok(document)
    }

    /// Insert a document or replace the existing one.
    pub async fn upsert(&self, value: serde_json::Value) -> Result<Document> {
        self.ready().await?;
        let fields = self.checked_fields(value)?;
        let primary_key = self.inner.schema.primary_key_of(&fields)?.to_string();

        let _writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        let document = match self.inner.storage.get(self.name(), &primary_key) {
            Some(mut existing) => {
                existing.write_fields(fields, now_millis(), Origin::Local);
                existing.metadata.schema_version = self.inner.schema.version;
                existing
            }
            None => self.create(primary_key, fields, None),
        };

        self.commit(document.clone());
        Ok(document)
    }

    /// Set the given fields on an existing document.
    pub async fn update(&self, primary_key: &str, patch: serde_json::Value) -> Result<Document> {
        self.ready().await?;
        let patch = into_fields(patch)?;
        if let Some(key) = patch.get(&self.inner.schema.primary_key) {
            if key.as_str() != Some(primary_key) {
                return Err(Error::PrimaryKeyImmutable(primary_key.to_string()));
            }
        }

        let _writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        let mut document = self.existing_active(primary_key)?;
        let mut fields = document.fields.clone();
        fields.extend(patch);
        self.inner.schema.validate_payload(&fields)?;

        document.write_fields(fields, now_millis(), Origin::Local);
        document.metadata.schema_version = self.inner.schema.version;
        self.commit(document.clone());
        Ok(document)
    }

    /// Soft-delete a document.
    pub async fn remove(&self, primary_key: &str) -> Result<Document> {
        self.ready().await?;

        let _writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        let mut document = self.existing_active(primary_key)?;
        document.mark_deleted(now_millis(), Origin::Local);
        self.commit(document.clone());
        Ok(document)
    }

    fn existing_active(&self, primary_key: &str) -> Result<Document> {
        match self.inner.storage.get(self.name(), primary_key) {
            Some(document) if document.deleted => {
                Err(Error::OperationOnDeleted(primary_key.to_string()))
            }
            Some(document) => Ok(document),
            None => Err(Error::DocumentNotFound(primary_key.to_string())),
        }
    }

    /// New row for a key absent from storage.
    ///
    /// A proposed revision is kept when it is above anything published for
    /// the key, purged rows included; otherwise the row starts just above.
    fn create(
        &self,
        primary_key: PrimaryKey,
        fields: Fields,
        proposed: Option<RevisionId>,
    ) -> Document {
        let revision = match (proposed, self.inner.bus.revision_floor(&primary_key)) {
            (Some(revision), Some(floor)) if revision <= floor => floor.next(),
            (Some(revision), _) => revision,
            (None, Some(floor)) => floor.next(),
            (None, None) => RevisionId::first(),
        };

        let mut document =
            Document::new(primary_key, fields, self.inner.schema.version, now_millis());
        document.revision = revision;
        document
    }

    fn checked_fields(&self, value: serde_json::Value) -> Result<Fields> {
        let fields = into_fields(value)?;
        self.inner.schema.validate_payload(&fields)?;
        Ok(fields)
    }

    /// Store a document and publish it. Caller holds the writer.
    fn commit(&self, document: Document) {
        tracing::trace!(
            collection = %self.name(),
            document = %document.primary_key,
            revision = %document.revision,
            deleted = document.deleted,
            "Committing write"
        );
        self.inner.storage.write(self.name(), document.clone());
        self.inner.bus.publish(document);
    }

    // Replicated writes

    /// Apply a replicated batch under the writer.
    ///
    /// Once the writer is held nothing awaits, so a caller dropped mid-way
    /// either applied the whole batch or none of it.
    pub(crate) async fn apply_remote(
        &self,
        incoming: Vec<IncomingDocument>,
    ) -> Result<RemoteWriteOutcome> {
        let _writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        let mut outcome = RemoteWriteOutcome::default();
        for document in incoming {
            match self.resolve_remote(document) {
                Ok(Some(written)) => {
                    self.commit(written.clone());
                    outcome.applied.push(written);
                }
                Ok(None) => {}
                Err(err) => outcome.unresolved.push(err),
            }
        }
        Ok(outcome)
    }

    fn resolve_remote(&self, incoming: IncomingDocument) -> Result<Option<Document>> {
        let version = self.inner.schema.version;
        let now = now_millis();

        let Some(local) = self.inner.storage.get(self.name(), &incoming.primary_key) else {
            let mut document =
                self.create(incoming.primary_key, incoming.fields, incoming.revision);
            document.metadata.origin = Origin::Remote;
            document.deleted = incoming.deleted;
            return Ok(Some(document));
        };

        if incoming.revision.as_ref() == Some(&local.revision) {
            tracing::trace!(
                collection = %self.name(),
                document = %local.primary_key,
                "Replicated revision already stored"
            );
            return Ok(None);
        }

        let conflict = Conflict {
            local: &local,
            incoming: &incoming.fields,
            incoming_revision: incoming.revision.as_ref(),
            incoming_deleted: incoming.deleted,
        };
        match self.inner.conflict_handler.resolve(&conflict) {
            ConflictResolution::LocalWins => {
                tracing::debug!(
                    collection = %self.name(),
                    document = %local.primary_key,
                    "Local revision kept"
                );
                Ok(None)
            }
            ConflictResolution::RemoteWins => {
                let revision = match incoming.revision {
                    Some(revision) if revision > local.revision => revision,
                    _ => local.revision.next(),
                };
                let mut document = local;
                document.fields = incoming.fields;
                document.deleted = incoming.deleted;
                document.revision = revision;
                document.metadata.touch(now, Origin::Remote);
                document.metadata.schema_version = version;
                Ok(Some(document))
            }
            ConflictResolution::Unresolved(reason) => {
                tracing::warn!(
                    collection = %self.name(),
                    document = %local.primary_key,
                    %reason,
                    "Conflict left unresolved"
                );
                Err(Error::ConflictUnresolved {
                    document: local.primary_key,
                    reason,
                })
            }
        }
    }

    // Reads

    /// Query the first document matching `selector`.
    pub fn find_one(&self, selector: impl Into<Selector>) -> FindOne {
        FindOne::new(self.clone(), selector.into())
    }

    /// Query every document matching `selector`, or all with `None`.
    pub fn find(&self, selector: Option<Selector>) -> Find {
        Find::new(self.clone(), selector)
    }

    /// Number of active documents.
    pub async fn count(&self) -> Result<usize> {
        self.ready().await?;
        Ok(self.inner.storage.count(self.name(), false))
    }

    /// Purge tombstones.
    ///
    /// Skipped while the collection has replication checkpoints, since a
    /// replication may still need to see the deletions.
    pub async fn cleanup(&self) -> Result<usize> {
        self.ready().await?;
        let _writer = self.inner.writer.lock().await;
        self.ensure_open()?;

        if self.inner.storage.has_checkpoints(self.name()) {
            tracing::debug!(collection = %self.name(), "Cleanup skipped, checkpoints present");
            return Ok(0);
        }
        let purged = self.inner.storage.purge_tombstones(self.name());
        self.inner
            .bus
            .forget(purged.iter().map(|d| d.primary_key.as_str()));
        tracing::debug!(collection = %self.name(), purged = purged.len(), "Purged tombstones");
        Ok(purged.len())
    }

    // Replication

    /// Start a pull replication into this collection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn replicate(&self, options: ReplicationOptions) -> Result<ReplicationHandle> {
        self.ensure_open()?;
        tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Config(format!("replication needs a tokio runtime: {e}")))?;

        match self.inner.replications.entry(options.identifier.clone()) {
            Entry::Occupied(slot) if !slot.get().is_finished() => {
                Err(Error::ReplicationAlreadyRunning(options.identifier))
            }
            Entry::Occupied(mut slot) => {
                tracing::debug!(
                    collection = %self.name(),
                    identifier = %options.identifier,
                    "Restarting finished replication"
                );
                slot.get().halt();
                let handle = ReplicationHandle::start(self.clone(), options);
                slot.insert(handle.clone());
                Ok(handle)
            }
            Entry::Vacant(slot) => {
                let handle = ReplicationHandle::start(self.clone(), options);
                slot.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    /// Drop `handle` from the registry, unless its identifier was reused.
    pub(crate) fn unregister_replication(&self, handle: &ReplicationHandle) {
        self.inner
            .replications
            .remove_if(handle.identifier(), |_, registered| registered.same_as(handle));
    }

    /// Identifiers of registered replications, finished ones included.
    pub fn replication_identifiers(&self) -> Vec<String> {
        self.inner
            .replications
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Close the collection, cancelling its replications.
    ///
    /// Further operations fail with [`Error::CollectionClosed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wake callers still waiting for the migration gate
        self.inner.migration.send_modify(|_| {});

        let handles: Vec<ReplicationHandle> = self
            .inner
            .replications
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for handle in handles {
            handle.cancel().await;
        }
        tracing::debug!(collection = %self.name(), "Collection closed");
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", self.name())
            .field("version", &self.inner.schema.version)
            .field("migration", &self.migration_status())
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn into_fields(value: serde_json::Value) -> Result<Fields> {
    match value {
        serde_json::Value::Object(fields) => Ok(fields),
        other => Err(Error::InvalidPayload(format!(
            "document must be an object, got {other}"
        ))),
    }
}
