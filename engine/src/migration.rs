//! Migration engine.
//!
//! When a collection is opened against a newer schema version, every stored
//! document below that version is upgraded through the registry's strategy
//! chain. Rewrites are buffered and committed to storage in one atomic bulk
//! write; a failing strategy aborts the migration with nothing committed.
//!
//! The status only turns [`MigrationStatus::Done`] after the commit and after
//! the migrated documents were published, so anything gated on `Done`
//! (reads, local writes, replication) never sees a pre-migration shape.

use crate::document::now_millis;
use crate::{
    error::Result, CollectionSchema, ChangeEventBus, Document, Error, MemoryStorage, Origin,
    SchemaRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Progress of a running migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgress {
    /// Documents processed so far
    pub handled: usize,
    /// Documents that need migration
    pub total: usize,
}

impl MigrationProgress {
    /// Completion in percent.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((self.handled * 100) / self.total).min(100) as u8
    }
}

/// Migration state of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state", content = "detail")]
pub enum MigrationStatus {
    NotStarted,
    Running(MigrationProgress),
    Done,
    Failed(String),
}

impl MigrationStatus {
    /// Whether the migration reached a final state.
    pub fn is_finished(&self) -> bool {
        matches!(self, MigrationStatus::Done | MigrationStatus::Failed(_))
    }
}

/// Summary of a finished migration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    /// Documents rewritten to the target shape
    pub migrated: usize,
    /// Documents dropped (tombstoned) by a strategy
    pub dropped: usize,
}

/// Runs the strategy chain over one collection's stale documents.
///
/// The caller must hold the collection's writer for the whole run.
pub(crate) struct MigrationEngine<'a> {
    pub(crate) schema: &'a CollectionSchema,
    pub(crate) registry: &'a SchemaRegistry,
    pub(crate) storage: &'a MemoryStorage,
    pub(crate) bus: &'a ChangeEventBus,
    pub(crate) status: &'a watch::Sender<MigrationStatus>,
}

impl MigrationEngine<'_> {
    pub(crate) async fn run(&self) -> Result<MigrationReport> {
        let collection = &self.schema.name;
        let target = self.registry.current_version();

        if let Some(newest) = self.storage.max_schema_version(collection) {
            if newest > target {
                let err = Error::SchemaVersionMismatch {
                    expected: target,
                    actual: newest,
                };
                self.status
                    .send_replace(MigrationStatus::Failed(err.to_string()));
                return Err(err);
            }
        }

        let stale = self.storage.documents_below_version(collection, target);
        let total = stale.len();
        tracing::info!(
            collection = %collection,
            target_version = target,
            documents = total,
            "Starting migration"
        );
        self.status
            .send_replace(MigrationStatus::Running(MigrationProgress { handled: 0, total }));
        let _interrupted = InterruptGuard(self.status);

        let mut report = MigrationReport::default();
        let mut rewrites = Vec::with_capacity(total);

        for (index, document) in stale.into_iter().enumerate() {
            let was_active = document.is_active();
            match self.migrate_document(document) {
                Ok(migrated) => {
                    if was_active && migrated.deleted {
                        report.dropped += 1;
                    } else if was_active {
                        report.migrated += 1;
                    }
                    rewrites.push((was_active, migrated));
                }
                Err(reason) => {
                    tracing::error!(collection = %collection, %reason, "Migration failed");
                    self.status
                        .send_replace(MigrationStatus::Failed(reason.clone()));
                    return Err(Error::MigrationStepFailed {
                        collection: collection.clone(),
                        reason,
                    });
                }
            }

            self.status
                .send_replace(MigrationStatus::Running(MigrationProgress {
                    handled: index + 1,
                    total,
                }));
            tokio::task::yield_now().await;
        }

        self.storage.bulk_write(
            collection,
            rewrites.iter().map(|(_, d)| d.clone()).collect(),
        );
        for (was_active, document) in rewrites {
            // Re-stamped tombstones keep their revision, nothing to observe
            if was_active {
                self.bus.publish(document);
            }
        }

        self.status.send_replace(MigrationStatus::Done);
        tracing::info!(
            collection = %collection,
            migrated = report.migrated,
            dropped = report.dropped,
            "Migration done"
        );
        Ok(report)
    }

    /// Upgrade one document to the target version.
    fn migrate_document(&self, mut document: Document) -> std::result::Result<Document, String> {
        let from_version = document.metadata.schema_version;
        let target = self.registry.current_version();

        if document.deleted {
            document.metadata.schema_version = target;
            return Ok(document);
        }

        let chain = self
            .registry
            .strategy_chain(from_version)
            .map_err(|e| e.to_string())?;

        let mut fields = document.fields.clone();
        let mut version = from_version;
        for strategy in chain {
            match strategy.apply(fields.clone()) {
                Ok(Some(next)) => fields = next,
                Ok(None) => {
                    tracing::debug!(
                        document = %document.primary_key,
                        from_version = version,
                        "Strategy dropped document"
                    );
                    document.fields = fields;
                    document.mark_deleted(now_millis(), Origin::Local);
                    document.metadata.schema_version = target;
                    return Ok(document);
                }
                Err(reason) => {
                    return Err(format!(
                        "document '{}' from version {}: {}",
                        document.primary_key, version, reason
                    ));
                }
            }
            version += 1;
        }

        let key = self
            .schema
            .primary_key_of(&fields)
            .map_err(|e| format!("document '{}': {}", document.primary_key, e))?;
        if key != document.primary_key {
            return Err(format!(
                "document '{}': strategy changed the primary key to '{}'",
                document.primary_key, key
            ));
        }
        self.schema
            .validate_payload(&fields)
            .map_err(|e| format!("document '{}': {}", document.primary_key, e))?;

        document.write_fields(fields, now_millis(), Origin::Local);
        document.metadata.schema_version = target;
        Ok(document)
    }
}

const INTERRUPTED: &str = "migration interrupted";

/// Turns a migration left `Running` into a failed one when dropped.
///
/// Reached when a strategy panics or the `run` future is dropped midway.
struct InterruptGuard<'a>(&'a watch::Sender<MigrationStatus>);

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        let interrupted = self.0.send_if_modified(|status| {
            if !matches!(status, MigrationStatus::Running(_)) {
                return false;
            }
            *status = MigrationStatus::Failed(INTERRUPTED.to_string());
            true
        });
        if interrupted {
            tracing::error!("Migration interrupted");
        }
    }
}
