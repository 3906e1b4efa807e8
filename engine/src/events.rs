//! Change event bus.
//!
//! Every write to a collection is published here after it reached storage.
//! Subscribers receive document snapshots: first the current snapshots
//! matching their predicate, then every later change that matches.
//!
//! Publishing is serialized through one lock per bus, and for a given
//! primary key a snapshot older than the last published one is dropped, so
//! no subscriber ever observes a revision going backwards.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::fanout::{Fanout, Subscription};
use crate::{CollectionName, Document, PrimaryKey, RevisionId};

/// Fans out document changes of one collection to subscribers.
pub struct ChangeEventBus {
    collection: CollectionName,
    /// Most recent published snapshot per primary key
    latest: Mutex<BTreeMap<PrimaryKey, Document>>,
    /// Highest revision among forgotten snapshots
    forgotten: Mutex<Option<RevisionId>>,
    fanout: Arc<Fanout<Document>>,
}

impl ChangeEventBus {
    /// Create a bus whose current state is `documents`.
    pub fn new(
        collection: impl Into<CollectionName>,
        documents: impl IntoIterator<Item = Document>,
    ) -> Self {
        let latest = documents
            .into_iter()
            .map(|d| (d.primary_key.clone(), d))
            .collect();

        Self {
            collection: collection.into(),
            latest: Mutex::new(latest),
            forgotten: Mutex::new(None),
            fanout: Fanout::new_shared(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<PrimaryKey, Document>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish a written document.
    ///
    /// Returns `false` when the snapshot is not newer than the last one
    /// published for its key; such snapshots are not delivered.
    pub fn publish(&self, document: Document) -> bool {
        let mut latest = self.lock();

        if let Some(previous) = latest.get(&document.primary_key) {
            if document.revision <= previous.revision {
                tracing::debug!(
                    collection = %self.collection,
                    document = %document.primary_key,
                    revision = %document.revision,
                    current = %previous.revision,
                    "Dropping stale change event"
                );
                return false;
            }
        }

        let recipients = self.fanout.broadcast(&document);
        tracing::trace!(
            collection = %self.collection,
            document = %document.primary_key,
            revision = %document.revision,
            recipients,
            "Published change event"
        );
        latest.insert(document.primary_key.clone(), document);
        true
    }

    /// Subscribe to snapshots matching `predicate`.
    ///
    /// The subscription starts with the current matching snapshot of every
    /// key (tombstones included when the predicate accepts them), in
    /// primary-key order, followed by subsequent changes.
    pub fn subscribe<F>(&self, predicate: F) -> Subscription<Document>
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        // Held across registration so no publish slips between seed and live
        let latest = self.lock();
        let seed: Vec<Document> = latest
            .values()
            .filter(|d| predicate(d))
            .cloned()
            .collect();
        self.fanout.register(Some(Box::new(predicate)), seed)
    }

    /// Most recent published snapshot for a key.
    pub fn latest(&self, primary_key: &str) -> Option<Document> {
        self.lock().get(primary_key).cloned()
    }

    /// Drop the snapshots of rows purged from storage.
    ///
    /// Their revisions are folded into one floor, see
    /// [`revision_floor`](Self::revision_floor).
    pub fn forget<'a>(&self, primary_keys: impl IntoIterator<Item = &'a str>) {
        let mut latest = self.lock();
        let mut forgotten = self
            .forgotten
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for key in primary_keys {
            let Some(document) = latest.remove(key) else {
                continue;
            };
            if forgotten.as_ref().map_or(true, |floor| document.revision > *floor) {
                *forgotten = Some(document.revision);
            }
        }
    }

    /// Revision a new document under `primary_key` must exceed.
    ///
    /// The key's last snapshot when there is one, otherwise the highest
    /// forgotten revision, so a key recreated after a purge never goes
    /// backwards for subscribers that saw its tombstone.
    pub fn revision_floor(&self, primary_key: &str) -> Option<RevisionId> {
        let latest = self.lock();
        if let Some(document) = latest.get(primary_key) {
            return Some(document.revision.clone());
        }
        self.forgotten
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.fanout.subscriber_count()
    }
}

impl std::fmt::Debug for ChangeEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeEventBus")
            .field("collection", &self.collection)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
