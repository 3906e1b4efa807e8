//! Database: a named set of collections over one storage.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::collection::{Collection, CollectionOptions};
use crate::{error::Result, CollectionName, EngineConfig, Error, MemoryStorage};

/// Entry point for opening collections.
///
/// Closing a database and opening a new one over the same
/// [`MemoryStorage`] is how a restart is modelled.
pub struct Database {
    name: String,
    storage: MemoryStorage,
    config: EngineConfig,
    collections: DashMap<CollectionName, Collection>,
}

impl Database {
    /// Open a database over `storage`.
    pub fn open(name: impl Into<String>, storage: MemoryStorage, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        tracing::info!(database = %name, "Opening database");

        Ok(Self {
            name,
            storage,
            config,
            collections: DashMap::new(),
        })
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Underlying storage.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Add a collection.
    ///
    /// With `auto_migrate` (the default) the migration runs before this
    /// returns, and a failed migration fails the call.
    pub async fn add_collection(&self, options: CollectionOptions) -> Result<Collection> {
        let name = options.schema.name.clone();
        let auto_migrate = options.auto_migrate;

        let collection = {
            let slot = match self.collections.entry(name.clone()) {
                Entry::Occupied(_) => {
                    return Err(Error::CollectionAlreadyExists(name));
                }
                Entry::Vacant(slot) => slot,
            };
            let collection = Collection::open(self.storage.clone(), options, self.config.clone())?;
            slot.insert(collection.clone());
            collection
        };

        if auto_migrate {
            if let Err(err) = collection.migrate().await {
                tracing::error!(database = %self.name, collection = %name, error = %err, "Migration on open failed");
                return Err(err);
            }
        }

        tracing::info!(database = %self.name, collection = %name, "Collection added");
        Ok(collection)
    }

    /// Get an open collection.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.collections
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Names of the open collections.
    pub fn collection_names(&self) -> Vec<CollectionName> {
        let mut names: Vec<_> = self.collections.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Close every collection, cancelling their replications.
    pub async fn close(&self) {
        let collections: Vec<Collection> = self
            .collections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for collection in &collections {
            collection.close().await;
        }
        self.collections.clear();
        tracing::info!(database = %self.name, "Database closed");
    }

    /// Close the database and wipe its storage.
    pub async fn remove(self) {
        self.close().await;
        self.storage.clear();
        tracing::info!(database = %self.name, "Database removed");
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("collections", &self.collection_names())
            .finish()
    }
}
