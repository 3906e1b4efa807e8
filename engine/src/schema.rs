//! Schema definition, validation and migration strategies.
//!
//! A [`CollectionSchema`] describes the current shape of a collection's
//! documents. The [`SchemaRegistry`] tracks the version history of that
//! shape and the chain of [`MigrationStrategy`] functions that upgrade
//! documents stored under an older version.

use crate::{error::Result, CollectionName, Error, Fields, SchemaVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Type of a document field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since the epoch
    Timestamp,
    /// Any JSON value, nested objects included
    Json,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }

    /// Whether a non-null value has this type. Integers are valid floats.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        let integral = value.as_i64().is_some() || value.as_u64().is_some();
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int | FieldType::Timestamp => integral,
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared field of a collection schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Absent and `null` values are rejected when set
    pub required: bool,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: FieldType, required: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            required,
        }
    }

    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, field_type, true)
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self::new(name, field_type, false)
    }

    /// Check the value stored under this field, `None` when absent.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        let value = match value {
            Some(serde_json::Value::Null) | None if self.required => {
                return Err(Error::MissingRequiredField(self.name.clone()));
            }
            Some(serde_json::Value::Null) | None => return Ok(()),
            Some(value) => value,
        };

        if !self.field_type.accepts(value) {
            return Err(self.mismatch(value));
        }
        Ok(())
    }

    fn mismatch(&self, value: &serde_json::Value) -> Error {
        Error::TypeMismatch {
            field: self.name.clone(),
            expected: self.field_type.to_string(),
            got: value_kind(value).to_string(),
        }
    }
}

/// Name of a JSON value's kind, in the same vocabulary as [`FieldType`].
fn value_kind(value: &serde_json::Value) -> &'static str {
    use serde_json::Value;

    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_f64() => "Float",
        Value::Number(_) => "Int",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Shape of a collection's documents at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: CollectionName,
    /// Version new and migrated documents are stamped with
    pub version: SchemaVersion,
    /// Field holding the primary key, always a non-empty string
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn new(
        name: impl Into<CollectionName>,
        version: SchemaVersion,
        primary_key: impl Into<String>,
        fields: Vec<FieldDef>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            primary_key: primary_key.into(),
            fields,
        }
    }

    /// Check a document's fields: primary key first, then every declared field.
    ///
    /// Undeclared fields are allowed.
    pub fn validate_payload(&self, fields: &Fields) -> Result<()> {
        self.primary_key_of(fields)?;
        self.fields
            .iter()
            .try_for_each(|def| def.validate(fields.get(&def.name)))
    }

    /// Like [`validate_payload`](Self::validate_payload) for a raw JSON value.
    pub fn validate_value(&self, payload: &serde_json::Value) -> Result<()> {
        match payload {
            serde_json::Value::Object(fields) => self.validate_payload(fields),
            other => Err(Error::InvalidPayload(format!(
                "document must be a JSON object, got {}",
                value_kind(other)
            ))),
        }
    }

    /// The primary key stored in `fields`.
    pub fn primary_key_of<'a>(&self, fields: &'a Fields) -> Result<&'a str> {
        match fields.get(&self.primary_key) {
            Some(serde_json::Value::String(key)) if !key.is_empty() => Ok(key),
            Some(serde_json::Value::String(_)) => Err(Error::InvalidPayload(format!(
                "primary key '{}' must not be empty",
                self.primary_key
            ))),
            Some(other) => Err(Error::TypeMismatch {
                field: self.primary_key.clone(),
                expected: FieldType::String.to_string(),
                got: value_kind(other).to_string(),
            }),
            None => Err(Error::MissingRequiredField(self.primary_key.clone())),
        }
    }
}

type StrategyFn =
    dyn Fn(Fields) -> std::result::Result<Option<Fields>, String> + Send + Sync + 'static;

/// Transform from one schema version's document shape to the next.
///
/// Returning `None` drops the document during migration (it is tombstoned).
/// Returning an error aborts the whole migration.
#[derive(Clone)]
pub struct MigrationStrategy(Arc<StrategyFn>);

impl MigrationStrategy {
    /// Create an infallible strategy.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Fields) -> Option<Fields> + Send + Sync + 'static,
    {
        Self(Arc::new(move |fields| Ok(f(fields))))
    }

    /// Create a strategy that may fail.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(Fields) -> std::result::Result<Option<Fields>, String> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// A strategy that keeps the document unchanged.
    pub fn identity() -> Self {
        Self::new(Some)
    }

    /// Run the strategy on one document's fields.
    pub fn apply(&self, fields: Fields) -> std::result::Result<Option<Fields>, String> {
        (self.0)(fields)
    }
}

impl fmt::Debug for MigrationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MigrationStrategy(..)")
    }
}

/// Version history of one collection's schema.
///
/// Strategies are keyed by the version they migrate *from*.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    collection: CollectionName,
    current: SchemaVersion,
    strategies: BTreeMap<SchemaVersion, MigrationStrategy>,
}

impl SchemaRegistry {
    /// Create a registry whose only known version is 0.
    pub fn new(collection: impl Into<CollectionName>) -> Self {
        Self {
            collection: collection.into(),
            current: 0,
            strategies: BTreeMap::new(),
        }
    }

    /// Build a registry for `target` from strategies keyed by from-version.
    ///
    /// Every version below `target` must have a strategy; gaps fail fast.
    pub fn from_strategies(
        collection: impl Into<CollectionName>,
        target: SchemaVersion,
        strategies: BTreeMap<SchemaVersion, MigrationStrategy>,
    ) -> Result<Self> {
        let collection = collection.into();
        if let Some((&from_version, _)) = strategies.range(target..).next() {
            return Err(Error::UnexpectedMigrationStrategy {
                collection,
                from_version,
            });
        }

        let registry = Self {
            collection,
            current: target,
            strategies,
        };
        registry.validate()?;
        Ok(registry)
    }

    /// Register the next schema version.
    ///
    /// `strategy` migrates documents from `version - 1` into `version`.
    pub fn register_version(
        &mut self,
        version: SchemaVersion,
        strategy: Option<MigrationStrategy>,
    ) -> Result<()> {
        if version <= self.current {
            return Err(Error::SchemaVersionMismatch {
                expected: self.current + 1,
                actual: version,
            });
        }
        if let Some(strategy) = strategy {
            self.strategies.insert(version - 1, strategy);
        }
        self.current = version;
        Ok(())
    }

    /// Name of the collection this registry belongs to.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// The version documents must conform to.
    pub fn current_version(&self) -> SchemaVersion {
        self.current
    }

    /// Check that the chain from version 0 to current has no gaps.
    pub fn validate(&self) -> Result<()> {
        self.strategy_chain(0).map(|_| ())
    }

    /// Ordered strategies that upgrade a document stored at `from_version`.
    pub fn strategy_chain(&self, from_version: SchemaVersion) -> Result<Vec<MigrationStrategy>> {
        if from_version > self.current {
            return Err(Error::SchemaVersionMismatch {
                expected: self.current,
                actual: from_version,
            });
        }

        (from_version..self.current)
            .map(|version| {
                self.strategies.get(&version).cloned().ok_or_else(|| {
                    Error::MigrationStrategyMissing {
                        collection: self.collection.clone(),
                        from_version: version,
                    }
                })
            })
            .collect()
    }
}
