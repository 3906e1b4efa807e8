//! Queries over a collection.
//!
//! A [`Selector`] picks documents either by primary key or by field
//! equality. Tombstones never match. Queries run once with `exec` or keep
//! emitting results with `observe`, which is fed by the collection's change
//! event bus.

use std::collections::BTreeMap;

use futures::stream::{self, BoxStream, StreamExt};

use crate::{error::Result, Collection, Document, Error, Fields, PrimaryKey};

/// Which documents a query matches.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// The document with this primary key
    Key(PrimaryKey),
    /// Documents whose fields equal every listed value
    Fields(Fields),
}

impl Selector {
    /// Build a selector from a JSON value.
    ///
    /// A string selects by primary key, an object by field equality.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(key) => Ok(Selector::Key(key)),
            serde_json::Value::Object(fields) => Ok(Selector::Fields(fields)),
            other => Err(Error::InvalidPayload(format!(
                "selector must be a string or an object, got {other}"
            ))),
        }
    }

    /// Whether an active document matches.
    pub fn matches(&self, document: &Document) -> bool {
        if document.deleted {
            return false;
        }
        match self {
            Selector::Key(key) => &document.primary_key == key,
            Selector::Fields(fields) => fields
                .iter()
                .all(|(name, value)| document.fields.get(name) == Some(value)),
        }
    }

    /// Primary key pinned by this selector, if any.
    fn key_hint(&self, primary_key_field: &str) -> Option<PrimaryKey> {
        match self {
            Selector::Key(key) => Some(key.clone()),
            Selector::Fields(fields) => fields
                .get(primary_key_field)
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }
}

impl From<&str> for Selector {
    fn from(key: &str) -> Self {
        Selector::Key(key.to_string())
    }
}

impl From<String> for Selector {
    fn from(key: String) -> Self {
        Selector::Key(key)
    }
}

impl From<Fields> for Selector {
    fn from(fields: Fields) -> Self {
        Selector::Fields(fields)
    }
}

/// Query for the first matching document, in primary-key order.
#[derive(Debug, Clone)]
pub struct FindOne {
    collection: Collection,
    selector: Selector,
}

impl FindOne {
    pub(crate) fn new(collection: Collection, selector: Selector) -> Self {
        Self {
            collection,
            selector,
        }
    }

    /// Run the query once.
    pub async fn exec(&self) -> Result<Option<Document>> {
        self.collection.ready().await?;
        let name = self.collection.name();

        if let Some(key) = self.selector.key_hint(&self.collection.schema().primary_key) {
            let found = self.collection.storage().get(name, &key);
            return Ok(found.filter(|d| self.selector.matches(d)));
        }

        let selector = &self.selector;
        Ok(self
            .collection
            .storage()
            .filter(name, |d| selector.matches(d))
            .into_iter()
            .next())
    }

    /// Observe the query result.
    ///
    /// The stream yields the current result first, then a new value each
    /// time the result changes. It ends when the collection is dropped.
    pub async fn observe(&self) -> Result<BoxStream<'static, Option<Document>>> {
        self.collection.ready().await?;

        let selector = self.selector.clone();
        let mut subscription = match selector.key_hint(&self.collection.schema().primary_key) {
            Some(key) => self
                .collection
                .bus()
                .subscribe(move |d| d.primary_key == key),
            None => self.collection.bus().subscribe(|_| true),
        };

        let mut matches = BTreeMap::new();
        for document in subscription.drain() {
            track(&selector, &mut matches, document);
        }
        let initial = matches.values().next().cloned();

        let state = ObserveState {
            subscription,
            selector,
            matches,
            last: initial.clone(),
        };
        let updates = stream::unfold(state, |mut state| async move {
            loop {
                let document = state.subscription.recv().await?;
                track(&state.selector, &mut state.matches, document);

                let best = state.matches.values().next().cloned();
                if best != state.last {
                    state.last = best.clone();
                    return Some((best, state));
                }
            }
        });

        Ok(stream::once(async move { initial }).chain(updates).boxed())
    }
}

struct ObserveState {
    subscription: crate::Subscription<Document>,
    selector: Selector,
    matches: BTreeMap<PrimaryKey, Document>,
    last: Option<Document>,
}

fn track(selector: &Selector, matches: &mut BTreeMap<PrimaryKey, Document>, document: Document) {
    if selector.matches(&document) {
        matches.insert(document.primary_key.clone(), document);
    } else {
        matches.remove(&document.primary_key);
    }
}

/// Query for every matching document, in primary-key order.
#[derive(Debug, Clone)]
pub struct Find {
    collection: Collection,
    selector: Option<Selector>,
}

impl Find {
    pub(crate) fn new(collection: Collection, selector: Option<Selector>) -> Self {
        Self {
            collection,
            selector,
        }
    }

    /// Run the query once.
    pub async fn exec(&self) -> Result<Vec<Document>> {
        self.collection.ready().await?;
        let selector = self.selector.as_ref();
        Ok(self
            .collection
            .storage()
            .filter(self.collection.name(), |d| {
                selector.map_or(true, |s| s.matches(d))
            }))
    }

    /// Number of matching documents.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.exec().await?.len())
    }
}
