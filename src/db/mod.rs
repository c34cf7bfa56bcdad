//! Document store abstraction.
//!
//! The engine talks to its backend through [`DocumentStore`], a collection-of-documents
//! key/value interface: get-by-id, filtered and ordered queries, field-path merges,
//! deletes and bounded atomic batch commits with optional per-write preconditions.
//! Two backends ship with the crate: [`MemoryStore`] and [`SqliteStore`].

mod batch;
mod memory;
mod models;
mod seeders;
mod sqlite;

pub use batch::{BatchStats, BatchWriter};
pub use memory::MemoryStore;
pub use models::*;
pub use seeders::{preset_templates, seed_catalog, SeedStats};
pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};

/// A document body: a JSON object
pub type Document = Map<String, Value>;

/// Shared handle to the configured backend
pub type Store = Arc<dyn DocumentStore>;

/// Default maximum number of writes accepted by a single atomic commit
pub const DEFAULT_BATCH_LIMIT: usize = 500;

/// Errors raised by document store backends
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocKey),

    #[error("precondition failed for {0}")]
    PreconditionFailed(DocKey),

    #[error("batch of {size} writes exceeds backend limit of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("invalid field path: {0:?}")]
    InvalidField(String),

    #[error("unrecognised document id: {0}")]
    UnknownId(DocKey),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed document: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Fully qualified document address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey {
    pub collection: String,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document returned from a query, with its id
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub data: Document,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
        }
    }

    fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            FilterOp::Eq => ordering == Ordering::Equal,
            FilterOp::Lt => ordering == Ordering::Less,
            FilterOp::Le => ordering != Ordering::Greater,
            FilterOp::Gt => ordering == Ordering::Greater,
            FilterOp::Ge => ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Equality/range query over one collection
#[derive(Debug, Clone)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a document satisfies every filter of this query
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters.iter().all(|filter| {
            field_value(doc, &filter.field)
                .and_then(|value| compare_values(value, &filter.value))
                .map(|ordering| filter.op.accepts(ordering))
                .unwrap_or(false)
        })
    }
}

/// Condition a write requires of the current document state
#[derive(Debug, Clone, PartialEq)]
pub enum Precondition {
    /// The document must exist
    Exists,
    /// The document must not exist
    Missing,
    /// The document must exist and `field` must equal `value`
    FieldEquals { field: String, value: Value },
}

impl Precondition {
    pub fn field_equals(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Precondition::FieldEquals {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn check(&self, key: &DocKey, current: Option<&Document>) -> Result<(), StoreError> {
        let holds = match (self, current) {
            (Precondition::Exists, current) => current.is_some(),
            (Precondition::Missing, current) => current.is_none(),
            (Precondition::FieldEquals { .. }, None) => false,
            (Precondition::FieldEquals { field, value }, Some(doc)) => {
                field_value(doc, field) == Some(value)
            }
        };

        if holds {
            Ok(())
        } else {
            Err(StoreError::PreconditionFailed(key.clone()))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the whole document
    Set { key: DocKey, data: Document },
    /// Set individual dotted field paths, creating the document when absent.
    /// A path replaces whatever value it addresses; sibling fields are kept.
    Merge { key: DocKey, fields: Vec<(String, Value)> },
    /// Remove the document; deleting a missing document is a no-op
    Delete { key: DocKey },
}

impl WriteOp {
    pub fn key(&self) -> &DocKey {
        match self {
            WriteOp::Set { key, .. } | WriteOp::Merge { key, .. } | WriteOp::Delete { key } => key,
        }
    }

    /// Compute the document that results from applying this write to `current`.
    /// `None` means the document is absent afterwards.
    pub fn apply(&self, current: Option<Document>) -> Result<Option<Document>, StoreError> {
        match self {
            WriteOp::Set { data, .. } => Ok(Some(data.clone())),
            WriteOp::Merge { fields, .. } => {
                let mut doc = current.unwrap_or_default();
                for (path, value) in fields {
                    merge_field(&mut doc, path, value.clone())?;
                }
                Ok(Some(doc))
            }
            WriteOp::Delete { .. } => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub op: WriteOp,
    pub precondition: Option<Precondition>,
}

/// An ordered set of writes committed atomically: either every write lands or none does
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp, precondition: Option<Precondition>) -> &mut Self {
        self.writes.push(Write { op, precondition });
        self
    }

    pub fn set(&mut self, key: DocKey, data: Document) -> &mut Self {
        self.push(WriteOp::Set { key, data }, None)
    }

    pub fn merge(&mut self, key: DocKey, fields: Vec<(String, Value)>) -> &mut Self {
        self.push(WriteOp::Merge { key, fields }, None)
    }

    pub fn delete(&mut self, key: DocKey) -> &mut Self {
        self.push(WriteOp::Delete { key }, None)
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }

    pub fn ensure_within(&self, limit: usize) -> Result<(), StoreError> {
        if self.writes.len() > limit {
            return Err(StoreError::BatchTooLarge {
                size: self.writes.len(),
                limit,
            });
        }
        Ok(())
    }
}

/// Generic persistent document backend
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, key: &DocKey) -> Result<Option<Document>, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError>;

    /// Apply every write in the batch atomically, or none of them
    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;

    /// Largest batch `commit` accepts
    fn max_batch_size(&self) -> usize;

    async fn set(&self, key: &DocKey, data: Document) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.set(key.clone(), data);
        self.commit(batch).await
    }

    async fn merge(&self, key: &DocKey, fields: Vec<(String, Value)>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.merge(key.clone(), fields);
        self.commit(batch).await
    }

    async fn delete(&self, key: &DocKey) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.delete(key.clone());
        self.commit(batch).await
    }
}

/// Open the backend selected in configuration
pub async fn init(config: &StorageConfig) -> Result<Store> {
    match config.backend {
        StorageBackend::Memory => {
            info!("Using in-memory document store (data is not persisted)");
            Ok(Arc::new(MemoryStore::with_batch_limit(config.batch_limit)))
        }
        StorageBackend::Sqlite => {
            let store =
                SqliteStore::open(&config.data_dir, config.max_connections, config.batch_limit)
                    .await?;
            Ok(Arc::new(store))
        }
    }
}

fn split_path(path: &str) -> Result<Vec<&str>, StoreError> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(StoreError::InvalidField(path.to_string()));
    }
    Ok(segments)
}

/// Set `value` at a dotted `path`, creating intermediate objects as needed
pub(crate) fn merge_field(doc: &mut Document, path: &str, value: Value) -> Result<(), StoreError> {
    let segments = split_path(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Err(StoreError::InvalidField(path.to_string()));
    };

    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        current = match entry {
            Value::Object(map) => map,
            _ => return Err(StoreError::InvalidField(path.to_string())),
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

/// Read the value at a dotted `path`
pub(crate) fn field_value<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut value = doc.get(segments.next()?)?;
    for segment in segments {
        value = value.as_object()?.get(segment)?;
    }
    Some(value)
}

/// Order two JSON scalars of the same kind; mixed kinds are incomparable
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
