//! Process-local document store.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{
    compare_values, field_value, DocKey, Direction, Document, DocumentStore, Query, StoreError,
    StoredDocument, WriteBatch, DEFAULT_BATCH_LIMIT,
};

/// In-memory backend. Commits are applied under a single write lock, so a batch is
/// observed either entirely or not at all.
#[derive(Debug)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Document>>>,
    max_batch_size: usize,
    offline: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_batch_limit(DEFAULT_BATCH_LIMIT)
    }

    pub fn with_batch_limit(max_batch_size: usize) -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            max_batch_size: max_batch_size.max(1),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate a network outage: every operation fails with `Unavailable` while set
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of documents in a collection
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, key: &DocKey) -> Result<Option<Document>, StoreError> {
        self.ensure_online()?;
        Ok(self
            .collections
            .read()
            .get(&key.collection)
            .and_then(|docs| docs.get(&key.id))
            .cloned())
    }

    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>, StoreError> {
        self.ensure_online()?;

        let mut results: Vec<StoredDocument> = {
            let collections = self.collections.read();
            let Some(docs) = collections.get(&query.collection) else {
                return Ok(Vec::new());
            };
            docs.iter()
                .filter(|(_, data)| query.matches(data))
                .map(|(id, data)| StoredDocument {
                    id: id.clone(),
                    data: data.clone(),
                })
                .collect()
        };

        if let Some((field, direction)) = &query.order_by {
            // Documents without the field sort first; ties keep id order
            results.sort_by(|a, b| {
                let ordering = match (field_value(&a.data, field), field_value(&b.data, field)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(std::cmp::Ordering::Equal),
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                match direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            });
        }

        if let Some(limit) = query.limit {
            results.truncate(limit);
        }

        Ok(results)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        self.ensure_online()?;
        batch.ensure_within(self.max_batch_size)?;

        let mut collections = self.collections.write();

        // Stage every write against a private view first; nothing is published unless
        // all preconditions hold.
        let mut staged: BTreeMap<DocKey, Option<Document>> = BTreeMap::new();
        for write in batch.writes() {
            let key = write.op.key();
            let current = match staged.get(key) {
                Some(doc) => doc.clone(),
                None => collections
                    .get(&key.collection)
                    .and_then(|docs| docs.get(&key.id))
                    .cloned(),
            };

            if let Some(precondition) = &write.precondition {
                precondition.check(key, current.as_ref())?;
            }

            let next = write.op.apply(current)?;
            staged.insert(key.clone(), next);
        }

        for (key, doc) in staged {
            match doc {
                Some(doc) => {
                    collections
                        .entry(key.collection)
                        .or_default()
                        .insert(key.id, doc);
                }
                None => {
                    if let Some(docs) = collections.get_mut(&key.collection) {
                        docs.remove(&key.id);
                    }
                }
            }
        }

        Ok(())
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }
}
