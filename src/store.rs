//! Boundary to the backing store under test.
//!
//! The engine only ever talks to the store through [`Connection`] and to the
//! deployment through [`ClusterHandle`]. [`MemoryStore`] is a small in-process
//! implementation used by the demo workloads and the test suite; it enforces a
//! unique `_id` per collection and applies every update atomically under a
//! single lock, which is enough to give conditional updates CAS semantics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::{Map, Value, json};

use crate::error::{COMMAND_NOT_FOUND, DUPLICATE_KEY, StoreError};

/// A stored document.
pub type Document = Map<String, Value>;

/// Builds a [`Document`] from a `json!` object literal. Non-objects yield an
/// empty document.
pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Counts reported by an update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateResult {
    pub matched: u64,
    pub modified: u64,
}

/// Client for the store under test.
///
/// Filters are equality matches on every field they name; an empty filter
/// matches every document.
pub trait Connection: Send + Sync {
    fn find(&self, collection: &str, filter: &Document) -> Result<Vec<Document>, StoreError>;

    fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError>;

    /// Sets the fields of `set` on matching documents. With `multi` false at
    /// most one document is modified.
    fn update(
        &self,
        collection: &str,
        filter: &Document,
        set: &Document,
        multi: bool,
    ) -> Result<UpdateResult, StoreError>;

    fn delete(&self, collection: &str, filter: &Document) -> Result<u64, StoreError>;

    fn run_command(&self, command: &Document) -> Result<Document, StoreError>;
}

/// Accessor for the deployment the store runs on.
pub trait ClusterHandle: Send + Sync {
    fn node_count(&self) -> usize;

    /// Runs `f` once against every node, stopping at the first failure.
    fn execute_on_all_nodes(
        &self,
        f: &mut dyn FnMut(&dyn Connection) -> Result<(), StoreError>,
    ) -> Result<(), StoreError>;
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, expected)| document.get(key) == Some(expected))
}

/// In-memory document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Document>>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing (or regaining) the connection: while unavailable every
    /// call fails with a host-unreachable error.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::unreachable())
        } else {
            Ok(())
        }
    }

    fn with_collections<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<Document>>) -> T) -> T {
        let mut guard = self
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl Connection for MemoryStore {
    fn find(&self, collection: &str, filter: &Document) -> Result<Vec<Document>, StoreError> {
        self.check_available()?;
        Ok(self.with_collections(|colls| {
            colls
                .get(collection)
                .map(|docs| docs.iter().filter(|d| matches(d, filter)).cloned().collect())
                .unwrap_or_default()
        }))
    }

    fn insert(&self, collection: &str, document: Document) -> Result<(), StoreError> {
        self.check_available()?;
        self.with_collections(|colls| {
            let docs = colls.entry(collection.to_string()).or_default();
            if let Some(id) = document.get("_id")
                && docs.iter().any(|d| d.get("_id") == Some(id))
            {
                return Err(StoreError::new(
                    DUPLICATE_KEY,
                    format!("duplicate key in {collection}: _id {id}"),
                ));
            }
            docs.push(document);
            Ok(())
        })
    }

    fn update(
        &self,
        collection: &str,
        filter: &Document,
        set: &Document,
        multi: bool,
    ) -> Result<UpdateResult, StoreError> {
        self.check_available()?;
        Ok(self.with_collections(|colls| {
            let mut result = UpdateResult::default();
            let Some(docs) = colls.get_mut(collection) else {
                return result;
            };
            for document in docs.iter_mut().filter(|d| matches(d, filter)) {
                result.matched += 1;
                let mut changed = false;
                for (key, value) in set {
                    if document.get(key) != Some(value) {
                        document.insert(key.clone(), value.clone());
                        changed = true;
                    }
                }
                if changed {
                    result.modified += 1;
                }
                if !multi {
                    break;
                }
            }
            result
        }))
    }

    fn delete(&self, collection: &str, filter: &Document) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self.with_collections(|colls| {
            let Some(docs) = colls.get_mut(collection) else {
                return 0;
            };
            let before = docs.len();
            docs.retain(|d| !matches(d, filter));
            (before - docs.len()) as u64
        }))
    }

    fn run_command(&self, command: &Document) -> Result<Document, StoreError> {
        self.check_available()?;
        let Some((name, arg)) = command.iter().next() else {
            return Err(StoreError::new(COMMAND_NOT_FOUND, "empty command"));
        };
        match name.as_str() {
            "ping" => Ok(doc(json!({ "ok": 1 }))),
            "count" => {
                let collection = arg.as_str().unwrap_or_default();
                let n = self.with_collections(|colls| colls.get(collection).map_or(0, Vec::len));
                Ok(doc(json!({ "ok": 1, "n": n })))
            }
            "drop" => {
                let collection = arg.as_str().unwrap_or_default();
                let existed = self.with_collections(|colls| colls.remove(collection).is_some());
                Ok(doc(json!({ "ok": 1, "dropped": existed })))
            }
            "listCollections" => {
                let mut names = self.with_collections(|colls| colls.keys().cloned().collect::<Vec<_>>());
                names.sort();
                Ok(doc(json!({ "ok": 1, "collections": names })))
            }
            other => Err(StoreError::new(
                COMMAND_NOT_FOUND,
                format!("no such command: '{other}'"),
            )),
        }
    }
}

/// A deployment consisting of a single node.
pub struct SingleNode {
    conn: Arc<dyn Connection>,
}

impl SingleNode {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }
}

impl ClusterHandle for SingleNode {
    fn node_count(&self) -> usize {
        1
    }

    fn execute_on_all_nodes(
        &self,
        f: &mut dyn FnMut(&dyn Connection) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        f(self.conn.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HOST_UNREACHABLE;

    #[test]
    fn insert_and_find_by_filter() {
        let store = MemoryStore::new();
        store.insert("c", doc(json!({ "_id": 1, "x": "a" }))).unwrap();
        store.insert("c", doc(json!({ "_id": 2, "x": "b" }))).unwrap();

        let found = store.find("c", &doc(json!({ "x": "b" }))).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["_id"], json!(2));
        assert_eq!(store.find("c", &Document::new()).unwrap().len(), 2);
        assert!(store.find("missing", &Document::new()).unwrap().is_empty());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let store = MemoryStore::new();
        store.insert("c", doc(json!({ "_id": 7 }))).unwrap();
        let err = store.insert("c", doc(json!({ "_id": 7 }))).unwrap_err();
        assert_eq!(err.code, DUPLICATE_KEY);
    }

    #[test]
    fn conditional_update_modifies_only_matching() {
        let store = MemoryStore::new();
        store
            .insert("m", doc(json!({ "resourceName": "x", "locked": false })))
            .unwrap();

        let filter = doc(json!({ "resourceName": "x", "locked": false }));
        let set = doc(json!({ "locked": true }));
        let first = store.update("m", &filter, &set, false).unwrap();
        assert_eq!(first.modified, 1);
        let second = store.update("m", &filter, &set, false).unwrap();
        assert_eq!(second.matched, 0);
        assert_eq!(second.modified, 0);
    }

    #[test]
    fn delete_returns_removed_count() {
        let store = MemoryStore::new();
        for i in 0..3 {
            store.insert("c", doc(json!({ "_id": i, "even": i % 2 == 0 }))).unwrap();
        }
        assert_eq!(store.delete("c", &doc(json!({ "even": true }))).unwrap(), 2);
        assert_eq!(store.find("c", &Document::new()).unwrap().len(), 1);
    }

    #[test]
    fn commands() {
        let store = MemoryStore::new();
        store.insert("c", doc(json!({ "_id": 1 }))).unwrap();
        let count = store.run_command(&doc(json!({ "count": "c" }))).unwrap();
        assert_eq!(count["n"], json!(1));
        let err = store.run_command(&doc(json!({ "explode": 1 }))).unwrap_err();
        assert_eq!(err.code, COMMAND_NOT_FOUND);
        store.run_command(&doc(json!({ "drop": "c" }))).unwrap();
        assert!(store.find("c", &Document::new()).unwrap().is_empty());
    }

    #[test]
    fn unavailable_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_available(false);
        let err = store.find("c", &Document::new()).unwrap_err();
        assert_eq!(err.code, HOST_UNREACHABLE);
        store.set_available(true);
        assert!(store.find("c", &Document::new()).is_ok());
    }

    #[test]
    fn single_node_broadcast() {
        let store: Arc<dyn Connection> = Arc::new(MemoryStore::new());
        let cluster = SingleNode::new(store);
        let mut calls = 0;
        cluster
            .execute_on_all_nodes(&mut |conn| {
                calls += 1;
                conn.run_command(&doc(json!({ "ping": 1 }))).map(|_| ())
            })
            .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(cluster.node_count(), 1);
    }
}
