//! Collection storage, predicate matching and op application.

use relata_core::value::{collect_at_path, lookup, values_equal};
use relata_core::{
    DuplicateError, Document, Error, FindRequest, Op, Patch, Result, Value, compare_documents,
};
use std::collections::{HashMap, HashSet};

/// Per-method call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub get: usize,
    pub find: usize,
    pub count: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub transaction: usize,
    pub commit: usize,
    pub rollback: usize,
}

impl CallStats {
    /// Number of read calls (`get` + `find` + `count`).
    pub fn reads(&self) -> usize {
        self.get + self.find + self.count
    }
}

/// One committed change, replayed against the live store on commit.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    Put { collection: String, doc: Document },
    Remove { collection: String, id: Value },
}

#[derive(Debug, Default)]
pub(crate) struct Store {
    pub(crate) collections: HashMap<String, Vec<Document>>,
    pub(crate) unique: HashMap<String, Vec<String>>,
    pub(crate) failing: HashSet<String>,
    pub(crate) next_id: u64,
    pub(crate) stats: CallStats,
}

impl Store {
    pub(crate) fn check_available(&self, backend: &str, collection: &str) -> Result<()> {
        if self.failing.contains(collection) {
            return Err(Error::backend(
                backend,
                format!("collection '{collection}' is unavailable"),
            ));
        }
        Ok(())
    }

    pub(crate) fn allocate_id(&mut self) -> Value {
        self.next_id += 1;
        Value::String(self.next_id.to_string())
    }

    pub(crate) fn find(&self, request: &FindRequest) -> Vec<Document> {
        let mut rows: Vec<Document> = self
            .collections
            .get(&request.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|doc| matches(doc, &request.predicate))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if !request.sort.is_empty() {
            rows.sort_by(|a, b| compare_documents(a, b, &request.sort));
        }
        if let Some(limit) = request.limit {
            rows.truncate(limit);
        }
        rows
    }
}

/// A working copy of the collections a batch touches.
///
/// Ops apply to the copy in order, so later ops observe earlier ones; the
/// resulting change log is replayed against the live store on commit.
pub(crate) struct Staging<'s> {
    backend: &'s str,
    identity_key: &'s str,
    store: &'s mut Store,
    working: HashMap<String, Vec<Document>>,
    pub(crate) changes: Vec<Change>,
}

impl<'s> Staging<'s> {
    pub(crate) fn new(backend: &'s str, identity_key: &'s str, store: &'s mut Store) -> Self {
        Self {
            backend,
            identity_key,
            store,
            working: HashMap::new(),
            changes: Vec::new(),
        }
    }

    fn docs(&mut self, collection: &str) -> &mut Vec<Document> {
        let store = &*self.store;
        self.working
            .entry(collection.to_string())
            .or_insert_with(|| store.collections.get(collection).cloned().unwrap_or_default())
    }

    pub(crate) fn apply(&mut self, op: Op) -> Result<Document> {
        self.store.check_available(self.backend, op.collection())?;
        match op {
            Op::Create { collection, input } => self.create(&collection, input),
            Op::Update {
                collection,
                id,
                patch,
            } => self.update(&collection, &id, &patch),
            Op::Delete { collection, id } => self.delete(&collection, &id),
        }
    }

    fn create(&mut self, collection: &str, mut input: Document) -> Result<Document> {
        let key = self.identity_key.to_string();
        if input.get(&key).is_none_or(Value::is_null) {
            let id = self.store.allocate_id();
            input.insert(key.clone(), id);
        }
        let unique = self.unique_paths(collection, &key);
        let docs = self.docs(collection);
        check_unique(docs, &input, None, &unique, collection)?;
        docs.push(input.clone());
        self.changes.push(Change::Put {
            collection: collection.to_string(),
            doc: input.clone(),
        });
        Ok(input)
    }

    fn update(&mut self, collection: &str, id: &Value, patch: &Patch) -> Result<Document> {
        let key = self.identity_key.to_string();
        let unique = self.unique_paths(collection, &key);
        let docs = self.docs(collection);
        let Some(index) = position(docs, &key, id) else {
            return Err(Error::not_found(collection, format!("no document with id {id}")));
        };
        let mut updated = docs[index].clone();
        patch.apply(&mut updated);
        updated.insert(key.clone(), id.clone());
        check_unique(docs, &updated, Some(index), &unique, collection)?;
        docs[index] = updated.clone();
        self.changes.push(Change::Put {
            collection: collection.to_string(),
            doc: updated.clone(),
        });
        Ok(updated)
    }

    fn delete(&mut self, collection: &str, id: &Value) -> Result<Document> {
        let key = self.identity_key.to_string();
        let docs = self.docs(collection);
        let Some(index) = position(docs, &key, id) else {
            return Err(Error::not_found(collection, format!("no document with id {id}")));
        };
        let removed = docs.remove(index);
        self.changes.push(Change::Remove {
            collection: collection.to_string(),
            id: id.clone(),
        });
        Ok(removed)
    }

    fn unique_paths(&self, collection: &str, identity_key: &str) -> Vec<String> {
        let mut paths = vec![identity_key.to_string()];
        if let Some(extra) = self.store.unique.get(collection) {
            paths.extend(extra.iter().cloned());
        }
        paths
    }
}

/// Replay a committed change log.
pub(crate) fn replay(store: &mut Store, identity_key: &str, changes: Vec<Change>) {
    for change in changes {
        match change {
            Change::Put { collection, doc } => {
                let docs = store.collections.entry(collection).or_default();
                let id = doc.get(identity_key).cloned().unwrap_or(Value::Null);
                match position(docs, identity_key, &id) {
                    Some(index) => docs[index] = doc,
                    None => docs.push(doc),
                }
            }
            Change::Remove { collection, id } => {
                if let Some(docs) = store.collections.get_mut(&collection) {
                    docs.retain(|doc| !doc.get(identity_key).is_some_and(|v| values_equal(v, &id)));
                }
            }
        }
    }
}

fn position(docs: &[Document], identity_key: &str, id: &Value) -> Option<usize> {
    docs.iter()
        .position(|doc| doc.get(identity_key).is_some_and(|v| values_equal(v, id)))
}

fn check_unique(
    docs: &[Document],
    candidate: &Document,
    skip: Option<usize>,
    paths: &[String],
    collection: &str,
) -> Result<()> {
    for path in paths {
        let Some(value) = lookup(candidate, path).filter(|v| !v.is_null()) else {
            continue;
        };
        let clash = docs.iter().enumerate().any(|(i, doc)| {
            Some(i) != skip && lookup(doc, path).is_some_and(|other| values_equal(other, value))
        });
        if clash {
            return Err(DuplicateError {
                model: collection.to_string(),
                field: path.clone(),
                value: value.to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Evaluate a resolved predicate against one document.
///
/// - array expected value: membership (any stored value equals any element)
/// - `null`: the path is missing or null
/// - anything else: equality, or containment when the stored value is an
///   array
///
/// Arrays met in the middle of a path are traversed element-wise.
pub fn matches(doc: &Document, predicate: &Document) -> bool {
    predicate.iter().all(|(path, expected)| {
        let mut candidates = Vec::new();
        for value in collect_at_path(doc, path) {
            match value {
                Value::Array(items) => {
                    candidates.push(value);
                    candidates.extend(items.iter());
                }
                other => candidates.push(other),
            }
        }
        match expected {
            Value::Array(wanted) => wanted
                .iter()
                .any(|w| candidates.iter().any(|c| values_equal(c, w))),
            Value::Null => candidates.iter().all(|c| c.is_null()),
            other => candidates.iter().any(|c| values_equal(c, other)),
        }
    })
}
