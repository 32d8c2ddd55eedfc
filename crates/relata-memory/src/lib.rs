//! In-memory backend adapter for Relata.
//!
//! `MemoryBackend` keeps every collection in a `Vec<Document>` behind a
//! mutex. It implements the full [`Backend`] contract:
//!
//! - resolved-predicate matching with membership, containment and dotted
//!   paths through embedded arrays
//! - staged transactions: a batch applies to a working copy and only becomes
//!   visible when its handle commits
//! - unique paths surfaced as [`Error::Duplicate`](relata_core::Error)
//! - per-method call statistics, used by tests to count round trips
//!
//! It can also be switched to non-transactional mode, in which case callers
//! run ops one at a time and commit/rollback are no-ops.

pub mod store;

pub use store::{CallStats, matches};

use asupersync::{Cx, Outcome};
use relata_core::value::values_equal;
use relata_core::{
    Backend, BackendFuture, Document, Error, FindRequest, Op, Patch, TxBatch, TxHandle, Value,
    try_result,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use store::{Change, Staging, Store, replay};

/// An in-memory storage adapter.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    name: String,
    identity_key: String,
    transactional: bool,
    store: Arc<Mutex<Store>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identity_key: "id".to_string(),
            transactional: true,
            store: Arc::new(Mutex::new(Store::default())),
        }
    }

    /// Use a different identity key (default `"id"`).
    #[must_use]
    pub fn with_identity_key(mut self, key: impl Into<String>) -> Self {
        self.identity_key = key.into();
        self
    }

    /// Reject writes that would give two documents of `collection` the same
    /// value at `path`.
    #[must_use]
    pub fn with_unique(self, collection: impl Into<String>, path: impl Into<String>) -> Self {
        self.lock()
            .unique
            .entry(collection.into())
            .or_default()
            .push(path.into());
        self
    }

    /// Report no native transaction support.
    #[must_use]
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// Insert documents directly, bypassing transactions and statistics.
    /// Documents without an identity get one assigned.
    pub fn seed(&self, collection: &str, docs: impl IntoIterator<Item = Document>) -> Vec<Value> {
        let mut store = self.lock();
        let mut ids = Vec::new();
        for mut doc in docs {
            if doc.get(&self.identity_key).is_none_or(Value::is_null) {
                let id = store.allocate_id();
                doc.insert(self.identity_key.clone(), id);
            }
            ids.push(doc[&self.identity_key].clone());
            store
                .collections
                .entry(collection.to_string())
                .or_default()
                .push(doc);
        }
        ids
    }

    /// Snapshot of the committed documents of a collection.
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    /// Committed document by identity.
    pub fn document(&self, collection: &str, id: &Value) -> Option<Document> {
        self.lock().collections.get(collection).and_then(|docs| {
            docs.iter()
                .find(|doc| {
                    doc.get(&self.identity_key)
                        .is_some_and(|v| values_equal(v, id))
                })
                .cloned()
        })
    }

    /// Make every call touching `collection` fail with a backend error.
    pub fn fail_collection(&self, collection: impl Into<String>) {
        self.lock().failing.insert(collection.into());
    }

    /// Undo [`fail_collection`](Self::fail_collection).
    pub fn restore_collection(&self, collection: &str) {
        self.lock().failing.remove(collection);
    }

    pub fn stats(&self) -> CallStats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = CallStats::default();
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply ops through a staging area and return the results plus the
    /// change log, or the first error.
    fn stage(&self, ops: Vec<Op>) -> relata_core::Result<(Vec<Document>, Vec<Change>)> {
        let mut store = self.lock();
        let mut staging = Staging::new(&self.name, &self.identity_key, &mut store);
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(staging.apply(op)?);
        }
        let changes = std::mem::take(&mut staging.changes);
        Ok((results, changes))
    }

    /// Apply a single op immediately.
    fn apply_now(&self, op: Op) -> relata_core::Result<Document> {
        let (mut results, changes) = self.stage(vec![op])?;
        replay(&mut self.lock(), &self.identity_key, changes);
        results
            .pop()
            .ok_or_else(|| Error::backend(&self.name, "write produced no result"))
    }
}

/// Commit/rollback pair for one staged batch.
struct MemoryTxHandle {
    backend: MemoryBackend,
    changes: Vec<Change>,
}

impl TxHandle for MemoryTxHandle {
    fn commit<'a>(self: Box<Self>, cx: &'a Cx) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let MemoryTxHandle { backend, changes } = *self;
            let mut store = backend.lock();
            store.stats.commit += 1;
            tracing::debug!(
                backend = %backend.name,
                changes = changes.len(),
                "Committing staged batch"
            );
            replay(&mut store, &backend.identity_key, changes);
            Outcome::Ok(())
        })
    }

    fn rollback<'a>(self: Box<Self>, _cx: &'a Cx) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut store = self.backend.lock();
            store.stats.rollback += 1;
            tracing::debug!(
                backend = %self.backend.name,
                changes = self.changes.len(),
                "Discarding staged batch"
            );
            Outcome::Ok(())
        })
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn identity_key(&self) -> &str {
        &self.identity_key
    }

    /// Identities are strings; numbers are accepted and converted.
    fn identity_value(&self, raw: &Value) -> relata_core::Result<Value> {
        match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            other => Err(Error::bad_request(format!("invalid identity {other}"))),
        }
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    fn get<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        id: &'a Value,
    ) -> BackendFuture<'a, Option<Document>> {
        Box::pin(async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            {
                let mut store = self.lock();
                store.stats.get += 1;
                try_result!(store.check_available(&self.name, collection));
            }
            tracing::trace!(backend = %self.name, collection, id = %id, "get");
            Outcome::Ok(self.document(collection, id))
        })
    }

    fn find<'a>(
        &'a self,
        cx: &'a Cx,
        request: &'a FindRequest,
    ) -> BackendFuture<'a, Vec<Document>> {
        Box::pin(async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let mut store = self.lock();
            store.stats.find += 1;
            try_result!(store.check_available(&self.name, &request.collection));
            let rows = store.find(request);
            tracing::trace!(
                backend = %self.name,
                collection = %request.collection,
                rows = rows.len(),
                "find"
            );
            Outcome::Ok(rows)
        })
    }

    fn count<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        predicate: &'a Document,
    ) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let mut store = self.lock();
            store.stats.count += 1;
            try_result!(store.check_available(&self.name, collection));
            let count = store
                .collections
                .get(collection)
                .map_or(0, |docs| docs.iter().filter(|d| matches(d, predicate)).count());
            Outcome::Ok(count as u64)
        })
    }

    fn create<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        input: Document,
    ) -> BackendFuture<'a, Document> {
        Box::pin(async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.lock().stats.create += 1;
            Outcome::Ok(try_result!(self.apply_now(Op::Create {
                collection: collection.to_string(),
                input,
            })))
        })
    }

    fn update<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        id: &'a Value,
        patch: &'a Patch,
    ) -> BackendFuture<'a, Document> {
        Box::pin(async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.lock().stats.update += 1;
            Outcome::Ok(try_result!(self.apply_now(Op::Update {
                collection: collection.to_string(),
                id: id.clone(),
                patch: patch.clone(),
            })))
        })
    }

    fn delete<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        id: &'a Value,
    ) -> BackendFuture<'a, Document> {
        Box::pin(async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.lock().stats.delete += 1;
            Outcome::Ok(try_result!(self.apply_now(Op::Delete {
                collection: collection.to_string(),
                id: id.clone(),
            })))
        })
    }

    fn transaction<'a>(&'a self, cx: &'a Cx, ops: Vec<Op>) -> BackendFuture<'a, TxBatch> {
        Box::pin(async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.lock().stats.transaction += 1;
            tracing::debug!(backend = %self.name, ops = ops.len(), "Staging batch");
            let (results, changes) = try_result!(self.stage(ops));
            Outcome::Ok(TxBatch {
                results,
                handle: Box::new(MemoryTxHandle {
                    backend: self.clone(),
                    changes,
                }),
            })
        })
    }
}
