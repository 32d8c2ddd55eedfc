//! Backend adapter traits.
//!
//! This module defines the contract every storage technology implements:
//!
//! - [`Backend`] - point reads, predicate reads, counts, writes, and batched
//!   transactional execution
//! - [`TxHandle`] - the commit/rollback pair returned by a transactional batch
//! - [`Op`] - one recorded write operation
//!
//! Predicates handed to a backend are already resolved: every key is a
//! storage path and every value is a scalar (equality) or an array
//! (membership). Backends never see relationship-shaped predicates.
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! for cancellation. Methods return boxed futures so that adapters for
//! different storage technologies can be held as `Arc<dyn Backend>`.

use crate::error::{Error, Result};
use crate::patch::Patch;
use crate::sort::SortKey;
use crate::value::{Document, Value};
use asupersync::{Cx, Outcome};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by backend adapters.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;

/// A predicate read against one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FindRequest {
    /// Collection (storage name of the model)
    pub collection: String,
    /// Resolved predicate
    pub predicate: Document,
    /// Sort order; empty means backend natural order
    pub sort: Vec<SortKey>,
    /// Maximum number of documents to return
    pub limit: Option<usize>,
}

impl FindRequest {
    pub fn new(collection: impl Into<String>, predicate: Document) -> Self {
        Self {
            collection: collection.into(),
            predicate,
            sort: Vec::new(),
            limit: None,
        }
    }

    #[must_use]
    pub fn sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

/// A write operation recorded against a transaction scope.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Insert a new document.
    Create { collection: String, input: Document },
    /// Apply a patch to an existing document.
    Update {
        collection: String,
        id: Value,
        patch: Patch,
    },
    /// Remove a document.
    Delete { collection: String, id: Value },
}

impl Op {
    pub fn collection(&self) -> &str {
        match self {
            Op::Create { collection, .. }
            | Op::Update { collection, .. }
            | Op::Delete { collection, .. } => collection,
        }
    }

    /// Short verb name for logging.
    pub const fn verb(&self) -> &'static str {
        match self {
            Op::Create { .. } => "create",
            Op::Update { .. } => "update",
            Op::Delete { .. } => "delete",
        }
    }
}

/// Commit/rollback pair for one executed batch.
///
/// Exactly one of the two methods is invoked, at most once.
pub trait TxHandle: Send {
    /// Make the batch's effects visible.
    fn commit<'a>(self: Box<Self>, cx: &'a Cx) -> BackendFuture<'a, ()>;

    /// Discard the batch's effects.
    fn rollback<'a>(self: Box<Self>, cx: &'a Cx) -> BackendFuture<'a, ()>;
}

/// Handle for work that was applied immediately and cannot be undone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTxHandle;

impl TxHandle for NoopTxHandle {
    fn commit<'a>(self: Box<Self>, _cx: &'a Cx) -> BackendFuture<'a, ()> {
        Box::pin(async { Outcome::Ok(()) })
    }

    fn rollback<'a>(self: Box<Self>, _cx: &'a Cx) -> BackendFuture<'a, ()> {
        Box::pin(async { Outcome::Ok(()) })
    }
}

/// Results of one executed batch, one document per op, plus its handle.
pub struct TxBatch {
    pub results: Vec<Document>,
    pub handle: Box<dyn TxHandle>,
}

impl std::fmt::Debug for TxBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxBatch")
            .field("results", &self.results.len())
            .finish_non_exhaustive()
    }
}

/// A storage adapter.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
pub trait Backend: Send + Sync {
    /// Adapter name used in logs and errors.
    fn name(&self) -> &str;

    /// Storage key of the identity field.
    fn identity_key(&self) -> &str {
        "id"
    }

    /// Normalise a caller-supplied identifier into the backend's id form.
    fn identity_value(&self, raw: &Value) -> Result<Value> {
        Ok(raw.clone())
    }

    /// Whether [`transaction`](Backend::transaction) stages work atomically.
    ///
    /// When `false`, callers run ops one at a time and treat commit/rollback
    /// as no-ops.
    fn supports_transactions(&self) -> bool {
        true
    }

    /// Fetch one document by identity.
    fn get<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        id: &'a Value,
    ) -> BackendFuture<'a, Option<Document>>;

    /// Fetch every document matching a resolved predicate.
    fn find<'a>(&'a self, cx: &'a Cx, request: &'a FindRequest)
    -> BackendFuture<'a, Vec<Document>>;

    /// Count documents matching a resolved predicate.
    fn count<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        predicate: &'a Document,
    ) -> BackendFuture<'a, u64>;

    /// Insert a document and return it as stored (identity assigned).
    fn create<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        input: Document,
    ) -> BackendFuture<'a, Document>;

    /// Patch a document and return it as stored.
    fn update<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        id: &'a Value,
        patch: &'a Patch,
    ) -> BackendFuture<'a, Document>;

    /// Remove a document and return its last stored state.
    fn delete<'a>(
        &'a self,
        cx: &'a Cx,
        collection: &'a str,
        id: &'a Value,
    ) -> BackendFuture<'a, Document>;

    /// Execute `ops` in order as one atomic unit, staging their effects until
    /// the returned handle is committed.
    fn transaction<'a>(&'a self, cx: &'a Cx, ops: Vec<Op>) -> BackendFuture<'a, TxBatch>;
}

/// Run ops one at a time through the non-transactional methods.
///
/// Used for adapters that report `supports_transactions() == false`; the
/// returned handle is a no-op.
pub fn run_individually<'a>(
    backend: &'a dyn Backend,
    cx: &'a Cx,
    ops: Vec<Op>,
) -> BackendFuture<'a, TxBatch> {
    Box::pin(async move {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let outcome = match &op {
                Op::Create { collection, input } => {
                    backend.create(cx, collection, input.clone()).await
                }
                Op::Update {
                    collection,
                    id,
                    patch,
                } => backend.update(cx, collection, id, patch).await,
                Op::Delete { collection, id } => backend.delete(cx, collection, id).await,
            };
            match outcome {
                Outcome::Ok(doc) => results.push(doc),
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(TxBatch {
            results,
            handle: Box::new(NoopTxHandle),
        })
    })
}
