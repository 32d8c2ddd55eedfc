//! Transaction trees.
//!
//! A [`Transaction`] is one node of a tree of nested scopes. Writes issued
//! through [`Transaction::query`] are recorded against the node and return
//! [`Deferred`] handles; nothing touches a backend until [`exec`] runs.
//!
//! `exec` first evaluates the node's restrict guards (count checks recorded
//! by the referential-integrity engine), then groups the recorded ops by
//! backend in first-recorded order and hands each group to its adapter as
//! one `transaction(ops)` call (or op by op for adapters without native
//! transactions). Each call yields a commit/rollback handle that is kept on
//! the node.
//!
//! Commit and rollback are owned by the root. A child's `commit` is a no-op;
//! its handles are committed when the root commits. Committing the root is
//! rejected while any node of the tree is rolled back or still holds
//! unexecuted ops. Markers are final: once a node is committed or rolled
//! back, neither transition can happen again.
//!
//! [`exec`]: Transaction::exec

use crate::Session;
use crate::builder::{QueryBuilder, Staged};
use crate::hooks::HookPoint;
use relata_core::{
    Backend, Cx, Document, Error, Model, Op, Outcome, RestrictedError, Result,
    TransactionErrorKind, TxHandle, Value, run_individually, try_result,
};
use relata_core::value::values_equal;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Lifecycle state of a transaction node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    Pending,
    Commit,
    Rollback,
}

/// The eventual result of one recorded write.
///
/// Resolved by [`Transaction::exec`]: `Ok` with the document as the backend
/// returned it, or `Err` if its batch failed.
#[derive(Debug, Clone)]
pub struct Deferred {
    model: String,
    slot: Arc<Mutex<Option<Result<Document>>>>,
}

impl Deferred {
    pub(crate) fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_resolved(&self) -> bool {
        self.slot().is_some()
    }

    /// The resolved document, if the write succeeded.
    pub fn get(&self) -> Option<Document> {
        self.slot().as_ref().and_then(|r| r.as_ref().ok().cloned())
    }

    /// The full result, once resolved.
    pub fn result(&self) -> Option<Result<Document>> {
        self.slot().clone()
    }

    pub(crate) fn resolve(&self, result: Result<Document>) {
        *self.slot() = Some(result);
    }

    fn slot(&self) -> MutexGuard<'_, Option<Result<Document>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A count check that must find no dependents for the node to execute.
#[derive(Debug, Clone)]
pub(crate) struct Guard {
    /// Model whose document is being deleted
    pub(crate) model: String,
    /// Model holding the reference
    pub(crate) source: String,
    /// Storage path of the reference on `source`
    pub(crate) path: String,
    pub(crate) predicate: Document,
}

struct StagedOp {
    backend: String,
    op: Op,
    deferred: Deferred,
}

struct Node {
    parent: Option<usize>,
    children: Vec<usize>,
    marker: Marker,
    ops: Vec<StagedOp>,
    guards: Vec<Guard>,
    handles: Vec<(String, Box<dyn TxHandle>)>,
    scheduled_deletes: Vec<(String, Value)>,
}

impl Node {
    fn new(parent: Option<usize>) -> Self {
        Self {
            parent,
            children: Vec::new(),
            marker: Marker::Pending,
            ops: Vec::new(),
            guards: Vec::new(),
            handles: Vec::new(),
            scheduled_deletes: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Tree {
    nodes: Vec<Node>,
}

impl Tree {
    fn root_of(&self, mut node: usize) -> usize {
        while let Some(parent) = self.nodes[node].parent {
            node = parent;
        }
        node
    }

    /// `node` is pending and so is every ancestor. A child of a finished
    /// root would execute batches nobody commits.
    fn check_open(&self, mut node: usize) -> Result<()> {
        loop {
            check_pending(self.nodes[node].marker)?;
            match self.nodes[node].parent {
                Some(parent) => node = parent,
                None => return Ok(()),
            }
        }
    }

    /// `node` and every descendant, parents before children.
    fn subtree(&self, node: usize) -> Vec<usize> {
        let mut out = vec![node];
        let mut i = 0;
        while i < out.len() {
            out.extend(self.nodes[out[i]].children.iter().copied());
            i += 1;
        }
        out
    }
}

fn check_pending(marker: Marker) -> Result<()> {
    match marker {
        Marker::Pending => Ok(()),
        Marker::Commit => Err(Error::transaction(
            TransactionErrorKind::AlreadyCommitted,
            "transaction already committed",
        )),
        Marker::Rollback => Err(Error::transaction(
            TransactionErrorKind::AlreadyRolledBack,
            "transaction already rolled back",
        )),
    }
}

/// One node of a transaction tree.
#[derive(Clone)]
pub struct Transaction {
    session: Session,
    tree: Arc<Mutex<Tree>>,
    node: usize,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tree = self.tree();
        let node = &tree.nodes[self.node];
        f.debug_struct("Transaction")
            .field("node", &self.node)
            .field("parent", &node.parent)
            .field("marker", &node.marker)
            .field("pending_ops", &node.ops.len())
            .field("handles", &node.handles.len())
            .finish()
    }
}

impl Transaction {
    /// Start a new tree.
    pub(crate) fn root(session: Session) -> Self {
        let tree = Tree {
            nodes: vec![Node::new(None)],
        };
        Self {
            session,
            tree: Arc::new(Mutex::new(tree)),
            node: 0,
        }
    }

    /// Open a child scope. Its commit and rollback are deferred to the root.
    ///
    /// Fails once this node or any ancestor is committed or rolled back.
    pub fn transaction(&self) -> Result<Transaction> {
        let mut tree = self.tree();
        tree.check_open(self.node)?;
        let child = tree.nodes.len();
        tree.nodes.push(Node::new(Some(self.node)));
        tree.nodes[self.node].children.push(child);
        tracing::debug!(parent = self.node, child, "Opened nested transaction");
        Ok(Transaction {
            session: self.session.clone(),
            tree: Arc::clone(&self.tree),
            node: child,
        })
    }

    /// Start a deferred query bound to this node.
    pub fn query(&self, model: &str) -> QueryBuilder<Staged> {
        QueryBuilder::staged(self.session.clone(), model, self.clone())
    }

    pub fn marker(&self) -> Marker {
        self.tree().nodes[self.node].marker
    }

    pub fn is_root(&self) -> bool {
        self.tree().nodes[self.node].parent.is_none()
    }

    /// The root of this node's tree.
    pub fn root_transaction(&self) -> Transaction {
        let root = self.tree().root_of(self.node);
        Transaction {
            session: self.session.clone(),
            tree: Arc::clone(&self.tree),
            node: root,
        }
    }

    /// Number of recorded, not yet executed ops on this node.
    pub fn pending_ops(&self) -> usize {
        self.tree().nodes[self.node].ops.len()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.tree.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ensure_pending(&self) -> Result<()> {
        self.tree().check_open(self.node)
    }

    /// Record a write against `model`'s backend.
    pub(crate) fn stage(&self, model: &Model, op: Op) -> Result<Deferred> {
        let backend = model
            .backend()
            .ok_or_else(|| Error::bad_model_request(model.name(), "model has no backend"))?
            .to_string();
        let mut tree = self.tree();
        tree.check_open(self.node)?;
        let node = &mut tree.nodes[self.node];
        let deferred = Deferred::new(model.name());
        tracing::trace!(
            model = model.name(),
            verb = op.verb(),
            backend = %backend,
            "Recorded op"
        );
        node.ops.push(StagedOp {
            backend,
            op,
            deferred: deferred.clone(),
        });
        Ok(deferred)
    }

    pub(crate) fn add_guard(&self, guard: Guard) {
        self.tree().nodes[self.node].guards.push(guard);
    }

    /// Mark `(model, id)` as deleted by this node. Returns `false` if it
    /// already was.
    pub(crate) fn schedule_delete(&self, model: &str, id: &Value) -> bool {
        let mut tree = self.tree();
        let scheduled = &mut tree.nodes[self.node].scheduled_deletes;
        if scheduled
            .iter()
            .any(|(m, known)| m == model && values_equal(known, id))
        {
            return false;
        }
        scheduled.push((model.to_string(), id.clone()));
        true
    }

    pub(crate) fn is_scheduled_for_delete(&self, model: &str, id: &Value) -> bool {
        self.tree().nodes[self.node]
            .scheduled_deletes
            .iter()
            .any(|(m, known)| m == model && values_equal(known, id))
    }

    /// Execute every op recorded on this node.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(node = self.node))]
    pub async fn exec(&self, cx: &Cx) -> Outcome<(), Error> {
        let (ops, guards) = {
            let mut tree = self.tree();
            try_result!(tree.check_open(self.node));
            let node = &mut tree.nodes[self.node];
            (
                std::mem::take(&mut node.ops),
                std::mem::take(&mut node.guards),
            )
        };
        if ops.is_empty() && guards.is_empty() {
            return Outcome::Ok(());
        }

        for guard in &guards {
            let count = match self.count_dependents(cx, guard).await {
                Outcome::Ok(count) => count,
                Outcome::Err(e) => {
                    reject_all(&ops, &e);
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };
            if count > 0 {
                tracing::debug!(
                    model = %guard.model,
                    referenced_by = %guard.source,
                    count,
                    "Restrict policy blocks delete"
                );
                let e: Error = RestrictedError {
                    model: guard.model.clone(),
                    referenced_by: guard.source.clone(),
                    field: guard.path.clone(),
                    count,
                }
                .into();
                reject_all(&ops, &e);
                return Outcome::Err(e);
            }
        }

        let mut groups: Vec<(String, Vec<StagedOp>)> = Vec::new();
        for staged in ops {
            match groups.iter_mut().find(|(name, _)| *name == staged.backend) {
                Some((_, group)) => group.push(staged),
                None => groups.push((staged.backend.clone(), vec![staged])),
            }
        }

        let mut failure: Option<Error> = None;
        for (name, group) in groups {
            if let Some(e) = &failure {
                reject_all(&group, e);
                continue;
            }
            let backend: Arc<dyn Backend> = match self.session.schema().backend(&name) {
                Ok(backend) => Arc::clone(backend),
                Err(e) => {
                    reject_all(&group, &e);
                    failure = Some(e);
                    continue;
                }
            };
            let (deferreds, ops): (Vec<Deferred>, Vec<Op>) =
                group.into_iter().map(|s| (s.deferred, s.op)).unzip();
            tracing::debug!(
                backend = %name,
                ops = ops.len(),
                transactional = backend.supports_transactions(),
                "Executing backend batch"
            );
            let outcome = if backend.supports_transactions() {
                backend.transaction(cx, ops).await
            } else {
                run_individually(backend.as_ref(), cx, ops).await
            };
            match outcome {
                Outcome::Ok(batch) => {
                    for (deferred, doc) in deferreds.iter().zip(batch.results) {
                        deferred.resolve(Ok(doc));
                    }
                    self.tree().nodes[self.node]
                        .handles
                        .push((name, batch.handle));
                }
                Outcome::Err(e) => {
                    tracing::debug!(backend = %name, error = %e, "Backend batch failed");
                    for deferred in &deferreds {
                        deferred.resolve(Err(e.clone()));
                    }
                    failure = Some(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.session.invalidate_cache();
        match failure {
            Some(e) => Outcome::Err(e),
            None => Outcome::Ok(()),
        }
    }

    async fn count_dependents(&self, cx: &Cx, guard: &Guard) -> Outcome<u64, Error> {
        let schema = self.session.schema();
        let source = try_result!(schema.model(&guard.source));
        let backend = try_result!(schema.backend_for(source));
        backend
            .count(cx, source.collection(), &guard.predicate)
            .await
    }

    /// Execute, then commit. On failure the whole tree is rolled back and the
    /// original error is returned.
    ///
    /// On a child node, `run` only executes: the commit happens when the
    /// root commits.
    pub async fn run(&self, cx: &Cx) -> Outcome<(), Error> {
        match self.exec(cx).await {
            Outcome::Ok(()) => {
                if self.is_root() {
                    self.commit(cx).await
                } else {
                    Outcome::Ok(())
                }
            }
            Outcome::Err(e) => {
                let root = self.root_transaction();
                if root.marker() == Marker::Pending {
                    if let Outcome::Err(rollback_err) = root.rollback(cx).await {
                        tracing::warn!(error = %rollback_err, "Rollback after failed run also failed");
                    }
                }
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => {
                let root = self.root_transaction();
                if root.marker() == Marker::Pending {
                    if let Outcome::Err(rollback_err) = root.rollback(cx).await {
                        tracing::warn!(error = %rollback_err, "Rollback after cancelled run failed");
                    }
                }
                Outcome::Cancelled(r)
            }
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Commit the tree.
    ///
    /// On a child node this only checks the node is still pending; the
    /// root's commit covers it.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(node = self.node))]
    pub async fn commit(&self, cx: &Cx) -> Outcome<(), Error> {
        let handles = {
            let mut tree = self.tree();
            try_result!(tree.check_open(self.node));
            if tree.nodes[self.node].parent.is_some() {
                tracing::debug!("Child commit deferred to root");
                return Outcome::Ok(());
            }
            let nodes = tree.subtree(self.node);
            if nodes
                .iter()
                .any(|&n| tree.nodes[n].marker == Marker::Rollback)
            {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::RolledBackDescendant,
                    "cannot commit: a nested transaction was rolled back",
                ));
            }
            if nodes
                .iter()
                .any(|&n| !tree.nodes[n].ops.is_empty() || !tree.nodes[n].guards.is_empty())
            {
                return Outcome::Err(Error::transaction(
                    TransactionErrorKind::UnexecutedOperations,
                    "cannot commit: recorded operations were never executed",
                ));
            }
            let mut handles = Vec::new();
            for n in nodes {
                let node = &mut tree.nodes[n];
                node.marker = Marker::Commit;
                handles.append(&mut node.handles);
            }
            handles
        };

        tracing::debug!(handles = handles.len(), "Committing transaction tree");
        let mut first_error = None;
        for (backend, handle) in handles {
            match handle.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    tracing::warn!(backend = %backend, error = %e, "Commit handle failed");
                    first_error.get_or_insert(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.session.invalidate_cache();
        self.session.notify(HookPoint::AfterCommit);
        match first_error {
            Some(e) => Outcome::Err(e),
            None => Outcome::Ok(()),
        }
    }

    /// Roll back this node and its descendants.
    ///
    /// Recorded but unexecuted ops are discarded and their handles resolve
    /// to an error. Executed batches have their rollback handles invoked.
    #[tracing::instrument(level = "debug", skip(self, cx), fields(node = self.node))]
    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let handles = {
            let mut tree = self.tree();
            try_result!(check_pending(tree.nodes[self.node].marker));
            let discarded = Error::transaction(
                TransactionErrorKind::AlreadyRolledBack,
                "transaction rolled back before this operation executed",
            );
            let mut handles = Vec::new();
            for n in tree.subtree(self.node) {
                let node = &mut tree.nodes[n];
                node.marker = Marker::Rollback;
                reject_all(&node.ops, &discarded);
                node.ops.clear();
                node.guards.clear();
                handles.append(&mut node.handles);
            }
            handles
        };

        tracing::debug!(handles = handles.len(), "Rolling back transaction");
        let mut first_error = None;
        for (backend, handle) in handles {
            match handle.rollback(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    tracing::warn!(backend = %backend, error = %e, "Rollback handle failed");
                    first_error.get_or_insert(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        self.session.invalidate_cache();
        self.session.notify(HookPoint::AfterRollback);
        match first_error {
            Some(e) => Outcome::Err(e),
            None => Outcome::Ok(()),
        }
    }
}

fn reject_all(ops: &[StagedOp], error: &Error) {
    for staged in ops {
        staged.deferred.resolve(Err(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relata_core::{Field, ModelDef, Schema};
    use relata_memory::MemoryBackend;
    use serde_json::json;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn unwrap_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
        match outcome {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected error, got: {other:?}")),
        }
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn two_backends() -> (Session, MemoryBackend, MemoryBackend) {
        let left = MemoryBackend::new("left");
        let right = MemoryBackend::new("right");
        let schema = Schema::builder()
            .backend("left", Arc::new(left.clone()))
            .backend("right", Arc::new(right.clone()))
            .model(ModelDef::new("Person").backend("left").field(Field::scalar("name")))
            .model(ModelDef::new("Note").backend("right").field(Field::scalar("text")))
            .build()
            .unwrap();
        (Session::new(schema), left, right)
    }

    fn create(tx: &Transaction, model: &str, input: Value) -> Deferred {
        let model = Arc::clone(tx.session().schema().model(model).unwrap());
        tx.stage(
            &model,
            Op::Create {
                collection: model.collection().to_string(),
                input: doc(input),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_run_commits_every_backend() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, left, right) = two_backends();

        rt.block_on(async {
            let tx = session.transaction();
            let person = create(&tx, "Person", json!({"name": "ann"}));
            let note = create(&tx, "Note", json!({"text": "hi"}));
            assert!(!person.is_resolved());

            unwrap_outcome(tx.run(&cx).await);
            assert_eq!(tx.marker(), Marker::Commit);
            assert_eq!(person.get().unwrap()["name"], json!("ann"));
            assert!(note.get().is_some());
            assert_eq!(left.documents("Person").len(), 1);
            assert_eq!(right.documents("Note").len(), 1);
            assert_eq!(left.stats().transaction, 1);
            assert_eq!(right.stats().commit, 1);
        });
    }

    #[test]
    fn test_failure_rolls_back_other_backends() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, left, right) = two_backends();
        right.fail_collection("Note");

        rt.block_on(async {
            let tx = session.transaction();
            let person = create(&tx, "Person", json!({"name": "ann"}));
            let note = create(&tx, "Note", json!({"text": "hi"}));

            let err = unwrap_err(tx.run(&cx).await);
            assert!(matches!(err, Error::Backend(_)));
            assert_eq!(tx.marker(), Marker::Rollback);
            assert!(left.documents("Person").is_empty());
            assert_eq!(left.stats().commit, 0);
            assert_eq!(left.stats().rollback, 1);
            assert!(person.is_resolved());
            assert!(matches!(note.result(), Some(Err(_))));
        });
    }

    #[test]
    fn test_child_commit_waits_for_root() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, left, _right) = two_backends();

        rt.block_on(async {
            let root = session.transaction();
            let child = root.transaction().unwrap();
            assert!(!child.is_root());
            create(&child, "Person", json!({"name": "ann"}));

            unwrap_outcome(child.run(&cx).await);
            unwrap_outcome(child.commit(&cx).await);
            assert_eq!(child.marker(), Marker::Pending);
            assert!(left.documents("Person").is_empty());

            unwrap_outcome(root.commit(&cx).await);
            assert_eq!(child.marker(), Marker::Commit);
            assert_eq!(left.documents("Person").len(), 1);
        });
    }

    #[test]
    fn test_rolled_back_child_blocks_root_commit() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, left, _right) = two_backends();

        rt.block_on(async {
            let root = session.transaction();
            create(&root, "Person", json!({"name": "root"}));
            unwrap_outcome(root.exec(&cx).await);

            let child = root.transaction().unwrap();
            create(&child, "Person", json!({"name": "child"}));
            unwrap_outcome(child.exec(&cx).await);
            unwrap_outcome(child.rollback(&cx).await);

            let err = unwrap_err(root.commit(&cx).await);
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::RolledBackDescendant
            ));
            assert_eq!(left.stats().commit, 0);

            unwrap_outcome(root.rollback(&cx).await);
            assert!(left.documents("Person").is_empty());
            assert_eq!(left.stats().commit, 0);
            assert_eq!(left.stats().rollback, 2);
        });
    }

    #[test]
    fn test_finished_root_refuses_new_work() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, left, _right) = two_backends();

        rt.block_on(async {
            let root = session.transaction();
            create(&root, "Person", json!({"name": "ann"}));
            unwrap_outcome(root.run(&cx).await);

            let err = root.transaction().unwrap_err();
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::AlreadyCommitted
            ));
            assert_eq!(left.stats().transaction, 1);
            assert_eq!(left.documents("Person").len(), 1);

            // A child opened before the root finished cannot stage afterwards
            let other = session.transaction();
            let child = other.transaction().unwrap();
            let grandchild = child.transaction().unwrap();
            unwrap_outcome(other.rollback(&cx).await);
            assert_eq!(grandchild.marker(), Marker::Rollback);

            let person = Arc::clone(session.schema().model("Person").unwrap());
            let err = grandchild
                .stage(
                    &person,
                    Op::Create {
                        collection: "Person".into(),
                        input: doc(json!({"name": "late"})),
                    },
                )
                .unwrap_err();
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::AlreadyRolledBack
            ));
            assert!(child.transaction().is_err());
            assert!(matches!(unwrap_err(grandchild.run(&cx).await), Error::Transaction(_)));
            assert_eq!(left.stats().transaction, 1);
        });
    }

    #[test]
    fn test_root_commit_invokes_every_handle_once() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, left, right) = two_backends();

        rt.block_on(async {
            let root = session.transaction();
            create(&root, "Person", json!({"name": "root"}));
            unwrap_outcome(root.exec(&cx).await);

            let people = root.transaction().unwrap();
            create(&people, "Person", json!({"name": "child"}));
            create(&people, "Note", json!({"text": "first"}));
            unwrap_outcome(people.run(&cx).await);

            let notes = root.transaction().unwrap();
            create(&notes, "Note", json!({"text": "second"}));
            unwrap_outcome(notes.run(&cx).await);

            assert_eq!(left.stats().commit, 0);
            assert_eq!(right.stats().commit, 0);
            unwrap_outcome(root.commit(&cx).await);

            let (l, r) = (left.stats(), right.stats());
            assert_eq!((l.transaction, l.commit, l.rollback), (2, 2, 0));
            assert_eq!((r.transaction, r.commit, r.rollback), (2, 2, 0));
            assert_eq!(left.documents("Person").len(), 2);
            assert_eq!(right.documents("Note").len(), 2);
            assert_eq!(people.marker(), Marker::Commit);
            assert_eq!(notes.marker(), Marker::Commit);
        });
    }

    #[test]
    fn test_markers_are_final() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, left, _right) = two_backends();

        rt.block_on(async {
            let tx = session.transaction();
            create(&tx, "Person", json!({"name": "ann"}));
            unwrap_outcome(tx.exec(&cx).await);
            unwrap_outcome(tx.rollback(&cx).await);

            let err = unwrap_err(tx.commit(&cx).await);
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::AlreadyRolledBack
            ));
            assert!(unwrap_err(tx.rollback(&cx).await).to_string().contains("rolled back"));
            assert_eq!(left.stats().commit, 0);

            let committed = session.transaction();
            unwrap_outcome(committed.run(&cx).await);
            let err = unwrap_err(committed.rollback(&cx).await);
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::AlreadyCommitted
            ));
        });
    }

    #[test]
    fn test_commit_rejects_unexecuted_ops() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, _left, _right) = two_backends();

        rt.block_on(async {
            let tx = session.transaction();
            create(&tx, "Person", json!({"name": "ann"}));
            let err = unwrap_err(tx.commit(&cx).await);
            assert!(matches!(
                err,
                Error::Transaction(ref t) if t.kind == TransactionErrorKind::UnexecutedOperations
            ));
            assert_eq!(tx.marker(), Marker::Pending);
        });
    }

    #[test]
    fn test_non_transactional_backend_runs_ops_individually() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let backend = MemoryBackend::new("plain").non_transactional();
        let schema = Schema::builder()
            .backend("plain", Arc::new(backend.clone()))
            .model(ModelDef::new("Person").field(Field::scalar("name")))
            .build()
            .unwrap();
        let session = Session::new(schema);

        rt.block_on(async {
            let tx = session.transaction();
            create(&tx, "Person", json!({"name": "ann"}));
            create(&tx, "Person", json!({"name": "bo"}));
            unwrap_outcome(tx.run(&cx).await);
            let stats = backend.stats();
            assert_eq!(stats.transaction, 0);
            assert_eq!(stats.create, 2);
            assert_eq!(backend.documents("Person").len(), 2);
        });
    }
}
