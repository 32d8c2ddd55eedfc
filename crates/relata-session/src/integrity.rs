//! Referential integrity on delete.
//!
//! Deleting a document walks the referential edges that point into its
//! model and records the policy's sub-operations on the same transaction
//! node as the delete itself:
//!
//! | Policy   | Single reference          | Array reference   |
//! |----------|---------------------------|-------------------|
//! | cascade  | delete the dependent      | pull the id       |
//! | nullify  | replace the id with null  | pull the id       |
//! | restrict | count guard, checked when the node executes   ||
//!
//! Cascaded deletes run through the same walk, so policies apply
//! transitively. A `(model, id)` pair is scheduled at most once per node,
//! which also terminates reference cycles.

use crate::loader::{LoadOp, load};
use crate::transaction::{Deferred, Guard, Transaction};
use relata_core::value::lookup;
use relata_core::{
    Cx, DeletePolicy, Document, Error, Model, Op, Outcome, Patch, ReferentialEdge, Value,
    try_outcome, try_result,
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type DeleteFuture<'a> = Pin<Box<dyn Future<Output = Outcome<Option<Deferred>, Error>> + Send + 'a>>;

/// Record a delete of `id` on `model`, plus every sub-operation its
/// referential edges call for.
///
/// Returns `None` if the document was already scheduled for deletion on this
/// node. `id` must already be in the backend's identity form.
pub(crate) fn delete_with_policies<'a>(
    tx: &'a Transaction,
    cx: &'a Cx,
    model: &'a Arc<Model>,
    id: Value,
) -> DeleteFuture<'a> {
    Box::pin(async move {
        if !tx.schedule_delete(model.name(), &id) {
            tracing::trace!(model = model.name(), id = %id, "Already scheduled for delete");
            return Outcome::Ok(None);
        }
        let deferred = try_result!(tx.stage(
            model,
            Op::Delete {
                collection: model.collection().to_string(),
                id: id.clone(),
            },
        ));

        let edges = model.edges();
        if edges.is_empty() {
            return Outcome::Ok(Some(deferred));
        }
        tracing::debug!(
            model = model.name(),
            id = %id,
            edges = edges.len(),
            "Applying delete policies"
        );

        let mut loaded_edges: Vec<&ReferentialEdge> = Vec::new();
        let mut ops = Vec::new();
        for edge in edges {
            let predicate = edge_predicate(edge, &id);
            if edge.policy == DeletePolicy::Restrict {
                tx.add_guard(Guard {
                    model: model.name().to_string(),
                    source: edge.source.clone(),
                    path: edge.path.clone(),
                    predicate,
                });
            } else {
                loaded_edges.push(edge);
                ops.push(LoadOp::find(edge.source.clone(), predicate));
            }
        }
        if ops.is_empty() {
            return Outcome::Ok(Some(deferred));
        }

        let results = try_outcome!(load(tx.session(), cx, ops).await);
        for (edge, result) in loaded_edges.into_iter().zip(results) {
            let dependents = try_result!(result).into_rows();
            let source = Arc::clone(try_result!(tx.session().schema().model(&edge.source)));
            try_outcome!(apply_edge(tx, cx, &source, edge, &id, dependents).await);
        }
        Outcome::Ok(Some(deferred))
    })
}

fn edge_predicate(edge: &ReferentialEdge, id: &Value) -> Document {
    let mut predicate = Document::new();
    predicate.insert(edge.path.clone(), id.clone());
    predicate
}

async fn apply_edge(
    tx: &Transaction,
    cx: &Cx,
    source: &Arc<Model>,
    edge: &ReferentialEdge,
    id: &Value,
    dependents: Vec<Document>,
) -> Outcome<(), Error> {
    for dependent in dependents {
        let Some(dependent_id) = lookup(&dependent, source.identity_key()).cloned() else {
            tracing::warn!(
                model = source.name(),
                "Dependent document has no identity; skipping"
            );
            continue;
        };
        if tx.is_scheduled_for_delete(source.name(), &dependent_id) {
            continue;
        }
        let patch = match (edge.policy, edge.array) {
            (DeletePolicy::Cascade | DeletePolicy::Nullify, true) => {
                Patch::new().pull(edge.path.clone(), vec![id.clone()])
            }
            (DeletePolicy::Nullify, false) => {
                Patch::new().replace(edge.path.clone(), id.clone(), Value::Null)
            }
            (DeletePolicy::Cascade, false) => {
                tracing::trace!(
                    model = source.name(),
                    id = %dependent_id,
                    field = %edge.field,
                    "Cascading delete"
                );
                try_outcome!(delete_with_policies(tx, cx, source, dependent_id).await);
                continue;
            }
            (DeletePolicy::Restrict, _) => continue,
        };
        try_result!(tx.stage(
            source,
            Op::Update {
                collection: source.collection().to_string(),
                id: dependent_id,
                patch,
            },
        ));
    }
    Outcome::Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Session;
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

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn library() -> (Session, MemoryBackend) {
        let backend = MemoryBackend::new("mem");
        let schema = Schema::builder()
            .backend("mem", Arc::new(backend.clone()))
            .model(
                ModelDef::new("Person")
                    .field(Field::scalar("name"))
                    .field(Field::virtual_ref("authored", "Book", "author")),
            )
            .model(
                ModelDef::new("Book")
                    .field(Field::scalar("name"))
                    .field(Field::reference("author", "Person").on_delete(DeletePolicy::Cascade))
                    .field(
                        Field::reference("editors", "Person")
                            .array()
                            .on_delete(DeletePolicy::Cascade),
                    )
                    .field(Field::reference("reviewer", "Person").on_delete(DeletePolicy::Nullify)),
            )
            .model(
                ModelDef::new("Chapter")
                    .field(Field::scalar("name"))
                    .field(Field::reference("book", "Book").on_delete(DeletePolicy::Restrict)),
            )
            .build()
            .unwrap();

        backend.seed(
            "Person",
            [
                doc(json!({"id": "p1", "name": "ann"})),
                doc(json!({"id": "p2", "name": "bo"})),
                doc(json!({"id": "p3", "name": "cy"})),
            ],
        );
        backend.seed(
            "Book",
            [
                doc(json!({"id": "b1", "name": "Dune", "author": "p1", "editors": ["p3"]})),
                doc(json!({"id": "b2", "name": "Emma", "author": "p1", "reviewer": "p3"})),
                doc(json!({"id": "b3", "name": "Ulysses", "author": "p2", "editors": ["p3", "p1"]})),
            ],
        );
        backend.seed("Chapter", [doc(json!({"id": "c1", "name": "one", "book": "b3"}))]);
        (Session::new(schema), backend)
    }

    fn delete(session: &Session, model: &str, id: &str) -> Outcome<(), Error> {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let model = Arc::clone(session.schema().model(model).unwrap());
        rt.block_on(async {
            let tx = session.transaction();
            try_outcome!(delete_with_policies(&tx, &cx, &model, json!(id)).await);
            tx.run(&cx).await
        })
    }

    #[test]
    fn test_cascade_deletes_single_and_pulls_array_references() {
        let (session, backend) = library();
        unwrap_outcome(delete(&session, "Person", "p1"));

        assert!(backend.document("Person", &json!("p1")).is_none());
        let books = backend.documents("Book");
        assert_eq!(books.len(), 1);
        assert_eq!(books[0]["id"], json!("b3"));
        assert_eq!(books[0]["editors"], json!(["p3"]));
    }

    #[test]
    fn test_nullify_and_array_pull() {
        let (session, backend) = library();
        unwrap_outcome(delete(&session, "Person", "p3"));

        let b1 = backend.document("Book", &json!("b1")).unwrap();
        assert_eq!(b1["editors"], json!([]));
        let b2 = backend.document("Book", &json!("b2")).unwrap();
        assert_eq!(b2["reviewer"], Value::Null);
        let b3 = backend.document("Book", &json!("b3")).unwrap();
        assert_eq!(b3["editors"], json!(["p1"]));
    }

    #[test]
    fn test_restrict_two_hops_away_blocks_delete() {
        let (session, backend) = library();
        // p2 -> cascade b3 -> restricted by c1
        let err = match delete(&session, "Person", "p2") {
            Outcome::Err(e) => e,
            other => std::panic::panic_any(format!("expected error, got {other:?}")),
        };
        assert!(err.is_restricted());
        assert_eq!(err.model(), Some("Book"));
        assert!(backend.document("Person", &json!("p2")).is_some());
        assert!(backend.document("Book", &json!("b3")).is_some());
        assert_eq!(backend.stats().commit, 0);
    }

    #[test]
    fn test_document_scheduled_once_per_node() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, _backend) = library();
        let model = Arc::clone(session.schema().model("Chapter").unwrap());

        rt.block_on(async {
            let tx = session.transaction();
            let first = unwrap_outcome(delete_with_policies(&tx, &cx, &model, json!("c1")).await);
            let second = unwrap_outcome(delete_with_policies(&tx, &cx, &model, json!("c1")).await);
            assert!(first.is_some());
            assert!(second.is_none());
            assert_eq!(tx.pending_ops(), 1);
        });
    }
}
