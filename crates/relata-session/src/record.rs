//! Read results.
//!
//! A [`Record`] wraps one stored document together with its model and the
//! session it was read through. Relationship fields are loaded on demand by
//! [`Record::related`], which goes through the batched loader and memoises
//! the result per field name.

use crate::Session;
use crate::loader::{LoadOp, load};
use relata_core::value::{flatten_values, lookup};
use relata_core::{
    Cx, Document, Error, FieldKind, Model, Outcome, Value, try_outcome, try_result,
};
use relata_query::PageInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One document returned by a read or write.
#[derive(Debug, Clone)]
pub struct Record {
    session: Session,
    model: Arc<Model>,
    doc: Document,
    related: Arc<Mutex<HashMap<String, Vec<Document>>>>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.model.name() == other.model.name() && self.doc == other.doc
    }
}

impl Record {
    pub(crate) fn new(session: Session, model: Arc<Model>, doc: Document) -> Self {
        Self {
            session,
            model,
            doc,
            related: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Value of the identity key.
    pub fn id(&self) -> Option<&Value> {
        lookup(&self.doc, self.model.identity_key())
    }

    /// Value of a field, by field name or storage key. Dotted names reach
    /// into embedded documents by storage key.
    pub fn get(&self, field: &str) -> Option<&Value> {
        lookup(&self.doc, self.model.storage_key(field))
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn into_document(self) -> Document {
        self.doc
    }

    /// Whether `field` has already been loaded by [`related`](Self::related).
    pub fn is_loaded(&self, field: &str) -> bool {
        self.memo().contains_key(field)
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<String, Vec<Document>>> {
        self.related.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load the documents a reference or virtual field points at.
    ///
    /// A reference loads the documents whose identities the field holds. A
    /// virtual field loads the documents of the target model whose `via`
    /// reference holds this record's identity. The result is cached on the
    /// record (and its clones).
    pub async fn related(&self, cx: &Cx, field: &str) -> Outcome<Vec<Record>, Error> {
        let schema = self.session.schema();
        let Some(def) = self.model.field(field) else {
            return Outcome::Err(Error::bad_field(self.model.name(), field, "unknown field"));
        };
        let name = def.name.clone();

        let cached = self.memo().get(&name).cloned();
        let docs = match cached {
            Some(docs) => docs,
            None => {
                let (target, predicate) = match &def.kind {
                    FieldKind::Reference { target } => {
                        let target = try_result!(schema.model(target));
                        let ids = self
                            .doc
                            .get(&def.key)
                            .map(flatten_values)
                            .unwrap_or_default();
                        if ids.is_empty() {
                            self.memo().insert(name, Vec::new());
                            return Outcome::Ok(Vec::new());
                        }
                        let mut predicate = Document::new();
                        predicate.insert(target.identity_key().to_string(), Value::Array(ids));
                        (Arc::clone(target), predicate)
                    }
                    FieldKind::Virtual { target, via } => {
                        let target = try_result!(schema.model(target));
                        let Some(id) = self.id().cloned() else {
                            return Outcome::Err(Error::bad_model_request(
                                self.model.name(),
                                "record has no identity",
                            ));
                        };
                        let mut predicate = Document::new();
                        predicate.insert(target.storage_key(via).to_string(), id);
                        (Arc::clone(target), predicate)
                    }
                    FieldKind::Scalar | FieldKind::Embedded { .. } => {
                        return Outcome::Err(Error::bad_field(
                            self.model.name(),
                            field,
                            "not a relationship field",
                        ));
                    }
                };
                let op = LoadOp::find(target.name(), predicate);
                let mut results = try_outcome!(load(&self.session, cx, vec![op]).await);
                let docs = match results.pop() {
                    Some(result) => try_result!(result).into_rows(),
                    None => Vec::new(),
                };
                tracing::trace!(
                    model = self.model.name(),
                    field = %name,
                    loaded = docs.len(),
                    "Loaded relationship"
                );
                self.memo().insert(name.clone(), docs.clone());
                docs
            }
        };

        let target_name = match &def.kind {
            FieldKind::Reference { target } | FieldKind::Virtual { target, .. } => target,
            FieldKind::Scalar | FieldKind::Embedded { .. } => return Outcome::Ok(Vec::new()),
        };
        let target = Arc::clone(try_result!(schema.model(target_name)));
        Outcome::Ok(
            docs.into_iter()
                .map(|doc| Record::new(self.session.clone(), Arc::clone(&target), doc))
                .collect(),
        )
    }

    /// Load a single-valued relationship.
    pub async fn related_one(&self, cx: &Cx, field: &str) -> Outcome<Option<Record>, Error> {
        let mut records = try_outcome!(self.related(cx, field).await);
        if records.is_empty() {
            Outcome::Ok(None)
        } else {
            Outcome::Ok(Some(records.swap_remove(0)))
        }
    }
}

impl From<Record> for Document {
    fn from(record: Record) -> Self {
        record.doc
    }
}

/// The records returned by `many`, `first` and `last`.
///
/// `page_info` is set when the read was paginated.
#[derive(Debug, Clone, Default)]
pub struct Records {
    pub records: Vec<Record>,
    pub page_info: Option<PageInfo>,
}

impl Records {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// Values of `field` across the records, in order.
    pub fn values(&self, field: &str) -> Vec<Value> {
        self.records
            .iter()
            .filter_map(|r| r.get(field).cloned())
            .collect()
    }

    pub fn into_documents(self) -> Vec<Document> {
        self.records.into_iter().map(Record::into_document).collect()
    }
}

impl IntoIterator for Records {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a Records {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use relata_core::{DeletePolicy, Field, ModelDef, Schema};
    use relata_memory::MemoryBackend;
    use serde_json::json;
    use std::task::Poll;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    fn fixture() -> (Session, MemoryBackend) {
        let backend = MemoryBackend::new("mem");
        let schema = Schema::builder()
            .backend("mem", Arc::new(backend.clone()))
            .model(
                ModelDef::new("Person")
                    .field(Field::scalar("name").key("full_name"))
                    .field(Field::virtual_ref("authored", "Book", "author")),
            )
            .model(
                ModelDef::new("Book")
                    .field(Field::scalar("name"))
                    .field(Field::reference("author", "Person").on_delete(DeletePolicy::Cascade)),
            )
            .build()
            .unwrap();
        backend.seed("Person", [doc(json!({"id": "p1", "full_name": "Ann"}))]);
        backend.seed(
            "Book",
            [
                doc(json!({"id": "b1", "name": "Dune", "author": "p1"})),
                doc(json!({"id": "b2", "name": "Emma", "author": "p1"})),
            ],
        );
        (Session::new(schema), backend)
    }

    /// Poll both futures on the current task until each has finished.
    async fn join<A: Future, B: Future>(a: A, b: B) -> (A::Output, B::Output) {
        let mut a = std::pin::pin!(a);
        let mut b = std::pin::pin!(b);
        let (mut left, mut right) = (None, None);
        std::future::poll_fn(|task| {
            if left.is_none() {
                if let Poll::Ready(out) = a.as_mut().poll(task) {
                    left = Some(out);
                }
            }
            if right.is_none() {
                if let Poll::Ready(out) = b.as_mut().poll(task) {
                    right = Some(out);
                }
            }
            match (left.take(), right.take()) {
                (Some(l), Some(r)) => Poll::Ready((l, r)),
                (l, r) => {
                    left = l;
                    right = r;
                    Poll::Pending
                }
            }
        })
        .await
    }

    fn record(session: &Session, model: &str, value: Value) -> Record {
        let model = Arc::clone(session.schema().model(model).unwrap());
        Record::new(session.clone(), model, doc(value))
    }

    #[test]
    fn test_get_maps_field_names_to_storage_keys() {
        let (session, _backend) = fixture();
        let person = record(&session, "Person", json!({"id": "p1", "full_name": "Ann"}));
        assert_eq!(person.id(), Some(&json!("p1")));
        assert_eq!(person.get("name"), Some(&json!("Ann")));
        assert_eq!(person.get("full_name"), Some(&json!("Ann")));
        assert_eq!(person.get("missing"), None);
    }

    #[test]
    fn test_related_is_memoised() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        let session = Session::with_config(
            session.schema().clone(),
            crate::SessionConfig::default().cache_enabled(false),
        );
        let person = record(&session, "Person", json!({"id": "p1", "full_name": "Ann"}));

        rt.block_on(async {
            assert!(!person.is_loaded("authored"));
            let books = unwrap_outcome(person.related(&cx, "authored").await);
            assert_eq!(books.len(), 2);
            assert!(person.is_loaded("authored"));

            let again = unwrap_outcome(person.related(&cx, "authored").await);
            assert_eq!(again, books);
            assert_eq!(backend.stats().find, 1);
        });
    }

    #[test]
    fn test_related_reference() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, _backend) = fixture();
        let book = record(&session, "Book", json!({"id": "b1", "name": "Dune", "author": "p1"}));
        let orphan = record(&session, "Book", json!({"id": "b9", "name": "Lost"}));

        rt.block_on(async {
            let author = unwrap_outcome(book.related_one(&cx, "author").await).unwrap();
            assert_eq!(author.get("name"), Some(&json!("Ann")));
            assert!(unwrap_outcome(orphan.related_one(&cx, "author").await).is_none());

            match book.related(&cx, "name").await {
                Outcome::Err(e) => assert!(e.is_bad_request()),
                other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
            }
        });
    }

    #[test]
    fn test_concurrent_related_share_one_read() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        backend.seed("Person", [doc(json!({"id": "p2", "full_name": "Bo"}))]);
        let first = record(&session, "Book", json!({"id": "b1", "name": "Dune", "author": "p1"}));
        let second = record(&session, "Book", json!({"id": "b3", "name": "Ubik", "author": "p2"}));

        rt.block_on(async {
            let (ann, bo) = join(first.related(&cx, "author"), second.related(&cx, "author")).await;
            let ann = unwrap_outcome(ann);
            let bo = unwrap_outcome(bo);
            assert_eq!(ann[0].get("name"), Some(&json!("Ann")));
            assert_eq!(bo[0].get("name"), Some(&json!("Bo")));
            assert_eq!(backend.stats().reads(), 1);
        });
    }
}
