//! Fluent query builder.
//!
//! A [`QueryBuilder`] accumulates [`QueryParts`] and dispatches a terminal
//! verb. The mode parameter decides what writes do:
//!
//! - [`Immediate`] (from [`Session::query`]): each write runs in its own root
//!   transaction and returns the written [`Record`]s.
//! - [`Staged`] (from [`Transaction::query`]): writes are recorded on the
//!   transaction node and return [`Deferred`] handles resolved by
//!   [`Transaction::exec`].
//!
//! Reads run immediately in both modes.
//!
//! # Read pipeline
//!
//! 1. Freeze the parts into a [`Query`] (shape errors are `BadRequest`).
//! 2. Run `BeforeRead` hooks; a short-circuit returns its documents as-is.
//! 3. Resolve the where-predicate and map sort field names to storage paths.
//! 4. For paginated reads, append the identity tiebreaker and fetch the
//!    cursor window.
//! 5. Load through the batched loader, paginate, project `select`.
//! 6. Run `AfterRead` hooks.

use crate::integrity::delete_with_policies;
use crate::loader::{LoadOp, Loaded, load};
use crate::record::{Record, Records};
use crate::resolver::resolve;
use crate::transaction::{Deferred, Transaction};
use crate::{HookContext, HookPoint, Session};
use relata_core::value::{lookup, path_segments};
use relata_core::{
    Cx, Document, Error, FieldKind, Model, Op, Outcome, Patch, Result, Schema, SortKey, Value,
    try_outcome, try_result,
};
use relata_query::{
    PageInfo, Query, QueryParts, SortSpec, fetch_limit, paginate, parse_sort, with_tiebreaker,
    within_window,
};
use std::marker::PhantomData;
use std::sync::Arc;

/// Writes run at once in an implicit root transaction.
#[derive(Debug, Clone, Copy)]
pub struct Immediate;

/// Writes are recorded on a transaction node.
#[derive(Debug, Clone, Copy)]
pub struct Staged;

/// One write verb with its arguments.
#[derive(Debug)]
enum Write {
    Save(Vec<Value>),
    Remove,
    Push(String, Vec<Value>),
    Pull(String, Vec<Value>),
    Splice(String, Value, Value),
}

impl Write {
    const fn verb(&self) -> &'static str {
        match self {
            Write::Save(_) => "save",
            Write::Remove => "remove",
            Write::Push(..) => "push",
            Write::Pull(..) => "pull",
            Write::Splice(..) => "splice",
        }
    }
}

/// Fluent accumulator for one model operation.
#[derive(Debug)]
pub struct QueryBuilder<M> {
    session: Session,
    model: String,
    parts: QueryParts,
    error: Option<Error>,
    tx: Option<Transaction>,
    _mode: PhantomData<M>,
}

impl QueryBuilder<Immediate> {
    pub(crate) fn immediate(session: Session, model: &str) -> Self {
        Self::new(session, model, None)
    }

    /// Create documents, or patch the targeted ones when `id()` or `where()`
    /// was given.
    pub async fn save(self, cx: &Cx, inputs: Vec<Value>) -> Outcome<Vec<Record>, Error> {
        self.run_write(cx, Write::Save(inputs)).await
    }

    /// Delete the targeted documents, applying delete policies.
    pub async fn remove(self, cx: &Cx) -> Outcome<Vec<Record>, Error> {
        self.run_write(cx, Write::Remove).await
    }

    /// Append `values` to an array field of the targeted documents.
    pub async fn push(self, cx: &Cx, field: &str, values: Vec<Value>) -> Outcome<Vec<Record>, Error> {
        self.run_write(cx, Write::Push(field.to_string(), values)).await
    }

    /// Remove every element equal to one of `values` from an array field.
    pub async fn pull(self, cx: &Cx, field: &str, values: Vec<Value>) -> Outcome<Vec<Record>, Error> {
        self.run_write(cx, Write::Pull(field.to_string(), values)).await
    }

    /// Replace every element equal to `from` with `to` in an array field.
    pub async fn splice(self, cx: &Cx, field: &str, from: Value, to: Value) -> Outcome<Vec<Record>, Error> {
        self.run_write(cx, Write::Splice(field.to_string(), from, to))
            .await
    }

    async fn run_write(self, cx: &Cx, write: Write) -> Outcome<Vec<Record>, Error> {
        let model = Arc::clone(try_result!(self.session.schema().model(&self.model)));
        let tx = self.session.transaction();
        let deferreds = try_outcome!(self.record_write(cx, &tx, write).await);
        try_outcome!(tx.run(cx).await);
        Outcome::Ok(
            deferreds
                .iter()
                .filter_map(Deferred::get)
                .map(|doc| Record::new(self.session.clone(), Arc::clone(&model), doc))
                .collect(),
        )
    }
}

impl QueryBuilder<Staged> {
    pub(crate) fn staged(session: Session, model: &str, tx: Transaction) -> Self {
        Self::new(session, model, Some(tx))
    }

    /// Record creates, or patches of the targeted documents.
    pub async fn save(self, cx: &Cx, inputs: Vec<Value>) -> Outcome<Vec<Deferred>, Error> {
        self.stage_write(cx, Write::Save(inputs)).await
    }

    /// Record deletes of the targeted documents and their policy operations.
    pub async fn remove(self, cx: &Cx) -> Outcome<Vec<Deferred>, Error> {
        self.stage_write(cx, Write::Remove).await
    }

    pub async fn push(self, cx: &Cx, field: &str, values: Vec<Value>) -> Outcome<Vec<Deferred>, Error> {
        self.stage_write(cx, Write::Push(field.to_string(), values))
            .await
    }

    pub async fn pull(self, cx: &Cx, field: &str, values: Vec<Value>) -> Outcome<Vec<Deferred>, Error> {
        self.stage_write(cx, Write::Pull(field.to_string(), values))
            .await
    }

    pub async fn splice(self, cx: &Cx, field: &str, from: Value, to: Value) -> Outcome<Vec<Deferred>, Error> {
        self.stage_write(cx, Write::Splice(field.to_string(), from, to))
            .await
    }

    async fn stage_write(self, cx: &Cx, write: Write) -> Outcome<Vec<Deferred>, Error> {
        let Some(tx) = self.tx.clone() else {
            return Outcome::Err(Error::Custom(
                "staged query has no transaction".to_string(),
            ));
        };
        self.record_write(cx, &tx, write).await
    }
}

impl<M> QueryBuilder<M> {
    fn new(session: Session, model: &str, tx: Option<Transaction>) -> Self {
        Self {
            session,
            model: model.to_string(),
            parts: QueryParts::default(),
            error: None,
            tx,
            _mode: PhantomData,
        }
    }

    fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    // ========================================================================
    // Fluent
    // ========================================================================

    /// Target one document by identity.
    pub fn id(mut self, id: impl Into<Value>) -> Self {
        self.parts.id = Some(id.into());
        self
    }

    /// Add a where-predicate. Repeated calls merge their keys.
    pub fn where_(mut self, predicate: Value) -> Self {
        match predicate {
            Value::Object(map) => {
                self.parts.where_.get_or_insert_with(Document::new).extend(map);
            }
            other => self.fail(Error::bad_model_request(
                &self.model,
                format!("where() expects an object, got {other}"),
            )),
        }
        self
    }

    /// Project results to these fields. The identity key is always kept.
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parts.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Add sort keys; see [`parse_sort`] for the accepted shapes.
    pub fn sort_by(mut self, spec: Value) -> Self {
        match parse_sort(&spec) {
            Ok(sort) => self.parts.sort.extend(sort),
            Err(e) => self.fail(e),
        }
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.parts.limit = Some(limit);
        self
    }

    pub fn before(mut self, cursor: impl Into<String>) -> Self {
        self.parts.page.before = Some(cursor.into());
        self
    }

    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.parts.page.after = Some(cursor.into());
        self
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Fetch one document: by identity, or the first match of `where()`.
    pub async fn one(self, cx: &Cx) -> Outcome<Option<Record>, Error> {
        let (model, query) = try_result!(self.prepare());
        let limit = if query.is_paginated() || query.limit().is_some() {
            None
        } else {
            Some(1)
        };
        let (mut rows, _) = try_outcome!(self.fetch(cx, &model, &query, limit).await);
        if rows.is_empty() {
            return Outcome::Ok(None);
        }
        let doc = rows.swap_remove(0);
        Outcome::Ok(Some(Record::new(self.session.clone(), model, doc)))
    }

    /// Like [`one`](Self::one), but nothing found is `NotFound`.
    pub async fn one_required(self, cx: &Cx) -> Outcome<Record, Error> {
        let model = self.model.clone();
        match try_outcome!(self.one(cx).await) {
            Some(record) => Outcome::Ok(record),
            None => Outcome::Err(Error::not_found(model, "no document matches the query")),
        }
    }

    /// Fetch every match.
    pub async fn many(self, cx: &Cx) -> Outcome<Records, Error> {
        let (model, query) = try_result!(self.prepare());
        let (rows, page_info) = try_outcome!(self.fetch(cx, &model, &query, None).await);
        Outcome::Ok(Records {
            records: rows
                .into_iter()
                .map(|doc| Record::new(self.session.clone(), Arc::clone(&model), doc))
                .collect(),
            page_info,
        })
    }

    /// The first `n` matches after the `after` cursor, if any.
    pub async fn first(mut self, cx: &Cx, n: usize) -> Outcome<Records, Error> {
        self.parts.page.first = Some(n);
        self.many(cx).await
    }

    /// The last `n` matches before the `before` cursor, if any.
    pub async fn last(mut self, cx: &Cx, n: usize) -> Outcome<Records, Error> {
        self.parts.page.last = Some(n);
        self.many(cx).await
    }

    /// Count matches. Sort, limit and pagination do not apply.
    pub async fn count(self, cx: &Cx) -> Outcome<u64, Error> {
        let (model, query) = try_result!(self.prepare());
        let short = try_result!(self.session.fire_hooks(&HookContext {
            point: HookPoint::BeforeRead,
            model: Some(model.name()),
            predicate: Some(query.predicate()),
            docs: &[],
        }));
        if let Some(docs) = short {
            return Outcome::Ok(docs.len() as u64);
        }
        let op = match query.id() {
            Some(raw) => {
                let id = try_result!(identity(self.session.schema(), &model, raw));
                LoadOp::count(model.name(), identity_predicate(&model, id))
            }
            None => {
                let predicate =
                    try_outcome!(resolve(&self.session, cx, &model, query.predicate()).await);
                LoadOp::count(model.name(), predicate)
            }
        };
        let loaded = try_outcome!(load_one(&self.session, cx, op).await);
        Outcome::Ok(loaded.count())
    }

    fn prepare(&self) -> Result<(Arc<Model>, Query)> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let model = Arc::clone(self.session.schema().model(&self.model)?);
        if model.is_embedded() {
            return Err(Error::bad_model_request(
                model.name(),
                "embedded models have no collection of their own",
            ));
        }
        let query = self.parts.clone().build(model.name())?;
        Ok((model, query))
    }

    #[tracing::instrument(level = "debug", skip(self, cx, model, query), fields(model = %self.model))]
    async fn fetch(
        &self,
        cx: &Cx,
        model: &Arc<Model>,
        query: &Query,
        limit: Option<usize>,
    ) -> Outcome<(Vec<Document>, Option<PageInfo>), Error> {
        let short = try_result!(self.session.fire_hooks(&HookContext {
            point: HookPoint::BeforeRead,
            model: Some(model.name()),
            predicate: Some(query.predicate()),
            docs: &[],
        }));
        let (rows, page_info) = match short {
            Some(docs) => (docs, None),
            None => try_outcome!(self.load_rows(cx, model, query, limit).await),
        };
        let rows = match query.select() {
            Some(fields) => try_result!(project(model, rows, fields)),
            None => rows,
        };
        // After* hooks never abort
        let _ = self.session.fire_hooks(&HookContext {
            point: HookPoint::AfterRead,
            model: Some(model.name()),
            predicate: Some(query.predicate()),
            docs: &rows,
        });
        Outcome::Ok((rows, page_info))
    }

    async fn load_rows(
        &self,
        cx: &Cx,
        model: &Arc<Model>,
        query: &Query,
        limit: Option<usize>,
    ) -> Outcome<(Vec<Document>, Option<PageInfo>), Error> {
        let schema = self.session.schema();
        if let Some(raw) = query.id() {
            let id = try_result!(identity(schema, model, raw));
            let op = LoadOp::find(model.name(), identity_predicate(model, id));
            let rows = try_outcome!(load_one(&self.session, cx, op).await).into_rows();
            return Outcome::Ok((rows, None));
        }

        let predicate = try_outcome!(resolve(&self.session, cx, model, query.predicate()).await);
        let sort = try_result!(sort_keys(schema, model, query.sort()));
        let mut page = query.page().clone();
        if page.first.is_none() && page.last.is_none() && query.limit().is_none() && limit.is_none() {
            if let Some(size) = self.session.config().default_page_size {
                page.first = Some(size);
            }
        }

        if page.is_empty() {
            let op = LoadOp::find(model.name(), predicate)
                .sort(sort)
                .limit(limit.or(query.limit()));
            let rows = try_outcome!(load_one(&self.session, cx, op).await).into_rows();
            return Outcome::Ok((rows, None));
        }

        let sort = with_tiebreaker(sort, model.identity_key());
        let op = LoadOp::find(model.name(), predicate)
            .sort(sort.clone())
            .limit(fetch_limit(&page));
        let rows = try_outcome!(load_one(&self.session, cx, op).await).into_rows();
        let rows = if page.has_cursor() {
            try_result!(within_window(rows, &sort, &page))
        } else {
            rows
        };
        let page = paginate(rows, &sort, &page);
        Outcome::Ok((page.rows, Some(page.page_info)))
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Identities of the documents a targeted write applies to.
    async fn target_ids(&self, cx: &Cx, model: &Arc<Model>, query: &Query) -> Outcome<Vec<Value>, Error> {
        let schema = self.session.schema();
        if let Some(raw) = query.id() {
            return Outcome::Ok(vec![try_result!(identity(schema, model, raw))]);
        }
        let predicate = try_outcome!(resolve(&self.session, cx, model, query.predicate()).await);
        let sort = try_result!(sort_keys(schema, model, query.sort()));
        let op = LoadOp::find(model.name(), predicate)
            .sort(sort)
            .limit(query.limit());
        let rows = try_outcome!(load_one(&self.session, cx, op).await).into_rows();
        Outcome::Ok(
            rows.iter()
                .filter_map(|row| lookup(row, model.identity_key()).cloned())
                .collect(),
        )
    }

    #[tracing::instrument(
        level = "debug",
        skip(self, cx, tx, write),
        fields(model = %self.model, verb = write.verb())
    )]
    async fn record_write(&self, cx: &Cx, tx: &Transaction, write: Write) -> Outcome<Vec<Deferred>, Error> {
        let (model, query) = try_result!(self.prepare());
        try_result!(tx.ensure_pending());
        let schema = self.session.schema();
        let targeted = query.is_targeted();

        if !targeted && !matches!(write, Write::Save(_)) {
            return Outcome::Err(Error::bad_model_request(
                model.name(),
                format!("{}() requires id() or where()", write.verb()),
            ));
        }

        let (inputs, patch) = match write {
            Write::Remove => {
                try_result!(self.before_write(&model, &query, &[]));
                let ids = try_outcome!(self.target_ids(cx, &model, &query).await);
                let mut deferreds = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(deferred) = try_outcome!(delete_with_policies(tx, cx, &model, id).await) {
                        deferreds.push(deferred);
                    }
                }
                return Outcome::Ok(deferreds);
            }
            Write::Save(inputs) => {
                let mut mapped = Vec::with_capacity(inputs.len());
                for input in inputs {
                    let Value::Object(input) = input else {
                        return Outcome::Err(Error::bad_model_request(
                            model.name(),
                            format!("save() expects objects, got {input}"),
                        ));
                    };
                    mapped.push(try_result!(to_storage(schema, &model, &input)));
                }
                if targeted {
                    let mut patch = Patch::new();
                    for doc in &mapped {
                        let mut fields = doc.clone();
                        fields.remove(model.identity_key());
                        patch.mutations.extend(Patch::from_document(&fields).mutations);
                    }
                    (mapped, patch)
                } else {
                    for doc in &mapped {
                        try_result!(check_required(&model, doc));
                    }
                    (mapped, Patch::new())
                }
            }
            Write::Push(field, values) => {
                let path = try_result!(storage_path(schema, &model, &field));
                (Vec::new(), Patch::new().push(path, values))
            }
            Write::Pull(field, values) => {
                let path = try_result!(storage_path(schema, &model, &field));
                (Vec::new(), Patch::new().pull(path, values))
            }
            Write::Splice(field, from, to) => {
                let path = try_result!(storage_path(schema, &model, &field));
                (Vec::new(), Patch::new().replace(path, from, to))
            }
        };

        try_result!(self.before_write(&model, &query, &inputs));

        if !targeted {
            let mut deferreds = Vec::with_capacity(inputs.len());
            for input in inputs {
                deferreds.push(try_result!(tx.stage(
                    &model,
                    Op::Create {
                        collection: model.collection().to_string(),
                        input,
                    },
                )));
            }
            return Outcome::Ok(deferreds);
        }

        if patch.is_empty() {
            return Outcome::Ok(Vec::new());
        }
        let ids = try_outcome!(self.target_ids(cx, &model, &query).await);
        let mut deferreds = Vec::with_capacity(ids.len());
        for id in ids {
            deferreds.push(try_result!(tx.stage(
                &model,
                Op::Update {
                    collection: model.collection().to_string(),
                    id,
                    patch: patch.clone(),
                },
            )));
        }
        Outcome::Ok(deferreds)
    }

    fn before_write(&self, model: &Model, query: &Query, docs: &[Document]) -> Result<()> {
        self.session
            .fire_hooks(&HookContext {
                point: HookPoint::BeforeWrite,
                model: Some(model.name()),
                predicate: query.is_targeted().then(|| query.predicate()),
                docs,
            })
            .map(|_| ())
    }
}

async fn load_one(session: &Session, cx: &Cx, op: LoadOp) -> Outcome<Loaded, Error> {
    let mut results = try_outcome!(load(session, cx, vec![op]).await);
    match results.pop() {
        Some(result) => Outcome::Ok(try_result!(result)),
        None => Outcome::Err(Error::Custom("loader returned no result".to_string())),
    }
}

fn identity(schema: &Schema, model: &Model, raw: &Value) -> Result<Value> {
    schema.backend_for(model)?.identity_value(raw)
}

fn identity_predicate(model: &Model, id: Value) -> Document {
    let mut predicate = Document::new();
    predicate.insert(model.identity_key().to_string(), id);
    predicate
}

/// Map a dotted field-name path to its storage path, descending through
/// embedded models.
fn storage_path<'a>(schema: &'a Schema, model: &'a Model, name: &str) -> Result<String> {
    let segments: Vec<&str> = path_segments(name).collect();
    let mut keys = Vec::with_capacity(segments.len());
    let mut current = model;
    for (i, segment) in segments.iter().enumerate() {
        let Some(field) = current.field(segment) else {
            if *segment == current.identity_key() {
                keys.push((*segment).to_string());
                continue;
            }
            return Err(Error::bad_field(current.name(), *segment, "unknown field"));
        };
        keys.push(field.key.clone());
        if i + 1 < segments.len() {
            match &field.kind {
                FieldKind::Embedded { model: inner } => current = schema.model(inner)?.as_ref(),
                _ => {
                    return Err(Error::bad_field(
                        current.name(),
                        *segment,
                        "only embedded fields have nested paths",
                    ));
                }
            }
        }
    }
    Ok(keys.join("."))
}

fn sort_keys(schema: &Schema, model: &Model, sort: &SortSpec) -> Result<Vec<SortKey>> {
    sort.iter()
        .map(|(name, direction)| {
            Ok(SortKey {
                path: storage_path(schema, model, name)?,
                direction: *direction,
            })
        })
        .collect()
}

/// Rename input keys to storage keys, descending into embedded documents.
fn to_storage(schema: &Schema, model: &Model, input: &Document) -> Result<Document> {
    let mut out = Document::new();
    for (name, value) in input {
        let Some(field) = model.field(name) else {
            if name == model.identity_key() {
                out.insert(name.clone(), value.clone());
                continue;
            }
            return Err(Error::bad_field(model.name(), name.as_str(), "unknown field"));
        };
        let value = match &field.kind {
            FieldKind::Virtual { .. } => {
                return Err(Error::bad_field(
                    model.name(),
                    name.as_str(),
                    "virtual fields are derived and cannot be written",
                ));
            }
            FieldKind::Embedded { model: inner } => {
                let inner = schema.model(inner)?;
                match value {
                    Value::Object(doc) => Value::Object(to_storage(schema, inner, doc)?),
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .map(|item| match item {
                                Value::Object(doc) => to_storage(schema, inner, doc).map(Value::Object),
                                other => Ok(other.clone()),
                            })
                            .collect::<Result<_>>()?,
                    ),
                    other => other.clone(),
                }
            }
            FieldKind::Scalar | FieldKind::Reference { .. } => value.clone(),
        };
        out.insert(field.key.clone(), value);
    }
    Ok(out)
}

fn check_required(model: &Model, doc: &Document) -> Result<()> {
    for field in model.fields().iter().filter(|f| f.required) {
        if field.key == model.identity_key() {
            continue;
        }
        if doc.get(&field.key).is_none_or(Value::is_null) {
            return Err(Error::bad_field(
                model.name(),
                field.name.as_str(),
                "required field is missing",
            ));
        }
    }
    Ok(())
}

/// Keep the top-level keys named by `fields`, plus the identity key.
fn project(model: &Model, rows: Vec<Document>, fields: &[String]) -> Result<Vec<Document>> {
    let mut keys: Vec<&str> = vec![model.identity_key()];
    for name in fields {
        let head = path_segments(name).next().unwrap_or(name.as_str());
        let key = match model.field(head) {
            Some(field) => field.key.as_str(),
            None if head == model.identity_key() => continue,
            None => return Err(Error::bad_field(model.name(), head, "unknown field")),
        };
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    Ok(rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .filter(|(key, _)| keys.contains(&key.as_str()))
                .collect()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HookFlow, SessionConfig};
    use asupersync::runtime::RuntimeBuilder;
    use relata_core::{DeletePolicy, Field, ModelDef};
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

    fn schema(backend: &MemoryBackend) -> Schema {
        Schema::builder()
            .backend("mem", Arc::new(backend.clone()))
            .model(
                ModelDef::new("Person")
                    .field(Field::scalar("name").key("full_name").required())
                    .field(Field::scalar("tags").array())
                    .field(Field::embedded("address", "Address"))
                    .field(Field::virtual_ref("authored", "Book", "author")),
            )
            .model(ModelDef::embedded("Address").field(Field::scalar("city")))
            .model(
                ModelDef::new("Book")
                    .field(Field::scalar("name"))
                    .field(Field::reference("author", "Person").on_delete(DeletePolicy::Cascade)),
            )
            .build()
            .unwrap()
    }

    fn fixture() -> (Session, MemoryBackend) {
        let backend = MemoryBackend::new("mem");
        let schema = schema(&backend);
        backend.seed(
            "Person",
            [
                doc(json!({"id": "p1", "full_name": "ann", "tags": ["a"], "address": {"city": "Oslo"}})),
                doc(json!({"id": "p2", "full_name": "bo", "tags": [], "address": {"city": "Rome"}})),
                doc(json!({"id": "p3", "full_name": "cy", "tags": ["a", "b"], "address": {"city": "Oslo"}})),
            ],
        );
        backend.seed(
            "Book",
            [
                doc(json!({"id": "b1", "name": "Dune", "author": "p1"})),
                doc(json!({"id": "b2", "name": "Emma", "author": "p3"})),
            ],
        );
        (Session::new(schema), backend)
    }

    fn block_on<F: std::future::Future>(f: F) -> F::Output {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    #[test]
    fn test_id_excludes_shape() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        block_on(async {
            let err = unwrap_err(
                session
                    .query("Person")
                    .id("p1")
                    .sort_by(json!("name"))
                    .many(&cx)
                    .await,
            );
            assert!(err.is_bad_request());
            assert_eq!(backend.stats().reads(), 0);
        });
    }

    #[test]
    fn test_one_by_id_and_required() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        block_on(async {
            let ann = unwrap_outcome(session.query("Person").id("p1").one(&cx).await).unwrap();
            assert_eq!(ann.get("name"), Some(&json!("ann")));
            assert_eq!(backend.stats().get, 1);

            let err = unwrap_err(session.query("Person").id("p9").one_required(&cx).await);
            assert!(err.is_not_found());
            assert_eq!(err.model(), Some("Person"));
        });
    }

    #[test]
    fn test_many_resolves_relationships_and_sorts_by_storage_key() {
        let cx = Cx::for_testing();
        let (session, _backend) = fixture();
        block_on(async {
            let people = unwrap_outcome(
                session
                    .query("Person")
                    .where_(json!({"address": {"city": "Oslo"}}))
                    .sort_by(json!("-name"))
                    .many(&cx)
                    .await,
            );
            assert_eq!(people.values("name"), vec![json!("cy"), json!("ann")]);
            assert!(people.page_info.is_none());

            let authors = unwrap_outcome(
                session
                    .query("Person")
                    .where_(json!({"authored": {"name": "Emma"}}))
                    .many(&cx)
                    .await,
            );
            assert_eq!(authors.values("id"), vec![json!("p3")]);
        });
    }

    #[test]
    fn test_first_then_after() {
        let cx = Cx::for_testing();
        let (session, _backend) = fixture();
        block_on(async {
            let page = unwrap_outcome(
                session
                    .query("Book")
                    .sort_by(json!({"name": "asc"}))
                    .first(&cx, 1)
                    .await,
            );
            let info = page.page_info.clone().unwrap();
            assert_eq!(page.values("name"), vec![json!("Dune")]);
            assert!(info.has_next_page);
            assert!(!info.has_previous_page);

            let next = unwrap_outcome(
                session
                    .query("Book")
                    .sort_by(json!({"name": "asc"}))
                    .after(info.end_cursor)
                    .first(&cx, 1)
                    .await,
            );
            let info = next.page_info.clone().unwrap();
            assert_eq!(next.values("name"), vec![json!("Emma")]);
            assert!(info.has_previous_page);
            assert!(!info.has_next_page);
        });
    }

    #[test]
    fn test_last_and_default_page_size() {
        let cx = Cx::for_testing();
        let backend = MemoryBackend::new("mem");
        let schema = schema(&backend);
        backend.seed(
            "Book",
            (1..=5).map(|n| doc(json!({"id": format!("b{n}"), "name": format!("n{n}")}))),
        );
        let session = Session::with_config(schema, SessionConfig::default().default_page_size(Some(2)));
        block_on(async {
            let tail = unwrap_outcome(
                session
                    .query("Book")
                    .sort_by(json!("name"))
                    .last(&cx, 2)
                    .await,
            );
            assert_eq!(tail.values("name"), vec![json!("n4"), json!("n5")]);
            assert!(tail.page_info.as_ref().unwrap().has_previous_page);

            let paged = unwrap_outcome(session.query("Book").sort_by(json!("name")).many(&cx).await);
            assert_eq!(paged.len(), 2);
            assert!(paged.page_info.unwrap().has_next_page);

            let limited = unwrap_outcome(session.query("Book").limit(3).many(&cx).await);
            assert_eq!(limited.len(), 3);
            assert!(limited.page_info.is_none());
        });
    }

    #[test]
    fn test_select_keeps_identity() {
        let cx = Cx::for_testing();
        let (session, _backend) = fixture();
        block_on(async {
            let people = unwrap_outcome(
                session
                    .query("Person")
                    .where_(json!({"name": "ann"}))
                    .select(["name"])
                    .many(&cx)
                    .await,
            );
            assert_eq!(
                people.into_documents(),
                vec![doc(json!({"id": "p1", "full_name": "ann"}))]
            );
        });
    }

    #[test]
    fn test_count() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        block_on(async {
            let n = unwrap_outcome(
                session
                    .query("Person")
                    .where_(json!({"tags": "a"}))
                    .count(&cx)
                    .await,
            );
            assert_eq!(n, 2);
            assert_eq!(backend.stats().count, 1);
        });
    }

    #[test]
    fn test_save_creates_and_checks_required_fields() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        block_on(async {
            let created = unwrap_outcome(
                session
                    .query("Person")
                    .save(&cx, vec![json!({"name": "dee", "address": {"city": "Bern"}})])
                    .await,
            );
            assert_eq!(created.len(), 1);
            assert_eq!(created[0].get("name"), Some(&json!("dee")));
            let id = created[0].id().cloned().unwrap();
            assert_eq!(backend.document("Person", &id).unwrap()["full_name"], json!("dee"));

            let err = unwrap_err(session.query("Person").save(&cx, vec![json!({"tags": []})]).await);
            assert!(err.is_bad_request());
            assert!(err.to_string().contains("name"));

            let err = unwrap_err(
                session
                    .query("Person")
                    .save(&cx, vec![json!({"name": "x", "authored": ["b1"]})])
                    .await,
            );
            assert!(err.is_bad_request());
            assert_eq!(backend.documents("Person").len(), 4);
        });
    }

    #[test]
    fn test_save_patches_targets() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        block_on(async {
            let updated = unwrap_outcome(
                session
                    .query("Person")
                    .where_(json!({"address": {"city": "Oslo"}}))
                    .save(&cx, vec![json!({"address": {"city": "Bergen"}})])
                    .await,
            );
            assert_eq!(updated.len(), 2);
            for id in ["p1", "p3"] {
                let stored = backend.document("Person", &json!(id)).unwrap();
                assert_eq!(stored["address"], json!({"city": "Bergen"}));
            }
            assert_eq!(
                backend.document("Person", &json!("p2")).unwrap()["address"],
                json!({"city": "Rome"})
            );
        });
    }

    #[test]
    fn test_array_verbs() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        block_on(async {
            unwrap_outcome(session.query("Person").id("p2").push(&cx, "tags", vec![json!("x"), json!("y")]).await);
            unwrap_outcome(session.query("Person").id("p2").pull(&cx, "tags", vec![json!("x")]).await);
            unwrap_outcome(
                session
                    .query("Person")
                    .id("p2")
                    .splice(&cx, "tags", json!("y"), json!("z"))
                    .await,
            );
            assert_eq!(backend.document("Person", &json!("p2")).unwrap()["tags"], json!(["z"]));

            let err = unwrap_err(session.query("Person").push(&cx, "tags", vec![json!("q")]).await);
            assert!(err.is_bad_request());
        });
    }

    #[test]
    fn test_remove_requires_target_and_cascades() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        block_on(async {
            let err = unwrap_err(session.query("Person").remove(&cx).await);
            assert!(err.is_bad_request());

            let removed = unwrap_outcome(session.query("Person").id("p1").remove(&cx).await);
            assert_eq!(removed.len(), 1);
            assert!(backend.document("Person", &json!("p1")).is_none());
            assert!(backend.document("Book", &json!("b1")).is_none());
            assert!(backend.document("Book", &json!("b2")).is_some());
        });
    }

    #[test]
    fn test_staged_writes_wait_for_exec() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        block_on(async {
            let tx = session.transaction();
            let created = unwrap_outcome(
                tx.query("Book")
                    .save(&cx, vec![json!({"name": "Solaris", "author": "p2"})])
                    .await,
            );
            assert_eq!(created.len(), 1);
            assert!(!created[0].is_resolved());
            assert_eq!(backend.documents("Book").len(), 2);

            unwrap_outcome(tx.run(&cx).await);
            assert_eq!(created[0].get().unwrap()["name"], json!("Solaris"));
            assert_eq!(backend.documents("Book").len(), 3);
        });
    }

    #[test]
    fn test_read_hooks() {
        let cx = Cx::for_testing();
        let (session, backend) = fixture();
        session.add_hook(HookPoint::BeforeRead, |ctx| {
            if ctx.model == Some("Book") {
                Ok(HookFlow::ShortCircuit(vec![Document::new()]))
            } else {
                Ok(HookFlow::Continue)
            }
        });
        session.add_hook(HookPoint::BeforeWrite, |ctx| {
            if ctx.docs.iter().any(|d| d.contains_key("full_name") && d["full_name"] == json!("")) {
                Err(Error::bad_request("name must not be empty"))
            } else {
                Ok(HookFlow::Continue)
            }
        });
        block_on(async {
            let books = unwrap_outcome(session.query("Book").many(&cx).await);
            assert_eq!(books.len(), 1);
            assert_eq!(backend.stats().reads(), 0);

            let err = unwrap_err(session.query("Person").save(&cx, vec![json!({"name": ""})]).await);
            assert!(err.is_bad_request());
            assert_eq!(backend.stats().transaction, 0);
        });
    }
}
