//! Relationship predicate resolution.
//!
//! A where-predicate may reach through reference, virtual and embedded
//! fields to arbitrary depth:
//!
//! ```text
//! Person { authored: { chapters: { pages: { verbage: "the end." } } } }
//! ```
//!
//! Resolution rewrites it into a predicate over the model's own storage keys
//! whose leaves are scalars or identifier lists, evaluable by one backend
//! call.
//!
//! The predicate is first planned into *scopes* (one per nested object that
//! must be looked up separately) and *relations* (the field linking a scope
//! to its lookups). Embedded fields stay inside their scope as dotted storage
//! keys and do not count as hops. Relations are then processed from the
//! deepest hop to the shallowest. All lookups of one hop go through the
//! batched loader in a single pass; their identities (or, for a virtual
//! field, the values of the materialising field) replace the nested object
//! one level up. A predicate without nested relation objects is mapped to
//! storage keys without any backend call.

use crate::Session;
use crate::loader::{LoadOp, load};
use relata_core::value::{collect_at_path, flatten_values, push_unique};
use relata_core::{
    Cx, Document, Error, FieldKind, Model, Outcome, Result, Value, try_outcome, try_result,
};
use relata_query::KeyPath;
use relata_query::predicate::constrain;
use std::sync::Arc;

/// One predicate evaluated against one model.
#[derive(Debug)]
struct Scope {
    model: Arc<Model>,
    leaves: Document,
    hop: usize,
}

/// How a relation's lookup results feed its owning scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    /// The owning scope stores the looked-up identities.
    Reference,
    /// The looked-up documents store the owning scope's identity.
    Virtual,
}

#[derive(Debug)]
struct Relation {
    /// Scope that receives the resolved identifiers
    scope: usize,
    /// Storage key in the owning scope that receives them
    key: String,
    link: Link,
    /// Model the alternatives are looked up on
    lookup: Arc<Model>,
    /// Storage path collected from each looked-up document
    collect: String,
    /// Identifiers given directly alongside nested objects
    raw: Vec<Value>,
    /// Scopes whose matches are unioned
    alternatives: Vec<usize>,
    hop: usize,
    path: KeyPath,
}

#[derive(Debug, Default)]
struct Plan {
    scopes: Vec<Scope>,
    relations: Vec<Relation>,
}

impl Plan {
    fn add_scope(&mut self, model: Arc<Model>, hop: usize) -> usize {
        self.scopes.push(Scope {
            model,
            leaves: Document::new(),
            hop,
        });
        self.scopes.len() - 1
    }
}

struct Planner<'s> {
    session: &'s Session,
    max_depth: usize,
    plan: Plan,
}

impl Planner<'_> {
    /// Plan `predicate` into `scope`. `model` is the scope's model or an
    /// embedded model reached from it under `prefix`.
    fn plan_object(
        &mut self,
        scope: usize,
        model: &Model,
        prefix: &str,
        predicate: &Document,
        path: &KeyPath,
    ) -> Result<()> {
        for (name, value) in predicate {
            let Some(field) = model.field(name) else {
                // An already-resolved dotted key through an embedded field
                if let Some((head, rest)) = name.split_once('.') {
                    if let Some(field) = model.field(head).filter(|f| f.is_embedded()) {
                        let mut nested = Document::new();
                        nested.insert(rest.to_string(), value.clone());
                        let embedded = self.related(model, field.related_model())?;
                        let prefix = format!("{prefix}{}.", field.key);
                        self.plan_object(scope, &embedded, &prefix, &nested, &path.child(head))?;
                        continue;
                    }
                }
                return Err(Error::bad_field(model.name(), name, "unknown field"));
            };
            let key = format!("{prefix}{}", field.key);
            let field_path = path.child(field.name.clone());
            match &field.kind {
                FieldKind::Scalar => {
                    insert_leaf(&mut self.plan.scopes[scope].leaves, key, value.clone());
                }
                FieldKind::Embedded { model: embedded } => match value {
                    Value::Object(nested) => {
                        let embedded = self.related(model, Some(embedded.as_str()))?;
                        let prefix = format!("{key}.");
                        self.plan_object(scope, &embedded, &prefix, nested, &field_path)?;
                    }
                    other => insert_leaf(&mut self.plan.scopes[scope].leaves, key, other.clone()),
                },
                FieldKind::Reference { target } => {
                    let (raw, objects) = split_alternatives(value);
                    if objects.is_empty() {
                        insert_leaf(&mut self.plan.scopes[scope].leaves, key, value.clone());
                        continue;
                    }
                    let target = self.related(model, Some(target.as_str()))?;
                    let collect = target.identity_key().to_string();
                    self.plan_relation(
                        scope,
                        key,
                        Link::Reference,
                        target,
                        collect,
                        raw,
                        &objects,
                        field_path,
                    )?;
                }
                FieldKind::Virtual { target, via } => {
                    if !prefix.is_empty() {
                        return Err(Error::bad_field(
                            model.name(),
                            &field.name,
                            "virtual fields cannot be filtered inside embedded documents",
                        ));
                    }
                    let target = self.related(model, Some(target.as_str()))?;
                    let collect = target.storage_key(via).to_string();
                    let (raw, mut objects) = split_alternatives(value);
                    if !raw.is_empty() {
                        // Direct identities of the virtual side are looked up
                        // like any other alternative
                        let mut by_id = Document::new();
                        by_id.insert(target.identity_key().to_string(), Value::Array(raw));
                        objects.push(by_id);
                    }
                    let key = self.plan.scopes[scope].model.identity_key().to_string();
                    self.plan_relation(
                        scope,
                        key,
                        Link::Virtual,
                        target,
                        collect,
                        Vec::new(),
                        &objects,
                        field_path,
                    )?;
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn plan_relation(
        &mut self,
        scope: usize,
        key: String,
        link: Link,
        lookup: Arc<Model>,
        collect: String,
        raw: Vec<Value>,
        objects: &[Document],
        path: KeyPath,
    ) -> Result<()> {
        let hop = self.plan.scopes[scope].hop + 1;
        if hop > self.max_depth {
            return Err(Error::bad_model_request(
                self.plan.scopes[0].model.name(),
                format!(
                    "predicate path '{path}' exceeds the maximum relation depth of {}",
                    self.max_depth
                ),
            ));
        }
        let mut alternatives = Vec::with_capacity(objects.len());
        for object in objects {
            let alt = self.plan.add_scope(Arc::clone(&lookup), hop);
            self.plan_object(alt, &lookup, "", object, &path)?;
            alternatives.push(alt);
        }
        self.plan.relations.push(Relation {
            scope,
            key,
            link,
            lookup,
            collect,
            raw,
            alternatives,
            hop,
            path,
        });
        Ok(())
    }

    fn related(&self, owner: &Model, target: Option<&str>) -> Result<Arc<Model>> {
        let target = target.ok_or_else(|| {
            Error::bad_model_request(owner.name(), "relation field without a target model")
        })?;
        self.session.schema().model(target).cloned()
    }
}

/// Insert a leaf, intersecting identity lists when the key is already
/// constrained.
fn insert_leaf(leaves: &mut Document, key: String, value: Value) {
    if leaves.contains_key(&key) {
        constrain(leaves, &key, flatten_values(&value));
    } else {
        leaves.insert(key, value);
    }
}

/// Split a relation value into direct identifiers and nested predicate
/// objects.
fn split_alternatives(value: &Value) -> (Vec<Value>, Vec<Document>) {
    let mut raw = Vec::new();
    let mut objects = Vec::new();
    let items: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    for item in items {
        match item {
            Value::Object(object) => objects.push(object.clone()),
            Value::Null => {}
            other => push_unique(&mut raw, other.clone()),
        }
    }
    (raw, objects)
}

/// Resolve `predicate` against `model`.
#[tracing::instrument(level = "debug", skip(session, cx, model, predicate), fields(model = %model.name()))]
pub(crate) async fn resolve(
    session: &Session,
    cx: &Cx,
    model: &Arc<Model>,
    predicate: &Document,
) -> Outcome<Document, Error> {
    let mut planner = Planner {
        session,
        max_depth: session.config().max_relation_depth,
        plan: Plan::default(),
    };
    let root = planner.plan.add_scope(Arc::clone(model), 0);
    try_result!(planner.plan_object(root, model, "", predicate, &KeyPath::root()));
    let Plan {
        mut scopes,
        relations,
    } = planner.plan;

    let Some(max_hop) = relations.iter().map(|r| r.hop).max() else {
        tracing::trace!("Predicate is flat; no lookups needed");
        return Outcome::Ok(scopes.swap_remove(root).leaves);
    };

    for hop in (1..=max_hop).rev() {
        let level: Vec<&Relation> = relations.iter().filter(|r| r.hop == hop).collect();
        let mut ops = Vec::new();
        let mut owners = Vec::new();
        for (r, relation) in level.iter().enumerate() {
            for &alt in &relation.alternatives {
                ops.push(LoadOp::find(relation.lookup.name(), scopes[alt].leaves.clone()));
                owners.push(r);
            }
        }
        tracing::debug!(hop, relations = level.len(), lookups = ops.len(), "Resolving relation hop");

        let results = try_outcome!(load(session, cx, ops).await);

        let mut collected: Vec<Vec<Value>> = level.iter().map(|r| r.raw.clone()).collect();
        for (owner, result) in owners.into_iter().zip(results) {
            let rows = match result {
                Ok(loaded) => loaded.into_rows(),
                Err(e) => return Outcome::Err(e),
            };
            let collect = &level[owner].collect;
            for row in &rows {
                for value in collect_at_path(row, collect) {
                    for id in flatten_values(value) {
                        push_unique(&mut collected[owner], id);
                    }
                }
            }
        }

        for (relation, ids) in level.iter().zip(collected) {
            tracing::trace!(
                path = %relation.path,
                matches = ids.len(),
                "Substituting resolved identifiers"
            );
            let leaves = &mut scopes[relation.scope].leaves;
            match relation.link {
                Link::Reference => {
                    insert_leaf(leaves, relation.key.clone(), Value::Array(ids));
                }
                Link::Virtual => constrain(leaves, &relation.key, ids),
            }
        }
    }

    Outcome::Ok(scopes.swap_remove(root).leaves)
}
