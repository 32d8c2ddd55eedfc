//! Schema registry.
//!
//! A [`Schema`] is an explicit, immutable value: models and backends are
//! registered on a [`SchemaBuilder`], validated together, and frozen. Nothing
//! is registered through global state.
//!
//! # Example
//!
//! ```ignore
//! let schema = SchemaBuilder::new()
//!     .backend("default", Arc::new(MemoryBackend::new("default")))
//!     .model(ModelDef::new("Person").field(Field::scalar("name")))
//!     .model(
//!         ModelDef::new("Book")
//!             .field(Field::scalar("title"))
//!             .field(Field::reference("author", "Person").on_delete(DeletePolicy::Cascade)),
//!     )
//!     .build()?;
//!
//! assert_eq!(schema.model("Person")?.edges().len(), 1);
//! ```

use crate::backend::Backend;
use crate::error::{Error, Result, SchemaErrorKind};
use crate::field::{Field, FieldKind};
use crate::model::{Model, ModelDef, ReferentialEdge};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Immutable set of models and the backends they live in.
#[derive(Clone)]
pub struct Schema {
    models: Vec<Arc<Model>>,
    by_name: HashMap<String, usize>,
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl std::fmt::Debug for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut backends: Vec<&String> = self.backends.keys().collect();
        backends.sort();
        f.debug_struct("Schema")
            .field(
                "models",
                &self.models.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .field("backends", &backends)
            .finish()
    }
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    /// Look up a model by name.
    pub fn model(&self, name: &str) -> Result<&Arc<Model>> {
        self.by_name
            .get(name)
            .map(|&idx| &self.models[idx])
            .ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownModel,
                    format!("unknown model '{}'", name),
                )
            })
    }

    /// All models in registration order.
    pub fn models(&self) -> &[Arc<Model>] {
        &self.models
    }

    /// Look up a backend by name.
    pub fn backend(&self, name: &str) -> Result<&Arc<dyn Backend>> {
        self.backends.get(name).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownBackend,
                format!("unknown backend '{}'", name),
            )
        })
    }

    /// The backend a model's documents live in.
    pub fn backend_for(&self, model: &Model) -> Result<&Arc<dyn Backend>> {
        let Some(name) = model.backend() else {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!("embedded model '{}' has no backend", model.name()),
            ));
        };
        self.backend(name)
    }
}

/// Builder that validates models and precomputes referential edges.
#[derive(Default)]
pub struct SchemaBuilder {
    defs: Vec<ModelDef>,
    backends: Vec<(String, Arc<dyn Backend>)>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under `name`.
    #[must_use]
    pub fn backend(mut self, name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.backends.push((name.into(), backend));
        self
    }

    /// Register a model definition.
    #[must_use]
    pub fn model(mut self, def: ModelDef) -> Self {
        self.defs.push(def);
        self
    }

    /// Validate and freeze the schema.
    pub fn build(self) -> Result<Schema> {
        let backends: HashMap<String, Arc<dyn Backend>> = self.backends.into_iter().collect();

        let mut by_name = HashMap::new();
        for (idx, def) in self.defs.iter().enumerate() {
            if by_name.insert(def.name.clone(), idx).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateModel,
                    format!("model '{}' registered twice", def.name),
                ));
            }
        }

        let mut models = Vec::with_capacity(self.defs.len());
        for def in &self.defs {
            models.push(resolve_model(def, &backends)?);
        }

        for model in &models {
            validate_fields(model, &models, &by_name)?;
        }

        let edges = compute_edges(&models, &by_name);
        for model in &mut models {
            if let Some(into) = edges.get(&model.name) {
                model.edges.clone_from(into);
            }
            tracing::trace!(
                model = %model.name,
                edges = model.edges.len(),
                "Computed referential edges"
            );
        }

        Ok(Schema {
            models: models.into_iter().map(Arc::new).collect(),
            by_name,
            backends,
        })
    }
}

fn resolve_model(def: &ModelDef, backends: &HashMap<String, Arc<dyn Backend>>) -> Result<Model> {
    let backend = if def.embedded {
        None
    } else if let Some(name) = &def.backend {
        if !backends.contains_key(name) {
            return Err(Error::schema(
                SchemaErrorKind::UnknownBackend,
                format!("model '{}' uses unknown backend '{}'", def.name, name),
            ));
        }
        Some(name.clone())
    } else if backends.len() == 1 {
        backends.keys().next().cloned()
    } else {
        return Err(Error::schema(
            SchemaErrorKind::UnknownBackend,
            format!(
                "model '{}' does not name a backend and {} are registered",
                def.name,
                backends.len()
            ),
        ));
    };

    let identity_key = match (&def.identity_key, &backend) {
        (Some(key), _) => key.clone(),
        (None, Some(name)) => backends[name].identity_key().to_string(),
        (None, None) => "id".to_string(),
    };

    let mut fields = def.fields.clone();
    if !def.embedded && !fields.iter().any(|f| f.key == identity_key) {
        fields.insert(0, Field::scalar(identity_key.clone()));
    }

    Ok(Model {
        name: def.name.clone(),
        collection: def.collection.clone().unwrap_or_else(|| def.name.clone()),
        identity_key,
        backend,
        embedded: def.embedded,
        fields,
        edges: Vec::new(),
    })
}

fn validate_fields(
    model: &Model,
    models: &[Model],
    by_name: &HashMap<String, usize>,
) -> Result<()> {
    let lookup = |target: &str, field: &Field| find_target(model, field, target, models, by_name);

    for field in &model.fields {
        match &field.kind {
            FieldKind::Scalar => {}
            FieldKind::Embedded { model: target } => {
                let inner = lookup(target, field)?;
                if !inner.embedded {
                    return Err(Error::schema(
                        SchemaErrorKind::Invalid,
                        format!(
                            "{}.{} embeds '{}', which is not an embedded model",
                            model.name, field.name, target
                        ),
                    ));
                }
            }
            FieldKind::Reference { target } => {
                let referenced = lookup(target, field)?;
                if referenced.embedded {
                    return Err(Error::schema(
                        SchemaErrorKind::Invalid,
                        format!(
                            "{}.{} references embedded model '{}'",
                            model.name, field.name, target
                        ),
                    ));
                }
            }
            FieldKind::Virtual { target, via } => {
                let referenced = lookup(target, field)?;
                let points_back = referenced.field(via).is_some_and(|f| {
                    matches!(&f.kind, FieldKind::Reference { target } if *target == model.name)
                });
                if !points_back {
                    return Err(Error::schema(
                        SchemaErrorKind::Invalid,
                        format!(
                            "{}.{} is materialized by {}.{}, which does not reference {}",
                            model.name, field.name, target, via, model.name
                        ),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn find_target<'m>(
    owner: &Model,
    field: &Field,
    target: &str,
    models: &'m [Model],
    by_name: &HashMap<String, usize>,
) -> Result<&'m Model> {
    by_name
        .get(target)
        .map(|&idx| &models[idx])
        .ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownModel,
                format!(
                    "{}.{} references unknown model '{}'",
                    owner.name, field.name, target
                ),
            )
        })
}

/// Scan every visible model for references (direct or through embedded
/// models) and group the resulting edges by the model they point into.
///
/// Edges are unique per `(source, path)`; the first declaration wins.
fn compute_edges(
    models: &[Model],
    by_name: &HashMap<String, usize>,
) -> HashMap<String, Vec<ReferentialEdge>> {
    let mut into: HashMap<String, Vec<ReferentialEdge>> = HashMap::new();
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for source in models.iter().filter(|m| !m.embedded) {
        let mut visiting = vec![source.name.clone()];
        let mut found = Vec::new();
        walk_references(
            source,
            &source.name,
            None,
            None,
            models,
            by_name,
            &mut visiting,
            &mut found,
        );
        for (target, edge) in found {
            if seen.insert((edge.source.clone(), edge.path.clone())) {
                into.entry(target).or_default().push(edge);
            }
        }
    }
    into
}

#[allow(clippy::too_many_arguments)]
fn walk_references(
    owner: &Model,
    source: &str,
    prefix: Option<&str>,
    through: Option<&str>,
    models: &[Model],
    by_name: &HashMap<String, usize>,
    visiting: &mut Vec<String>,
    found: &mut Vec<(String, ReferentialEdge)>,
) {
    for field in &owner.fields {
        let path = match prefix {
            Some(p) => format!("{}.{}", p, field.key),
            None => field.key.clone(),
        };
        match &field.kind {
            FieldKind::Reference { target } => {
                let Some(policy) = field.on_delete else {
                    continue;
                };
                found.push((
                    target.clone(),
                    ReferentialEdge {
                        source: source.to_string(),
                        field: field.name.clone(),
                        path,
                        through: through.map(str::to_string),
                        array: field.array,
                        policy,
                    },
                ));
            }
            FieldKind::Embedded { model } => {
                // Recursive embedded definitions would walk forever.
                if visiting.iter().any(|v| v == model) {
                    continue;
                }
                let Some(&idx) = by_name.get(model) else {
                    continue;
                };
                visiting.push(model.clone());
                walk_references(
                    &models[idx],
                    source,
                    Some(path.as_str()),
                    Some(through.unwrap_or(field.key.as_str())),
                    models,
                    by_name,
                    visiting,
                    found,
                );
                visiting.pop();
            }
            FieldKind::Scalar | FieldKind::Virtual { .. } => {}
        }
    }
}
