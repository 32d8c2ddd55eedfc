//! Model metadata.
//!
//! A [`Model`] is built once by [`SchemaBuilder`](crate::schema::SchemaBuilder)
//! and is read-only afterwards. It carries the referential-integrity edges
//! that point *into* it, precomputed from every other model's reference
//! fields.

use crate::field::{DeletePolicy, Field};

/// A precomputed `(source model, field, policy)` triple describing what must
/// happen to documents of `source` when a document of the owning model is
/// deleted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferentialEdge {
    /// Model whose documents hold the reference
    pub source: String,
    /// Name of the reference field (on `source` or on an embedded model)
    pub field: String,
    /// Storage path from the root of a `source` document to the reference
    pub path: String,
    /// Storage key of the embedded field the path goes through, if any
    pub through: Option<String>,
    /// Whether the reference field holds a list of identities
    pub array: bool,
    /// What to do with referencing documents
    pub policy: DeletePolicy,
}

/// A named entity type with fields and a storage backend.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) name: String,
    pub(crate) collection: String,
    pub(crate) identity_key: String,
    pub(crate) backend: Option<String>,
    pub(crate) embedded: bool,
    pub(crate) fields: Vec<Field>,
    pub(crate) edges: Vec<ReferentialEdge>,
}

impl Model {
    /// Model name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage name of the collection holding this model's documents.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Storage key of the identity field.
    pub fn identity_key(&self) -> &str {
        &self.identity_key
    }

    /// Name of the backend adapter. `None` for embedded models.
    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    /// Embedded models have no collection of their own.
    pub fn is_embedded(&self) -> bool {
        self.embedded
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Referential edges pointing into this model.
    pub fn edges(&self) -> &[ReferentialEdge] {
        &self.edges
    }

    /// Look up a field by name, falling back to its storage key.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .or_else(|| self.fields.iter().find(|f| f.key == name))
    }

    /// The identity field.
    pub fn identity_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.key == self.identity_key)
    }

    /// Storage key for a field name. Unknown names map to themselves.
    pub fn storage_key<'a>(&'a self, name: &'a str) -> &'a str {
        self.field(name).map_or(name, |f| f.key.as_str())
    }
}

/// Declarative input for one model, consumed by
/// [`SchemaBuilder::model`](crate::schema::SchemaBuilder::model).
#[derive(Debug, Clone)]
pub struct ModelDef {
    pub name: String,
    pub collection: Option<String>,
    pub identity_key: Option<String>,
    pub backend: Option<String>,
    pub embedded: bool,
    pub fields: Vec<Field>,
}

impl ModelDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collection: None,
            identity_key: None,
            backend: None,
            embedded: false,
            fields: Vec::new(),
        }
    }

    /// Declare an embedded (invisible) model: stored inside other documents.
    pub fn embedded(name: impl Into<String>) -> Self {
        Self {
            embedded: true,
            ..Self::new(name)
        }
    }

    /// Storage name; defaults to the model name.
    #[must_use]
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Identity key; defaults to the backend's identity key.
    #[must_use]
    pub fn identity_key(mut self, key: impl Into<String>) -> Self {
        self.identity_key = Some(key.into());
        self
    }

    /// Backend name; may be omitted when the schema has exactly one backend.
    #[must_use]
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    #[must_use]
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }
}
