//! Field definitions.

/// What happens to referencing documents when the referenced document is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeletePolicy {
    /// Delete the referencing document (or pull the id out of an array reference).
    Cascade,
    /// Set the referencing field to null.
    Nullify,
    /// Forbid the delete while any referencing document exists.
    Restrict,
}

impl DeletePolicy {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeletePolicy::Cascade => "cascade",
            DeletePolicy::Nullify => "nullify",
            DeletePolicy::Restrict => "restrict",
        }
    }

    /// Parse a policy name (case-insensitive).
    ///
    /// Returns `None` if the string is not a recognized policy.
    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cascade" => Some(DeletePolicy::Cascade),
            "nullify" | "set null" | "set_null" | "setnull" => Some(DeletePolicy::Nullify),
            "restrict" | "no action" | "no_action" => Some(DeletePolicy::Restrict),
            _ => None,
        }
    }
}

/// How a field's value is stored and resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// A plain value stored on the document.
    Scalar,
    /// A nested object described by another (embedded) model.
    Embedded { model: String },
    /// Holds the identity of a document of `target` (a foreign key).
    Reference { target: String },
    /// Not stored: materialized from the documents of `target` whose `via`
    /// field references this document.
    Virtual { target: String, via: String },
}

/// Metadata about a model field.
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name as callers spell it
    pub name: String,
    /// Storage key (may differ from the field name)
    pub key: String,
    /// Kind of value held
    pub kind: FieldKind,
    /// Whether the field holds a list
    pub array: bool,
    /// Whether a value must be supplied on create
    pub required: bool,
    /// Delete policy applied when the referenced document goes away
    pub on_delete: Option<DeletePolicy>,
}

impl Field {
    /// Create a scalar field whose storage key equals its name.
    pub fn scalar(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            key: name.clone(),
            name,
            kind: FieldKind::Scalar,
            array: false,
            required: false,
            on_delete: None,
        }
    }

    /// Create a reference field pointing at `target`.
    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::Reference {
                target: target.into(),
            },
            ..Self::scalar(name)
        }
    }

    /// Create a virtual field materialized from `target.via`.
    pub fn virtual_ref(
        name: impl Into<String>,
        target: impl Into<String>,
        via: impl Into<String>,
    ) -> Self {
        Self {
            kind: FieldKind::Virtual {
                target: target.into(),
                via: via.into(),
            },
            array: true,
            ..Self::scalar(name)
        }
    }

    /// Create an embedded field described by `model`.
    pub fn embedded(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::Embedded {
                model: model.into(),
            },
            ..Self::scalar(name)
        }
    }

    /// Set the storage key.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Mark the field as list-valued.
    #[must_use]
    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }

    /// Mark the field as single-valued.
    #[must_use]
    pub fn single(mut self) -> Self {
        self.array = false;
        self
    }

    /// Mark the field as required on create.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Set the delete policy (only meaningful on reference fields).
    #[must_use]
    pub fn on_delete(mut self, policy: DeletePolicy) -> Self {
        self.on_delete = Some(policy);
        self
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, FieldKind::Scalar)
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference { .. })
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, FieldKind::Virtual { .. })
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self.kind, FieldKind::Embedded { .. })
    }

    /// Whether a nested predicate under this field crosses a relationship.
    pub fn is_relation(&self) -> bool {
        self.is_reference() || self.is_virtual()
    }

    /// The model this field points at, for reference/virtual/embedded fields.
    pub fn related_model(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Scalar => None,
            FieldKind::Embedded { model } => Some(model),
            FieldKind::Reference { target } | FieldKind::Virtual { target, .. } => Some(target),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_parse_roundtrip() {
        for policy in [
            DeletePolicy::Cascade,
            DeletePolicy::Nullify,
            DeletePolicy::Restrict,
        ] {
            assert_eq!(DeletePolicy::from_str(policy.as_str()), Some(policy));
        }
        assert_eq!(DeletePolicy::from_str("SET NULL"), Some(DeletePolicy::Nullify));
        assert_eq!(DeletePolicy::from_str("defer"), None);
    }

    #[test]
    fn builders_set_kind_and_flags() {
        let f = Field::reference("author", "Person")
            .key("author_id")
            .required()
            .on_delete(DeletePolicy::Cascade);
        assert_eq!(f.name, "author");
        assert_eq!(f.key, "author_id");
        assert!(f.is_reference());
        assert!(f.is_relation());
        assert!(f.required);
        assert_eq!(f.related_model(), Some("Person"));

        let v = Field::virtual_ref("books", "Book", "author");
        assert!(v.is_virtual());
        assert!(v.array);
        assert!(!v.single().array);
        assert!(Field::scalar("tags").array().array);
        assert!(!Field::scalar("name").is_relation());
    }
}
