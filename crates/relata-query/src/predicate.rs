//! Predicate key paths and identity constraints.
//!
//! Resolved predicates are flat maps from storage path to either a scalar
//! (equality) or an array (membership). The helpers here let the resolver and
//! the batched loader reason about the identity-key constraint of such a
//! predicate without knowing which backend will evaluate it.

use relata_core::value::{flatten_values, lookup, push_unique, values_equal};
use relata_core::{Document, Value};
use std::fmt;

/// A path of field names through a nested predicate, one segment per hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// This path extended by one segment.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parent(&self) -> Option<Self> {
        self.0
            .split_last()
            .map(|(_, parents)| Self(parents.to_vec()))
    }

    /// Whether `self` is a strict prefix of `other`.
    pub fn is_prefix_of(&self, other: &KeyPath) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Stable textual form of a predicate. Keys are rendered sorted at every
/// depth, so equal predicates render identically whatever order they were
/// written in.
pub fn canonical(predicate: &Document) -> String {
    serde_json::to_string(&sorted_keys(predicate)).unwrap_or_default()
}

fn sorted_keys(map: &Document) -> Document {
    let mut entries: Vec<(&String, &Value)> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .into_iter()
        .map(|(key, value)| (key.clone(), sorted_value(value)))
        .collect()
}

fn sorted_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(sorted_keys(map)),
        Value::Array(items) => Value::Array(items.iter().map(sorted_value).collect()),
        other => other.clone(),
    }
}

/// The identities a predicate pins under `key`, if it constrains `key`.
///
/// A scalar pins one identity; an array pins each element; `null` or an empty
/// array pins none (the predicate matches nothing).
pub fn identity_values(predicate: &Document, key: &str) -> Option<Vec<Value>> {
    predicate.get(key).map(flatten_values)
}

/// The predicate with `key` removed.
pub fn without(predicate: &Document, key: &str) -> Document {
    let mut rest = predicate.clone();
    rest.remove(key);
    rest
}

/// Constrain `key` to `values`, intersecting with any constraint already
/// present under that key.
pub fn constrain(predicate: &mut Document, key: &str, values: Vec<Value>) {
    let merged = match predicate.get(key) {
        Some(existing) => {
            let existing = flatten_values(existing);
            let mut kept = Vec::new();
            for value in values {
                if existing.iter().any(|e| values_equal(e, &value)) {
                    push_unique(&mut kept, value);
                }
            }
            kept
        }
        None => {
            let mut unique = Vec::with_capacity(values.len());
            for value in values {
                push_unique(&mut unique, value);
            }
            unique
        }
    };
    predicate.insert(key.to_string(), Value::Array(merged));
}

/// Whether `doc`'s value at `key` is one of `ids`.
pub fn has_identity(doc: &Document, key: &str, ids: &[Value]) -> bool {
    lookup(doc, key).is_some_and(|value| ids.iter().any(|id| values_equal(id, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn key_path_prefixes() {
        let a = KeyPath::root().child("authored");
        let b = a.child("chapters");
        assert!(a.is_prefix_of(&b));
        assert!(!b.is_prefix_of(&a));
        assert!(!a.is_prefix_of(&a));
        assert_eq!(b.to_string(), "authored.chapters");
        assert_eq!(b.parent(), Some(a));
        assert_eq!(KeyPath::root().parent(), None);
    }

    #[test]
    fn canonical_is_order_independent() {
        let a = doc(json!({"b": 1, "a": [1, 2]}));
        let mut b = Document::new();
        b.insert("a".into(), json!([1, 2]));
        b.insert("b".into(), json!(1));
        assert_eq!(canonical(&a), canonical(&b));

        let nested = doc(json!({"author": {"name": "Ann", "age": 3}}));
        let reordered = doc(json!({"author": {"age": 3, "name": "Ann"}}));
        assert_eq!(canonical(&nested), canonical(&reordered));
        assert_eq!(canonical(&nested), r#"{"author":{"age":3,"name":"Ann"}}"#);
    }

    #[test]
    fn identity_constraints_intersect() {
        let mut pred = doc(json!({"id": ["a", "b", "c"]}));
        constrain(&mut pred, "id", vec![json!("b"), json!("c"), json!("d")]);
        assert_eq!(pred["id"], json!(["b", "c"]));

        constrain(&mut pred, "id", vec![json!("z")]);
        assert_eq!(pred["id"], json!([]));
        assert_eq!(identity_values(&pred, "id"), Some(vec![]));

        let mut fresh = Document::new();
        constrain(&mut fresh, "id", vec![json!(1), json!(1), json!(2)]);
        assert_eq!(fresh["id"], json!([1, 2]));
    }

    #[test]
    fn identity_helpers() {
        let pred = doc(json!({"id": "p1", "name": "ann"}));
        assert_eq!(identity_values(&pred, "id"), Some(vec![json!("p1")]));
        assert_eq!(identity_values(&pred, "_id"), None);
        assert_eq!(without(&pred, "id"), doc(json!({"name": "ann"})));
        assert!(has_identity(&doc(json!({"id": 2})), "id", &[json!(1), json!(2.0)]));
    }
}
