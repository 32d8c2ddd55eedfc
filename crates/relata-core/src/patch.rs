//! Document patches.
//!
//! Updates are expressed as an ordered list of [`Mutation`]s rather than a
//! replacement document, so adapters can apply array edits natively and the
//! referential-integrity engine can null out a reference inside an embedded
//! array without rewriting its siblings.

use crate::value::{Document, Value, path_segments, set_path, values_equal};
use serde::{Deserialize, Serialize};

/// A single change to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    /// Set the value at a path.
    Set { path: String, value: Value },
    /// Append values to the array at a path (a missing/null value becomes an array).
    Push { path: String, values: Vec<Value> },
    /// Remove every element equal to any of `values` from the array at a path.
    Pull { path: String, values: Vec<Value> },
    /// Replace every occurrence of `from` with `to` at a path.
    ///
    /// A scalar equal to `from` is replaced; an array has each equal element
    /// replaced. Arrays in the middle of the path are traversed element-wise.
    Replace { path: String, from: Value, to: Value },
}

impl Mutation {
    pub fn path(&self) -> &str {
        match self {
            Mutation::Set { path, .. }
            | Mutation::Push { path, .. }
            | Mutation::Pull { path, .. }
            | Mutation::Replace { path, .. } => path,
        }
    }
}

/// An ordered set of mutations applied atomically to one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub mutations: Vec<Mutation>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a patch that sets every key of `input`.
    pub fn from_document(input: &Document) -> Self {
        Self {
            mutations: input
                .iter()
                .map(|(key, value)| Mutation::Set {
                    path: key.clone(),
                    value: value.clone(),
                })
                .collect(),
        }
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.mutations.push(Mutation::Set {
            path: path.into(),
            value,
        });
        self
    }

    pub fn push(mut self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.mutations.push(Mutation::Push {
            path: path.into(),
            values,
        });
        self
    }

    pub fn pull(mut self, path: impl Into<String>, values: Vec<Value>) -> Self {
        self.mutations.push(Mutation::Pull {
            path: path.into(),
            values,
        });
        self
    }

    pub fn replace(mut self, path: impl Into<String>, from: Value, to: Value) -> Self {
        self.mutations.push(Mutation::Replace {
            path: path.into(),
            from,
            to,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Apply every mutation in order.
    pub fn apply(&self, doc: &mut Document) {
        for mutation in &self.mutations {
            apply_mutation(doc, mutation);
        }
    }
}

fn apply_mutation(doc: &mut Document, mutation: &Mutation) {
    match mutation {
        Mutation::Set { path, value } => set_path(doc, path, value.clone()),
        Mutation::Push { path, values } => {
            let segments: Vec<&str> = path_segments(path).collect();
            if let Some(slot) = slot_mut(doc, &segments) {
                if let Value::Array(items) = slot {
                    items.extend(values.iter().cloned());
                } else {
                    let mut items = match std::mem::take(slot) {
                        Value::Null => Vec::new(),
                        existing => vec![existing],
                    };
                    items.extend(values.iter().cloned());
                    *slot = Value::Array(items);
                }
            } else {
                set_path(doc, path, Value::Array(values.clone()));
            }
        }
        Mutation::Pull { path, values } => {
            let segments: Vec<&str> = path_segments(path).collect();
            for_each_leaf(doc, &segments, &mut |leaf| {
                if let Value::Array(items) = leaf {
                    items.retain(|item| !values.iter().any(|v| values_equal(item, v)));
                }
            });
        }
        Mutation::Replace { path, from, to } => {
            let segments: Vec<&str> = path_segments(path).collect();
            for_each_leaf(doc, &segments, &mut |leaf| match leaf {
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        if values_equal(item, from) {
                            *item = to.clone();
                        }
                    }
                }
                other => {
                    if values_equal(other, from) {
                        *other = to.clone();
                    }
                }
            });
        }
    }
}

fn slot_mut<'a>(doc: &'a mut Document, segments: &[&str]) -> Option<&'a mut Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = doc.get_mut(*first)?;
    for segment in rest {
        current = current.as_object_mut()?.get_mut(*segment)?;
    }
    Some(current)
}

fn for_each_leaf(doc: &mut Document, segments: &[&str], f: &mut dyn FnMut(&mut Value)) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if let Some(root) = doc.get_mut(*first) {
        leaf_rec(root, rest, f);
    }
}

fn leaf_rec(value: &mut Value, rest: &[&str], f: &mut dyn FnMut(&mut Value)) {
    let Some((segment, tail)) = rest.split_first() else {
        f(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get_mut(*segment) {
                leaf_rec(next, tail, f);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                leaf_rec(item, rest, f);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn push_creates_or_extends_arrays() {
        let mut d = doc(json!({"tags": ["a"]}));
        Patch::new()
            .push("tags", vec![json!("b")])
            .push("other", vec![json!(1)])
            .apply(&mut d);
        assert_eq!(Value::Object(d), json!({"tags": ["a", "b"], "other": [1]}));
    }

    #[test]
    fn push_onto_null_starts_a_new_array() {
        let mut d = doc(json!({"tags": null}));
        Patch::new().push("tags", vec![json!("x")]).apply(&mut d);
        assert_eq!(Value::Object(d), json!({"tags": ["x"]}));
    }

    #[test]
    fn pull_removes_all_matches() {
        let mut d = doc(json!({"ids": [1, 2, 1, 3]}));
        Patch::new().pull("ids", vec![json!(1), json!(3)]).apply(&mut d);
        assert_eq!(Value::Object(d), json!({"ids": [2]}));
    }

    #[test]
    fn replace_handles_scalars_and_arrays() {
        let mut d = doc(json!({"owner": "p1", "editors": ["p1", "p2"]}));
        Patch::new()
            .replace("owner", json!("p1"), Value::Null)
            .replace("editors", json!("p1"), json!("p9"))
            .apply(&mut d);
        assert_eq!(
            Value::Object(d),
            json!({"owner": null, "editors": ["p9", "p2"]})
        );
    }

    #[test]
    fn replace_through_embedded_array_only_touches_matches() {
        let mut d = doc(json!({"sections": [{"owner": "p1"}, {"owner": "p2"}]}));
        Patch::new()
            .replace("sections.owner", json!("p1"), Value::Null)
            .apply(&mut d);
        assert_eq!(
            Value::Object(d),
            json!({"sections": [{"owner": null}, {"owner": "p2"}]})
        );
    }
}
