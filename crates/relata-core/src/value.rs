//! Dynamic document values.
//!
//! Documents are JSON objects. Keys of a `Document` are storage keys, and a
//! dotted path (`"meta.owner"`) addresses a key inside an embedded object.

use std::cmp::Ordering;

pub use serde_json::Value;

/// A single stored document: storage key -> value.
pub type Document = serde_json::Map<String, Value>;

/// Split a dotted storage path into its segments.
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.').filter(|s| !s.is_empty())
}

/// Look up the value at a dotted path without descending into arrays.
///
/// Returns `None` if any segment is missing or addresses a non-object.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path_segments(path);
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Collect every value reachable at a dotted path.
///
/// Arrays met in the middle of the path are traversed element-wise, so
/// `"sections.owner"` over `{sections: [{owner: 1}, {owner: 2}]}` yields both
/// owners. The leaf value itself is returned as-is (arrays are not flattened).
pub fn collect_at_path<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let segments: Vec<&str> = path_segments(path).collect();
    let Some((first, rest)) = segments.split_first() else {
        return Vec::new();
    };
    let Some(root) = doc.get(*first) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    collect_rec(root, rest, &mut out);
    out
}

fn collect_rec<'a>(value: &'a Value, rest: &[&str], out: &mut Vec<&'a Value>) {
    let Some((segment, tail)) = rest.split_first() else {
        out.push(value);
        return;
    };
    match value {
        Value::Object(map) => {
            if let Some(next) = map.get(*segment) {
                collect_rec(next, tail, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_rec(item, rest, out);
            }
        }
        _ => {}
    }
}

/// Set the value at a dotted path, creating intermediate objects as needed.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    let segments: Vec<&str> = path_segments(path).collect();
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = doc;
    for segment in parents {
        let entry = current
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Document::new()));
        if !entry.is_object() {
            *entry = Value::Object(Document::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert((*last).to_string(), value);
}

/// Equality with numeric normalisation (`1 == 1.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        _ => a == b,
    }
}

const fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over values used for sorting and cursor comparison.
///
/// Values of different JSON types order as
/// null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(xs), Value::Array(ys)) => {
            for (x, y) in xs.iter().zip(ys) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xs.len().cmp(&ys.len())
        }
        (Value::Object(_), Value::Object(_)) => a.to_string().cmp(&b.to_string()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Flatten a value into a list: arrays yield their elements, anything else
/// yields itself. `Null` yields nothing.
pub fn flatten_values(value: &Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().flat_map(flatten_values).collect(),
        other => vec![other.clone()],
    }
}

/// Push `value` into `list` unless an equal value is already present.
pub fn push_unique(list: &mut Vec<Value>, value: Value) {
    if !list.iter().any(|existing| values_equal(existing, &value)) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn lookup_follows_nested_objects() {
        let d = doc(json!({"meta": {"owner": 7}, "name": "a"}));
        assert_eq!(lookup(&d, "meta.owner"), Some(&json!(7)));
        assert_eq!(lookup(&d, "name"), Some(&json!("a")));
        assert_eq!(lookup(&d, "meta.missing"), None);
        assert_eq!(lookup(&d, "name.deeper"), None);
    }

    #[test]
    fn collect_descends_through_arrays() {
        let d = doc(json!({"sections": [{"owner": 1}, {"owner": 2}, {"other": 3}]}));
        let found = collect_at_path(&d, "sections.owner");
        assert_eq!(found, vec![&json!(1), &json!(2)]);
    }

    #[test]
    fn set_path_creates_parents() {
        let mut d = Document::new();
        set_path(&mut d, "meta.owner", json!("p1"));
        assert_eq!(Value::Object(d), json!({"meta": {"owner": "p1"}}));
    }

    #[test]
    fn numeric_equality_is_normalised() {
        assert!(values_equal(&json!(1), &json!(1.0)));
        assert!(!values_equal(&json!(1), &json!("1")));
    }

    #[test]
    fn ordering_across_types() {
        assert_eq!(compare_values(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
        assert_eq!(compare_values(&json!(5), &json!("5")), Ordering::Less);
        assert_eq!(compare_values(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
    }

    #[test]
    fn flatten_skips_nulls() {
        assert_eq!(
            flatten_values(&json!([1, [2, null], null, "x"])),
            vec![json!(1), json!(2), json!("x")]
        );
    }
}
