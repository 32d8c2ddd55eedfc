//! Opaque row cursors.
//!
//! Wire format: standard base64 of a JSON object mapping each sort-key path
//! to the row's value at that path. Cursors are stable for one sort spec and
//! row content; they are not comparable across sort specs.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use relata_core::value::{compare_values, lookup};
use relata_core::{Document, Error, Result, SortKey, Value};
use std::cmp::Ordering;

/// A decoded cursor: the sort-key values of one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    values: Document,
}

impl Cursor {
    /// Capture the sort-key values of `row`. Missing values are stored as
    /// `null`.
    pub fn capture(row: &Document, sort: &[SortKey]) -> Self {
        let values = sort
            .iter()
            .map(|key| {
                let value = lookup(row, &key.path).cloned().unwrap_or(Value::Null);
                (key.path.clone(), value)
            })
            .collect();
        Self { values }
    }

    /// Encode the cursor of `row` under `sort`.
    pub fn encode(row: &Document, sort: &[SortKey]) -> String {
        Self::capture(row, sort).to_opaque()
    }

    /// Parse an opaque cursor string.
    pub fn decode(cursor: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(cursor.trim())
            .map_err(|e| Error::bad_request(format!("invalid cursor: {e}")))?;
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(values)) => Ok(Self { values }),
            Ok(_) => Err(Error::bad_request("invalid cursor: not an object")),
            Err(e) => Err(Error::bad_request(format!("invalid cursor: {e}"))),
        }
    }

    pub fn to_opaque(&self) -> String {
        STANDARD.encode(serde_json::to_vec(&self.values).unwrap_or_default())
    }

    pub fn values(&self) -> &Document {
        &self.values
    }

    /// Order `row` relative to this cursor under `sort`.
    pub fn compare_row(&self, row: &Document, sort: &[SortKey]) -> Ordering {
        for key in sort {
            let left = lookup(row, &key.path).unwrap_or(&Value::Null);
            let right = self.values.get(&key.path).unwrap_or(&Value::Null);
            let ord = key.direction.apply(compare_values(left, right));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn encodes_sort_values_only() {
        let row = doc(json!({"id": "b1", "name": "Dune", "pages": 412}));
        let sort = vec![SortKey::asc("name"), SortKey::asc("id")];
        let encoded = Cursor::encode(&row, &sort);
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(decoded.values(), &doc(json!({"id": "b1", "name": "Dune"})));
        assert_eq!(decoded.compare_row(&row, &sort), Ordering::Equal);
    }

    #[test]
    fn wire_format_is_base64_json() {
        let row = doc(json!({"name": "a"}));
        let encoded = Cursor::encode(&row, &[SortKey::asc("name")]);
        let raw = STANDARD.decode(&encoded).unwrap();
        assert_eq!(
            serde_json::from_slice::<Value>(&raw).unwrap(),
            json!({"name": "a"})
        );
    }

    #[test]
    fn compares_with_direction() {
        let sort = vec![SortKey::desc("age")];
        let cursor = Cursor::capture(&doc(json!({"age": 30})), &sort);
        assert_eq!(
            cursor.compare_row(&doc(json!({"age": 40})), &sort),
            Ordering::Less
        );
        assert_eq!(
            cursor.compare_row(&doc(json!({"age": 20})), &sort),
            Ordering::Greater
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(Cursor::decode("not base64!").unwrap_err().is_bad_request());
        let not_object = STANDARD.encode(b"[1,2]");
        assert!(Cursor::decode(&not_object).unwrap_err().is_bad_request());
    }
}
