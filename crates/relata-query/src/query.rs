//! The `Query` value object.
//!
//! A [`Query`] is produced from accumulated [`QueryParts`] once a terminal
//! verb runs. Construction enforces the shape rules:
//!
//! - `id` excludes `where`, `sort`, `limit`, `first`, `last`, `before` and
//!   `after`
//! - `first` and `last` are mutually exclusive
//! - `limit` caps an unpaginated fetch and cannot be combined with
//!   `first`/`last`

use relata_core::{Direction, Document, Error, Result, Value};

/// Sort requested by field name, in priority order.
pub type SortSpec = Vec<(String, Direction)>;

/// Cursor pagination request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageSpec {
    pub first: Option<usize>,
    pub last: Option<usize>,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl PageSpec {
    pub fn first(n: usize) -> Self {
        Self {
            first: Some(n),
            ..Self::default()
        }
    }

    pub fn last(n: usize) -> Self {
        Self {
            last: Some(n),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn after(mut self, cursor: impl Into<String>) -> Self {
        self.after = Some(cursor.into());
        self
    }

    #[must_use]
    pub fn before(mut self, cursor: impl Into<String>) -> Self {
        self.before = Some(cursor.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none() && self.last.is_none() && !self.has_cursor()
    }

    pub fn has_cursor(&self) -> bool {
        self.before.is_some() || self.after.is_some()
    }
}

/// Parse a user-facing sort spec.
///
/// Accepted shapes:
/// - `{"name": "asc", "age": -1}`, keys applied in the order written
/// - `"name"` / `"-name"`, optionally comma separated
/// - `["name", "-age"]`
pub fn parse_sort(spec: &Value) -> Result<SortSpec> {
    match spec {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(parse_sort_term)
            .collect()),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(parse_sort_term(s)),
                other => Err(Error::bad_request(format!(
                    "sort entries must be field names, got {other}"
                ))),
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(field, dir)| {
                let direction = match dir {
                    Value::String(s) => Direction::parse(s),
                    Value::Number(n) => match n.as_i64() {
                        Some(1) => Some(Direction::Asc),
                        Some(-1) => Some(Direction::Desc),
                        _ => None,
                    },
                    Value::Bool(true) => Some(Direction::Asc),
                    _ => None,
                };
                direction.map(|d| (field.clone(), d)).ok_or_else(|| {
                    Error::bad_request(format!("invalid sort direction {dir} for '{field}'"))
                })
            })
            .collect(),
        other => Err(Error::bad_request(format!("invalid sort spec {other}"))),
    }
}

fn parse_sort_term(term: &str) -> (String, Direction) {
    match term.strip_prefix('-') {
        Some(field) => (field.to_string(), Direction::Desc),
        None => (
            term.strip_prefix('+').unwrap_or(term).to_string(),
            Direction::Asc,
        ),
    }
}

/// Mutable accumulator filled in by the fluent builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryParts {
    pub id: Option<Value>,
    pub where_: Option<Document>,
    pub sort: SortSpec,
    pub limit: Option<usize>,
    pub page: PageSpec,
    pub select: Option<Vec<String>>,
}

impl QueryParts {
    /// Whether any predicate-shaped component is set.
    pub fn has_shape(&self) -> bool {
        self.where_.is_some() || !self.sort.is_empty() || self.limit.is_some() || !self.page.is_empty()
    }

    /// Check the shape rules for `model`.
    pub fn validate(&self, model: &str) -> Result<()> {
        if self.id.is_some() && self.has_shape() {
            return Err(Error::bad_model_request(
                model,
                "id() cannot be combined with where(), sort_by(), limit() or pagination",
            ));
        }
        if self.page.first.is_some() && self.page.last.is_some() {
            return Err(Error::bad_model_request(
                model,
                "first() and last() cannot be combined",
            ));
        }
        if self.limit.is_some() && (self.page.first.is_some() || self.page.last.is_some()) {
            return Err(Error::bad_model_request(
                model,
                "limit() cannot be combined with first() or last()",
            ));
        }
        if matches!(self.id, Some(Value::Null)) {
            return Err(Error::bad_model_request(model, "id() requires a value"));
        }
        Ok(())
    }

    /// Validate and freeze into a [`Query`].
    pub fn build(self, model: impl Into<String>) -> Result<Query> {
        let model = model.into();
        self.validate(&model)?;
        let targeted = self.id.is_some() || self.where_.is_some();
        Ok(Query {
            model,
            targeted,
            id: self.id,
            where_: self.where_.unwrap_or_default(),
            sort: self.sort,
            limit: self.limit,
            page: self.page,
            select: self.select,
        })
    }
}

/// An immutable description of one model operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    model: String,
    targeted: bool,
    id: Option<Value>,
    where_: Document,
    sort: SortSpec,
    limit: Option<usize>,
    page: PageSpec,
    select: Option<Vec<String>>,
}

impl Query {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    /// The unresolved where-predicate (empty when none was given).
    pub fn predicate(&self) -> &Document {
        &self.where_
    }

    pub fn sort(&self) -> &SortSpec {
        &self.sort
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn page(&self) -> &PageSpec {
        &self.page
    }

    pub fn select(&self) -> Option<&[String]> {
        self.select.as_deref()
    }

    /// Whether results go through the pagination engine.
    pub fn is_paginated(&self) -> bool {
        !self.page.is_empty()
    }

    /// Whether `id()` or `where()` was given. An explicit empty `where()`
    /// counts and targets every document.
    pub fn is_targeted(&self) -> bool {
        self.targeted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_excludes_where() {
        let parts = QueryParts {
            id: Some(json!("p1")),
            where_: Some(Document::new()),
            ..QueryParts::default()
        };
        let err = parts.build("Person").unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(err.model(), Some("Person"));
    }

    #[test]
    fn id_excludes_pagination() {
        let parts = QueryParts {
            id: Some(json!("p1")),
            page: PageSpec::default().after("abc"),
            ..QueryParts::default()
        };
        assert!(parts.build("Person").unwrap_err().is_bad_request());

        let parts = QueryParts {
            id: Some(json!("p1")),
            sort: vec![("name".into(), Direction::Asc)],
            ..QueryParts::default()
        };
        assert!(parts.build("Person").unwrap_err().is_bad_request());
    }

    #[test]
    fn first_and_last_conflict() {
        let parts = QueryParts {
            page: PageSpec {
                first: Some(1),
                last: Some(1),
                ..PageSpec::default()
            },
            ..QueryParts::default()
        };
        assert!(parts.build("Person").unwrap_err().is_bad_request());
    }

    #[test]
    fn plain_queries_build() {
        let query = QueryParts {
            where_: Some(json!({"name": "ann"}).as_object().cloned().unwrap()),
            limit: Some(3),
            ..QueryParts::default()
        }
        .build("Person")
        .unwrap();
        assert_eq!(query.model(), "Person");
        assert_eq!(query.limit(), Some(3));
        assert!(!query.is_paginated());
        assert!(query.is_targeted());

        let bare = QueryParts::default().build("Person").unwrap();
        assert!(!bare.is_targeted());
        assert!(bare.predicate().is_empty());

        let everything = QueryParts {
            where_: Some(Document::new()),
            ..QueryParts::default()
        }
        .build("Person")
        .unwrap();
        assert!(everything.is_targeted());
    }

    #[test]
    fn parses_sort_shapes() {
        assert_eq!(
            parse_sort(&json!("name,-age")).unwrap(),
            vec![("name".into(), Direction::Asc), ("age".into(), Direction::Desc)]
        );
        assert_eq!(
            parse_sort(&json!(["-age"])).unwrap(),
            vec![("age".into(), Direction::Desc)]
        );
        assert_eq!(
            parse_sort(&json!({"age": -1, "name": "asc"})).unwrap(),
            vec![("age".into(), Direction::Desc), ("name".into(), Direction::Asc)]
        );
        assert!(parse_sort(&json!({"age": "up"})).is_err());
        assert!(parse_sort(&json!(5)).is_err());
    }

    #[test]
    fn object_sort_keeps_written_order() {
        assert_eq!(
            parse_sort(&json!({"name": "asc", "age": "desc"})).unwrap(),
            vec![("name".into(), Direction::Asc), ("age".into(), Direction::Desc)]
        );
        let parsed: Value = serde_json::from_str(r#"{"zeta": 1, "alpha": -1}"#).unwrap();
        assert_eq!(
            parse_sort(&parsed).unwrap(),
            vec![("zeta".into(), Direction::Asc), ("alpha".into(), Direction::Desc)]
        );
    }
}
