//! Sort specifications.

use crate::value::{Document, compare_values, lookup};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

impl Direction {
    /// Parse `"asc"`/`"desc"` (also `1`/`-1` spelled as strings).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "asc" | "ascending" | "1" => Some(Direction::Asc),
            "desc" | "descending" | "-1" => Some(Direction::Desc),
            _ => None,
        }
    }

    pub const fn apply(self, ord: Ordering) -> Ordering {
        match self {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

/// One sort key: a storage path and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub path: String,
    pub direction: Direction,
}

impl SortKey {
    pub fn asc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            direction: Direction::Desc,
        }
    }
}

/// Compare two documents under a sort spec. Missing values sort as null.
pub fn compare_documents(a: &Document, b: &Document, sort: &[SortKey]) -> Ordering {
    for key in sort {
        let left = lookup(a, &key.path).unwrap_or(&serde_json::Value::Null);
        let right = lookup(b, &key.path).unwrap_or(&serde_json::Value::Null);
        let ord = key.direction.apply(compare_values(left, right));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
