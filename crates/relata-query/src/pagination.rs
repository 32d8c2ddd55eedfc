//! Cursor pagination.
//!
//! The engine works on an already sorted sequence. Sort specs are made total
//! by [`with_tiebreaker`], which appends the identity key, so every row has a
//! distinct cursor. Reads that carry a `before`/`after` cursor fetch the
//! inclusive window around the cursor rows ([`within_window`]) and
//! [`paginate`] trims the bookends and enforces the page size.

use crate::cursor::Cursor;
use crate::query::PageSpec;
use relata_core::{Document, Result, SortKey};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Page metadata attached to every paginated result sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    /// Cursor of the first row (empty when the page is empty)
    pub start_cursor: String,
    /// Cursor of the last row (empty when the page is empty)
    pub end_cursor: String,
    pub has_previous_page: bool,
    pub has_next_page: bool,
}

/// One page of rows with their cursors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub rows: Vec<Document>,
    pub cursors: Vec<String>,
    pub page_info: PageInfo,
}

/// Append the identity key to `sort` unless it is already present.
pub fn with_tiebreaker(mut sort: Vec<SortKey>, identity_key: &str) -> Vec<SortKey> {
    if !sort.iter().any(|key| key.path == identity_key) {
        sort.push(SortKey::asc(identity_key));
    }
    sort
}

/// How many rows the backend should return for `spec`.
///
/// `first(n)` without a cursor needs `n + 2` rows so that both bookends and
/// the overage row can be observed; anything involving a cursor or `last`
/// reads the whole window.
pub fn fetch_limit(spec: &PageSpec) -> Option<usize> {
    match spec.first {
        Some(n) if !spec.has_cursor() => Some(n.saturating_add(2)),
        _ => None,
    }
}

/// Keep the rows between the `after` and `before` cursors, inclusive.
pub fn within_window(
    rows: Vec<Document>,
    sort: &[SortKey],
    spec: &PageSpec,
) -> Result<Vec<Document>> {
    let after = spec.after.as_deref().map(Cursor::decode).transpose()?;
    let before = spec.before.as_deref().map(Cursor::decode).transpose()?;
    Ok(rows
        .into_iter()
        .filter(|row| {
            after
                .as_ref()
                .is_none_or(|c| c.compare_row(row, sort) != Ordering::Less)
                && before
                    .as_ref()
                    .is_none_or(|c| c.compare_row(row, sort) != Ordering::Greater)
        })
        .collect())
}

/// Slice sorted `rows` into the page described by `spec`.
#[tracing::instrument(level = "trace", skip(rows, sort), fields(rows = rows.len()))]
pub fn paginate(rows: Vec<Document>, sort: &[SortKey], spec: &PageSpec) -> Page {
    let mut cursors: Vec<String> = rows.iter().map(|row| Cursor::encode(row, sort)).collect();
    let mut rows = rows;
    let mut has_previous_page = false;
    let mut has_next_page = false;

    if let Some(after) = &spec.after {
        if cursors.first() == Some(after) {
            rows.remove(0);
            cursors.remove(0);
            has_previous_page = true;
        }
    }
    if let Some(before) = &spec.before {
        if cursors.last() == Some(before) {
            rows.pop();
            cursors.pop();
            has_next_page = true;
        }
    }

    if let Some(n) = spec.first {
        if rows.len() > n {
            rows.truncate(n);
            cursors.truncate(n);
            has_next_page = true;
        }
    } else if let Some(n) = spec.last {
        if rows.len() > n {
            let overage = rows.len() - n;
            rows.drain(..overage);
            cursors.drain(..overage);
            has_previous_page = true;
        }
    }

    let page_info = PageInfo {
        start_cursor: cursors.first().cloned().unwrap_or_default(),
        end_cursor: cursors.last().cloned().unwrap_or_default(),
        has_previous_page,
        has_next_page,
    };
    tracing::trace!(
        returned = rows.len(),
        has_previous_page,
        has_next_page,
        "Paginated rows"
    );
    Page {
        rows,
        cursors,
        page_info,
    }
}
