//! Query values and pagination for Relata.
//!
//! `relata-query` is the **query description layer**. It holds everything
//! about an operation that can be decided without touching a backend:
//!
//! - **`Query`**: the validated, immutable description of one model operation
//! - **Predicates**: key paths and identity-constraint helpers over resolved
//!   predicates
//! - **Cursors**: the opaque base64 row cursor used for stable pagination
//! - **Pagination**: bookend trimming, page-size enforcement and `PageInfo`
//! - **Result cache**: the LRU map the session's batched loader reads through
//!
//! Execution lives in `relata-session`.

pub mod cache;
pub mod cursor;
pub mod pagination;
pub mod predicate;
pub mod query;

pub use cache::{ResultCache, cache_key};
pub use cursor::Cursor;
pub use pagination::{Page, PageInfo, fetch_limit, paginate, with_tiebreaker, within_window};
pub use predicate::KeyPath;
pub use query::{PageSpec, Query, QueryParts, SortSpec, parse_sort};
