//! Core types and traits for Relata.
//!
//! This crate provides the foundational abstractions shared by the query and
//! session layers:
//!
//! - `Schema`, `Model` and `Field` metadata, with referential-integrity edges
//!   precomputed at build time
//! - `Document`/`Value` helpers and `Patch` mutations
//! - `Backend` trait implemented once per storage technology
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod backend;
pub mod error;
pub mod field;
pub mod model;
pub mod patch;
pub mod schema;
pub mod sort;
pub mod value;

pub use backend::{
    Backend, BackendFuture, FindRequest, NoopTxHandle, Op, TxBatch, TxHandle, run_individually,
};
pub use error::{
    BackendError, BadRequestError, DuplicateError, Error, NotFoundError, RestrictedError, Result,
    SchemaError, SchemaErrorKind, TransactionError, TransactionErrorKind,
};
pub use field::{DeletePolicy, Field, FieldKind};
pub use model::{Model, ModelDef, ReferentialEdge};
pub use patch::{Mutation, Patch};
pub use schema::{Schema, SchemaBuilder};
pub use sort::{Direction, SortKey, compare_documents};
pub use value::{Document, Value};

/// Unwrap an `Outcome::Ok`, returning any other variant from the enclosing
/// function unchanged.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result::Ok`, returning `Outcome::Err` from the enclosing
/// function on failure.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}
