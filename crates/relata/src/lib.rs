//! Relata - storage-agnostic data access over pluggable backends.
//!
//! Relata sits between a declarative schema and one or more storage
//! backends, providing:
//!
//! - Relationship-aware where-predicates, resolved to flat backend
//!   predicates one batched pass per relation depth
//! - A batched, deduplicating, cached loader for reads
//! - Nested transaction trees that commit atomically across backends
//! - Cascade, nullify and restrict delete policies
//! - Stable cursor pagination
//!
//! # Quick Start
//!
//! ```ignore
//! use relata::prelude::*;
//!
//! let backend = MemoryBackend::new("mem");
//! let schema = Schema::builder()
//!     .backend("mem", Arc::new(backend))
//!     .model(
//!         ModelDef::new("Person")
//!             .field(Field::scalar("name"))
//!             .field(Field::virtual_ref("authored", "Book", "author")),
//!     )
//!     .model(
//!         ModelDef::new("Book")
//!             .field(Field::scalar("name"))
//!             .field(Field::reference("author", "Person").on_delete(DeletePolicy::Cascade)),
//!     )
//!     .build()?;
//! let session = Session::new(schema);
//!
//! async fn example(cx: &Cx, session: &Session) {
//!     // People who wrote a book called "Dune"
//!     let authors = session
//!         .query("Person")
//!         .where_(json!({"authored": {"name": "Dune"}}))
//!         .many(cx)
//!         .await;
//!
//!     // Deleting a person cascades to their books
//!     let removed = session.query("Person").id("p1").remove(cx).await;
//! }
//! ```

pub use relata_core::{
    // asupersync re-exports
    Budget,
    Cx,
    Outcome,
    RegionId,
    TaskId,
    // Core types
    Backend,
    BackendFuture,
    DeletePolicy,
    Direction,
    Document,
    Error,
    Field,
    FieldKind,
    FindRequest,
    Model,
    ModelDef,
    Mutation,
    NoopTxHandle,
    Op,
    Patch,
    ReferentialEdge,
    Result,
    Schema,
    SchemaBuilder,
    SortKey,
    TransactionErrorKind,
    TxBatch,
    TxHandle,
    Value,
    run_individually,
};

pub use relata_query::{Cursor, PageInfo, PageSpec, Query, QueryParts, paginate};

pub use relata_session::{
    Deferred, HookChain, HookContext, HookFlow, HookId, HookPoint, Immediate, LoadMethod, LoadOp,
    Loaded, Marker, QueryBuilder, Record, Records, Session, SessionBuilder, SessionConfig, Staged,
    Transaction,
};

pub use relata_memory::MemoryBackend;

pub use serde_json::json;

// ============================================================================
// Prelude
// ============================================================================

/// Everything needed to build a schema and run queries.
pub mod prelude {
    pub use crate::{
        // asupersync
        Budget,
        Cx,
        // Schema
        DeletePolicy,
        Document,
        Error,
        Field,
        // Hooks
        HookFlow,
        HookPoint,
        MemoryBackend,
        ModelDef,
        Outcome,
        // Pagination
        PageInfo,
        Record,
        Records,
        Result,
        Schema,
        // Session
        Session,
        SessionConfig,
        Transaction,
        Value,
        json,
    };
    pub use std::sync::Arc;
}
