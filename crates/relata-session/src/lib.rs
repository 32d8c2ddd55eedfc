//! Sessions, relationship resolution and transaction trees for Relata.
//!
//! `relata-session` is the **execution layer**. A [`Session`] owns a built
//! [`Schema`], a result cache and a hook chain, and is the entry point for
//! every read and write.
//!
//! # Role In The Architecture
//!
//! - **Resolver**: rewrites relationship-shaped predicates into flat,
//!   backend-ready ones, one batched loader pass per relation depth.
//! - **Loader**: queues reads issued by concurrent callers, deduplicates
//!   them, merges identity lookups into multi-gets and caches results.
//! - **Transactions**: nested scopes whose recorded writes execute per
//!   backend as one batch each and commit or roll back from the root.
//! - **Referential integrity**: deleting a document applies the cascade,
//!   nullify and restrict policies declared on the fields that point at it.
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(schema);
//!
//! // Relationship-shaped predicate, resolved before it reaches a backend
//! let books = session
//!     .query("Book")
//!     .where_(json!({"author": {"name": "Ann"}}))
//!     .many(&cx)
//!     .await;
//!
//! // Deferred writes in a transaction tree
//! let tx = session.transaction();
//! let book = tx.query("Book").save(&cx, vec![input]).await;
//! tx.run(&cx).await;
//! ```

pub mod builder;
pub mod hooks;
pub mod integrity;
pub mod loader;
pub mod record;
pub mod resolver;
pub mod transaction;

pub use builder::{Immediate, QueryBuilder, Staged};
pub use hooks::{HookChain, HookContext, HookFlow, HookId, HookPoint};
pub use loader::{LoadMethod, LoadOp, Loaded};
pub use record::{Record, Records};
pub use transaction::{Deferred, Marker, Transaction};

use relata_core::{Cx, Document, Error, Outcome, Result, Schema, try_result};
use loader::Batcher;
use relata_query::ResultCache;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether loader results are cached between passes.
    pub cache_enabled: bool,
    /// Maximum number of cached loader results.
    pub cache_capacity: usize,
    /// Maximum number of relation hops a predicate may traverse.
    pub max_relation_depth: usize,
    /// Page size applied to paginated reads that give neither `first` nor
    /// `last`.
    pub default_page_size: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_capacity: 1024,
            max_relation_depth: 8,
            default_page_size: None,
        }
    }
}

impl SessionConfig {
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    pub fn max_relation_depth(mut self, depth: usize) -> Self {
        self.max_relation_depth = depth;
        self
    }

    pub fn default_page_size(mut self, size: Option<usize>) -> Self {
        self.default_page_size = size;
        self
    }
}

// ============================================================================
// Session
// ============================================================================

struct Inner {
    schema: Schema,
    config: SessionConfig,
    cache: Mutex<CacheState>,
    batcher: Batcher,
    hooks: RwLock<HookChain>,
}

/// Cached loader results and the write generation they were read at.
struct CacheState {
    results: ResultCache<Loaded>,
    /// Bumped by every invalidation
    generation: u64,
}

/// Entry point for reads and writes against a schema.
///
/// Cheap to clone; clones share the cache and hook chain.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("schema", &self.inner.schema)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(schema: Schema) -> Self {
        Self::with_config(schema, SessionConfig::default())
    }

    pub fn with_config(schema: Schema, config: SessionConfig) -> Self {
        Self::from_parts(schema, config, HookChain::new())
    }

    pub fn builder(schema: Schema) -> SessionBuilder {
        SessionBuilder::new(schema)
    }

    fn from_parts(schema: Schema, config: SessionConfig, hooks: HookChain) -> Self {
        tracing::debug!(
            models = schema.models().len(),
            cache_enabled = config.cache_enabled,
            cache_capacity = config.cache_capacity,
            "Created session"
        );
        Self {
            inner: Arc::new(Inner {
                cache: Mutex::new(CacheState {
                    results: ResultCache::new(config.cache_capacity),
                    generation: 0,
                }),
                batcher: Batcher::default(),
                hooks: RwLock::new(hooks),
                schema,
                config,
            }),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Start an immediate query: reads run as soon as they are awaited and
    /// writes run in their own root transaction.
    pub fn query(&self, model: &str) -> QueryBuilder<Immediate> {
        QueryBuilder::immediate(self.clone(), model)
    }

    /// Open a new root transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction::root(self.clone())
    }

    /// Queue `ops` for the next loader pass and wait for their results.
    ///
    /// Reads queued by concurrent callers of this session before the pass
    /// starts share it. The outer `Outcome` fails only on cancellation;
    /// per-op failures are reported in place.
    pub async fn load_many(&self, cx: &Cx, ops: Vec<LoadOp>) -> Outcome<Vec<Result<Loaded>>, Error> {
        loader::load(self, cx, ops).await
    }

    /// Resolve a relationship-shaped predicate on `model` into a flat one.
    pub async fn resolve(&self, cx: &Cx, model: &str, predicate: &Document) -> Outcome<Document, Error> {
        let model = Arc::clone(try_result!(self.schema().model(model)));
        resolver::resolve(self, cx, &model, predicate).await
    }

    pub fn add_hook(
        &self,
        point: HookPoint,
        hook: impl Fn(&HookContext<'_>) -> Result<HookFlow> + Send + Sync + 'static,
    ) -> HookId {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(point, hook)
    }

    pub fn remove_hook(&self, id: HookId) -> bool {
        self.inner
            .hooks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    /// Drop every cached loader result.
    ///
    /// Results of reads dispatched before this call are not cached when
    /// they complete.
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache();
        cache.generation = cache.generation.wrapping_add(1);
        if !cache.results.is_empty() {
            tracing::trace!(entries = cache.results.len(), "Invalidating result cache");
            cache.results.clear();
        }
    }

    fn cache(&self) -> MutexGuard<'_, CacheState> {
        self.inner.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn batcher(&self) -> &Batcher {
        &self.inner.batcher
    }

    /// Current write generation, captured before dispatching a read.
    pub(crate) fn cache_generation(&self) -> u64 {
        self.cache().generation
    }

    pub(crate) fn cache_get(&self, key: u64) -> Option<Loaded> {
        if !self.inner.config.cache_enabled {
            return None;
        }
        self.cache().results.get(key)
    }

    /// Cache `loaded` unless the cache was invalidated since `generation`.
    pub(crate) fn cache_put(&self, key: u64, loaded: Loaded, generation: u64) {
        if !self.inner.config.cache_enabled {
            return;
        }
        let mut cache = self.cache();
        if cache.generation == generation {
            cache.results.insert(key, loaded);
        } else {
            tracing::trace!(key, "Skipping cache write from before an invalidation");
        }
    }

    /// Run the hooks registered for `ctx.point`.
    ///
    /// The chain is copied out of the lock first so hooks may register or
    /// remove hooks themselves.
    pub(crate) fn fire_hooks(&self, ctx: &HookContext<'_>) -> Result<Option<Vec<Document>>> {
        let hooks = self
            .inner
            .hooks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .at(ctx.point);
        if hooks.is_empty() {
            return Ok(None);
        }
        hooks::run_hooks(&hooks, ctx)
    }

    /// Fire a transaction-level `After*` point.
    pub(crate) fn notify(&self, point: HookPoint) {
        let ctx = HookContext {
            point,
            model: None,
            predicate: None,
            docs: &[],
        };
        // After* hooks never abort
        let _ = self.fire_hooks(&ctx);
    }
}

/// Builder for a [`Session`] with hooks registered up front.
#[derive(Debug)]
pub struct SessionBuilder {
    schema: Schema,
    config: SessionConfig,
    hooks: HookChain,
}

impl SessionBuilder {
    pub fn new(schema: Schema) -> Self {
        Self {
            schema,
            config: SessionConfig::default(),
            hooks: HookChain::new(),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hook(
        mut self,
        point: HookPoint,
        hook: impl Fn(&HookContext<'_>) -> Result<HookFlow> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.register(point, hook);
        self
    }

    pub fn build(self) -> Session {
        Session::from_parts(self.schema, self.config, self.hooks)
    }
}
