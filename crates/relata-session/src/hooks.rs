//! Ordered hook chains.
//!
//! Hooks are plain functions registered against a [`HookPoint`]. They run
//! synchronously in registration order. A hook returns a [`HookFlow`]:
//! `Continue` hands control to the next hook, `ShortCircuit(docs)` stops the
//! chain. Short-circuiting is honoured at [`HookPoint::BeforeRead`], where the
//! read returns `docs` without a backend call; at other points it only stops
//! the remaining hooks.
//!
//! An `Err` from a `Before*` hook aborts the operation. Errors from `After*`
//! hooks are logged and do not undo anything.

use relata_core::{Document, Result};
use std::sync::Arc;

/// Where in the pipeline a hook runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Before a read is resolved and loaded.
    BeforeRead,
    /// After a read returns, with the returned documents.
    AfterRead,
    /// Before a write is recorded, with its input documents.
    BeforeWrite,
    /// After a root transaction commits.
    AfterCommit,
    /// After a transaction is rolled back.
    AfterRollback,
}

impl HookPoint {
    pub const fn is_before(self) -> bool {
        matches!(self, HookPoint::BeforeRead | HookPoint::BeforeWrite)
    }
}

/// What a hook sees.
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub point: HookPoint,
    /// Model the operation targets; `None` for transaction-level points.
    pub model: Option<&'a str>,
    /// Unresolved where-predicate of a read or targeted write.
    pub predicate: Option<&'a Document>,
    /// Documents read, or inputs being written.
    pub docs: &'a [Document],
}

/// A hook's decision.
#[derive(Debug, Clone, PartialEq)]
pub enum HookFlow {
    Continue,
    ShortCircuit(Vec<Document>),
}

/// Handle returned by registration, used to remove the hook again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HookId(u64);

pub(crate) type HookFn = Arc<dyn Fn(&HookContext<'_>) -> Result<HookFlow> + Send + Sync>;

/// Registered hooks, in registration order.
#[derive(Default, Clone)]
pub struct HookChain {
    hooks: Vec<(HookId, HookPoint, HookFn)>,
    next_id: u64,
}

impl std::fmt::Debug for HookChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookChain")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

impl HookChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        point: HookPoint,
        hook: impl Fn(&HookContext<'_>) -> Result<HookFlow> + Send + Sync + 'static,
    ) -> HookId {
        self.next_id += 1;
        let id = HookId(self.next_id);
        self.hooks.push((id, point, Arc::new(hook)));
        id
    }

    /// Remove a hook. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: HookId) -> bool {
        let before = self.hooks.len();
        self.hooks.retain(|(hook_id, _, _)| *hook_id != id);
        self.hooks.len() != before
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Hooks registered for `point`, in order.
    pub(crate) fn at(&self, point: HookPoint) -> Vec<HookFn> {
        self.hooks
            .iter()
            .filter(|(_, p, _)| *p == point)
            .map(|(_, _, hook)| Arc::clone(hook))
            .collect()
    }

    /// Run the chain for `ctx.point`.
    ///
    /// Returns the short-circuit documents, if a hook supplied them.
    pub fn run(&self, ctx: &HookContext<'_>) -> Result<Option<Vec<Document>>> {
        run_hooks(&self.at(ctx.point), ctx)
    }
}

pub(crate) fn run_hooks(hooks: &[HookFn], ctx: &HookContext<'_>) -> Result<Option<Vec<Document>>> {
    for hook in hooks {
        match hook(ctx) {
            Ok(HookFlow::Continue) => {}
            Ok(HookFlow::ShortCircuit(docs)) => {
                tracing::debug!(point = ?ctx.point, model = ?ctx.model, "Hook short-circuited");
                return Ok(Some(docs));
            }
            Err(e) if ctx.point.is_before() => return Err(e),
            Err(e) => {
                tracing::warn!(point = ?ctx.point, model = ?ctx.model, error = %e, "Hook failed");
            }
        }
    }
    Ok(None)
}
