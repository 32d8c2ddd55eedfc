//! Batched, deduplicated reads.
//!
//! Callers queue operations on the session's [`Batcher`]. The first caller
//! to find no pass scheduled claims the next one, yields once so concurrent
//! callers can queue theirs, then drains the queue through [`load_pass`].
//! Callers whose key is already queued or in flight wait on that result
//! instead of queueing it again. Operations of a pass are partitioned per
//! model into
//!
//! - **get groups**: finds whose predicate pins the identity key, grouped by
//!   their remaining (non-identity) predicate and sort, issued as one
//!   multi-get (a single `get` when the group pins exactly one identity and
//!   nothing else)
//! - **find/count groups**: identical operations collapse into one call
//!
//! Results are scattered back by index. Every successful result is cached
//! under a stable hash of `{method, model, predicate, sort, limit}`; the
//! session clears the cache wholesale after any write, and results of reads
//! dispatched before that write are not cached. A failing group rejects only
//! its own operations.

use crate::Session;
use asupersync::runtime::yield_now;
use relata_core::value::values_equal;
use relata_core::{
    Cx, Document, Error, FindRequest, Outcome, Result, SortKey, Value, try_outcome, try_result,
};
use relata_query::cache_key;
use relata_query::predicate::{canonical, has_identity, identity_values, without};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Poll, Waker};

/// Read method of a [`LoadOp`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadMethod {
    Find,
    Count,
}

/// One read operation against a resolved predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOp {
    pub model: String,
    pub method: LoadMethod,
    pub predicate: Document,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
}

impl LoadOp {
    pub fn find(model: impl Into<String>, predicate: Document) -> Self {
        Self {
            model: model.into(),
            method: LoadMethod::Find,
            predicate,
            sort: Vec::new(),
            limit: None,
        }
    }

    pub fn count(model: impl Into<String>, predicate: Document) -> Self {
        Self {
            method: LoadMethod::Count,
            ..Self::find(model, predicate)
        }
    }

    #[must_use]
    pub fn sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Stable cache key of this operation.
    pub fn key(&self) -> u64 {
        cache_key(&(
            self.method,
            &self.model,
            canonical(&self.predicate),
            &self.sort,
            self.limit,
        ))
    }
}

/// Result of one [`LoadOp`].
#[derive(Debug, Clone, PartialEq)]
pub enum Loaded {
    Rows(Vec<Document>),
    Count(u64),
}

impl Loaded {
    pub fn into_rows(self) -> Vec<Document> {
        match self {
            Loaded::Rows(rows) => rows,
            Loaded::Count(_) => Vec::new(),
        }
    }

    pub fn count(&self) -> u64 {
        match self {
            Loaded::Rows(rows) => rows.len() as u64,
            Loaded::Count(n) => *n,
        }
    }
}

// ============================================================================
// Pending queue
// ============================================================================

/// Result of one queued operation, filled by whichever caller runs its pass.
#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
}

#[derive(Debug, Default)]
struct SlotState {
    result: Option<Result<Loaded>>,
    waker: Option<Waker>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fill(&self, result: Result<Loaded>) {
        let waker = {
            let mut state = self.lock();
            state.result = Some(result);
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn wake(&self) {
        let waker = self.lock().waker.take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn is_filled(&self) -> bool {
        self.lock().result.is_some()
    }

    /// Register `waker` unless the result is already in. Returns whether it
    /// is.
    fn register(&self, waker: &Waker) -> bool {
        let mut state = self.lock();
        if state.result.is_some() {
            return true;
        }
        state.waker = Some(waker.clone());
        false
    }

    fn take(&self) -> Result<Loaded> {
        self.lock()
            .result
            .take()
            .unwrap_or_else(|| Err(Error::Custom("load was not dispatched".into())))
    }
}

/// Operations waiting for the next loader pass, shared by every clone of a
/// session.
#[derive(Default)]
pub(crate) struct Batcher {
    state: Mutex<BatchState>,
}

#[derive(Default)]
struct BatchState {
    /// One operation per distinct key, waiting for the next pass
    queued: Vec<(u64, LoadOp)>,
    /// Callers waiting on each queued or in-flight key
    waiters: HashMap<u64, Vec<Arc<Slot>>>,
    /// Some caller has claimed the next pass
    leader: bool,
}

impl std::fmt::Debug for Batcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Batcher")
            .field("queued", &state.queued.len())
            .field("waiting", &state.waiters.len())
            .field("leader", &state.leader)
            .finish()
    }
}

impl Batcher {
    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `op`, or attach to the queued or in-flight operation with the
    /// same key.
    fn enqueue(&self, session: &Session, op: LoadOp) -> Arc<Slot> {
        let slot = Arc::new(Slot::default());
        let key = op.key();
        if let Some(hit) = session.cache_get(key) {
            tracing::trace!(model = %op.model, "Loader cache hit");
            slot.fill(Ok(hit));
            return slot;
        }

        let mut guard = self.lock();
        let state = &mut *guard;
        match state.waiters.entry(key) {
            Entry::Occupied(mut waiting) => {
                tracing::trace!(model = %op.model, "Joined pending load");
                waiting.get_mut().push(Arc::clone(&slot));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(vec![Arc::clone(&slot)]);
                state.queued.push((key, op));
            }
        }
        slot
    }

    /// Claim the next pass if nobody has and there is work queued.
    fn try_lead(&self) -> bool {
        let mut state = self.lock();
        if state.leader || state.queued.is_empty() {
            return false;
        }
        state.leader = true;
        true
    }

    /// Take the queue for the claimed pass. Operations queued from here on
    /// go to the next one.
    fn take_queued(&self) -> Vec<(u64, LoadOp)> {
        let mut state = self.lock();
        state.leader = false;
        std::mem::take(&mut state.queued)
    }

    fn complete(&self, key: u64, result: &Result<Loaded>) {
        let slots = self.lock().waiters.remove(&key).unwrap_or_default();
        for slot in slots {
            slot.fill(result.clone());
        }
    }

    /// Put back the operations of an abandoned pass and wake their callers so
    /// one of them claims the next.
    fn requeue(&self, ops: Vec<(u64, LoadOp)>, release: bool) {
        let wake: Vec<Arc<Slot>> = {
            let mut guard = self.lock();
            let state = &mut *guard;
            if release {
                state.leader = false;
            }
            state.queued.extend(ops);
            state
                .queued
                .iter()
                .filter_map(|(key, _)| state.waiters.get(key))
                .flatten()
                .cloned()
                .collect()
        };
        for slot in wake {
            slot.wake();
        }
    }
}

/// A claimed pass. Dropping it before the pass completes hands the work back.
struct Lead<'a> {
    batcher: &'a Batcher,
    claimed: bool,
    in_flight: Vec<(u64, LoadOp)>,
}

impl Drop for Lead<'_> {
    fn drop(&mut self) {
        if self.claimed || !self.in_flight.is_empty() {
            tracing::debug!(in_flight = self.in_flight.len(), "Loader pass abandoned, requeueing");
            self.batcher
                .requeue(std::mem::take(&mut self.in_flight), self.claimed);
        }
    }
}

/// Park until one of `slots` is filled or a pass is handed back.
async fn park(slots: &[Arc<Slot>]) {
    let mut parked = false;
    std::future::poll_fn(|task| {
        if parked {
            return Poll::Ready(());
        }
        let mut all_filled = true;
        for slot in slots {
            all_filled &= slot.register(task.waker());
        }
        if all_filled {
            Poll::Ready(())
        } else {
            parked = true;
            Poll::Pending
        }
    })
    .await;
}

/// Queue `ops` on the session and wait until every one has a result.
pub(crate) async fn load(
    session: &Session,
    cx: &Cx,
    ops: Vec<LoadOp>,
) -> Outcome<Vec<Result<Loaded>>, Error> {
    let batcher = session.batcher();
    let slots: Vec<Arc<Slot>> = ops
        .into_iter()
        .map(|op| batcher.enqueue(session, op))
        .collect();

    while !slots.iter().all(|slot| slot.is_filled()) {
        if !batcher.try_lead() {
            park(&slots).await;
            continue;
        }

        let mut lead = Lead {
            batcher,
            claimed: true,
            in_flight: Vec::new(),
        };
        yield_now().await;
        lead.in_flight = batcher.take_queued();
        lead.claimed = false;

        let (keys, pass): (Vec<u64>, Vec<LoadOp>) = lead.in_flight.iter().cloned().unzip();
        let outcome = load_pass(session, cx, pass).await;
        lead.in_flight.clear();
        match outcome {
            Outcome::Ok(results) => {
                for (key, result) in keys.iter().zip(&results) {
                    batcher.complete(*key, result);
                }
            }
            Outcome::Err(e) => {
                let failed = Err(e);
                for key in &keys {
                    batcher.complete(*key, &failed);
                }
            }
            Outcome::Cancelled(r) => {
                for key in &keys {
                    batcher.complete(*key, &Err(Error::Cancelled));
                }
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                for key in &keys {
                    batcher.complete(*key, &Err(Error::Cancelled));
                }
                return Outcome::Panicked(p);
            }
        }
    }

    Outcome::Ok(slots.iter().map(|slot| slot.take()).collect())
}

// ============================================================================
// Scheduling pass
// ============================================================================

/// A group of operations served by one backend call.
#[derive(Debug)]
enum Group {
    /// Multi-get: `(op index, pinned identities)` sharing one remaining
    /// predicate and sort.
    Get {
        model: String,
        remaining: Document,
        sort: Vec<SortKey>,
        members: Vec<(usize, Vec<Value>)>,
    },
    /// A single find or count, possibly shared by duplicate operations.
    Single { index: usize },
}

/// Run one loader pass over `ops`, collected before any backend call.
#[tracing::instrument(level = "debug", skip(session, cx, ops), fields(ops = ops.len()))]
pub(crate) async fn load_pass(
    session: &Session,
    cx: &Cx,
    ops: Vec<LoadOp>,
) -> Outcome<Vec<Result<Loaded>>, Error> {
    let mut slots: Vec<Option<Result<Loaded>>> = vec![None; ops.len()];
    let keys: Vec<u64> = ops.iter().map(LoadOp::key).collect();
    let generation = session.cache_generation();

    // Cache hits and in-pass duplicates
    let mut first_by_key: HashMap<u64, usize> = HashMap::new();
    let mut duplicates: Vec<(usize, usize)> = Vec::new();
    let mut pending: Vec<usize> = Vec::new();
    for (i, key) in keys.iter().enumerate() {
        if let Some(hit) = session.cache_get(*key) {
            tracing::trace!(model = %ops[i].model, "Loader cache hit");
            slots[i] = Some(Ok(hit));
        } else if let Some(&first) = first_by_key.get(key) {
            duplicates.push((i, first));
        } else {
            first_by_key.insert(*key, i);
            pending.push(i);
        }
    }

    let (groups, rejected) = partition(session, &ops, &pending);
    for (i, e) in rejected {
        slots[i] = Some(Err(e));
    }

    tracing::debug!(
        groups = groups.len(),
        cached = slots.iter().filter(|s| s.is_some()).count(),
        duplicates = duplicates.len(),
        "Dispatching loader groups"
    );

    for group in groups {
        match group {
            Group::Single { index } => {
                let outcome = run_single(session, cx, &ops[index]).await;
                match outcome {
                    Outcome::Ok(loaded) => {
                        session.cache_put(keys[index], loaded.clone(), generation);
                        slots[index] = Some(Ok(loaded));
                    }
                    Outcome::Err(e) => slots[index] = Some(Err(e)),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
            Group::Get {
                model,
                remaining,
                sort,
                members,
            } => {
                match run_get_group(session, cx, &model, remaining, sort, &members).await {
                    Outcome::Ok(rows_per_member) => {
                        for ((index, _), rows) in members.iter().zip(rows_per_member) {
                            let loaded = Loaded::Rows(rows);
                            session.cache_put(keys[*index], loaded.clone(), generation);
                            slots[*index] = Some(Ok(loaded));
                        }
                    }
                    Outcome::Err(e) => {
                        tracing::debug!(model = %model, error = %e, "Loader group failed");
                        for (index, _) in &members {
                            slots[*index] = Some(Err(e.clone()));
                        }
                    }
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
    }

    for (i, first) in duplicates {
        slots[i] = slots[first].clone();
    }

    Outcome::Ok(
        slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(Error::Custom("load was not dispatched".into()))))
            .collect(),
    )
}

/// Split pending operations into backend-call groups. Operations naming an
/// unknown model are rejected individually.
fn partition(
    session: &Session,
    ops: &[LoadOp],
    pending: &[usize],
) -> (Vec<Group>, Vec<(usize, Error)>) {
    let mut groups: Vec<Group> = Vec::new();
    let mut get_groups: HashMap<u64, usize> = HashMap::new();
    let mut rejected = Vec::new();

    for &i in pending {
        let op = &ops[i];
        let model = match session.schema().model(&op.model) {
            Ok(model) => model,
            Err(e) => {
                rejected.push((i, e));
                continue;
            }
        };
        let pinned = match op.method {
            LoadMethod::Find if op.limit.is_none() => {
                identity_values(&op.predicate, model.identity_key())
            }
            _ => None,
        };
        match pinned {
            Some(ids) => {
                let remaining = without(&op.predicate, model.identity_key());
                let group_key = cache_key(&(&op.model, canonical(&remaining), &op.sort));
                if let Some(&g) = get_groups.get(&group_key) {
                    if let Group::Get { members, .. } = &mut groups[g] {
                        members.push((i, ids));
                    }
                } else {
                    get_groups.insert(group_key, groups.len());
                    groups.push(Group::Get {
                        model: op.model.clone(),
                        remaining,
                        sort: op.sort.clone(),
                        members: vec![(i, ids)],
                    });
                }
            }
            None => groups.push(Group::Single { index: i }),
        }
    }

    (groups, rejected)
}

async fn run_single(session: &Session, cx: &Cx, op: &LoadOp) -> Outcome<Loaded, Error> {
    let model = try_result!(session.schema().model(&op.model));
    let backend = try_result!(session.schema().backend_for(model));
    match op.method {
        LoadMethod::Find => {
            let request = FindRequest::new(model.collection(), op.predicate.clone())
                .sort(op.sort.clone())
                .limit(op.limit);
            let rows = try_outcome!(backend.find(cx, &request).await);
            Outcome::Ok(Loaded::Rows(rows))
        }
        LoadMethod::Count => {
            let count = try_outcome!(backend.count(cx, model.collection(), &op.predicate).await);
            Outcome::Ok(Loaded::Count(count))
        }
    }
}

/// Issue one backend call for a multi-get group and split the rows back per
/// member.
async fn run_get_group(
    session: &Session,
    cx: &Cx,
    model_name: &str,
    remaining: Document,
    sort: Vec<SortKey>,
    members: &[(usize, Vec<Value>)],
) -> Outcome<Vec<Vec<Document>>, Error> {
    let model = try_result!(session.schema().model(model_name));
    let backend = try_result!(session.schema().backend_for(model));
    let key = model.identity_key();

    let mut all_ids: Vec<Value> = Vec::new();
    for (_, ids) in members {
        for id in ids {
            if !all_ids.iter().any(|known| values_equal(known, id)) {
                all_ids.push(id.clone());
            }
        }
    }

    let rows = if all_ids.is_empty() {
        Vec::new()
    } else if all_ids.len() == 1 && remaining.is_empty() {
        let found = try_outcome!(backend.get(cx, model.collection(), &all_ids[0]).await);
        found.into_iter().collect()
    } else {
        let mut predicate = remaining;
        predicate.insert(key.to_string(), Value::Array(all_ids));
        let request = FindRequest::new(model.collection(), predicate).sort(sort);
        try_outcome!(backend.find(cx, &request).await)
    };

    Outcome::Ok(
        members
            .iter()
            .map(|(_, ids)| {
                rows.iter()
                    .filter(|row| has_identity(row, key, ids))
                    .cloned()
                    .collect()
            })
            .collect(),
    )
}
