//! Unit-of-work contexts and save propagation.
//!
//! # Responsibility
//! - Track pending inserts / updates / deletes per context, layered over
//!   the durable store through the parent chain.
//! - Derive background child contexts and propagate saves up the chain to
//!   the store-backed root.
//!
//! # Invariants
//! - Every context chain ends at exactly one store-backed root.
//! - A child's save pushes its log to the parent, never to the store; only
//!   the root issues physical writes.
//! - Save propagation is fail-forward: the first failing ancestor aborts
//!   the walk, contexts that already saved stay saved.
//! - All pending-id references in a log are rewritten to permanent ids
//!   before the log leaves the context that obtained them.

use crate::model::{AttrMap, IdKey, Model, ModelViolation};
use crate::query::QueryResult;
use crate::store::Store;
use log::{debug, error};
use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

mod ops;
mod queue;

pub use ops::Fetched;
pub use queue::Task;

use queue::ContextQueue;

pub type SaveResult<T> = Result<T, SaveError>;

/// Failure while saving a context or an ancestor in its chain.
#[derive(Debug)]
pub enum SaveError {
    Model(ModelViolation),
    /// An update targeted a row that no longer exists in the store.
    MissingRow { entity: String, id: i64 },
    /// A pending identifier minted outside this chain reached the store
    /// without ever being assigned a permanent id.
    UnresolvedId { entity: String },
    Db(rusqlite::Error),
}

impl Display for SaveError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Model(violation) => write!(f, "{violation}"),
            Self::MissingRow { entity, id } => {
                write!(f, "row {id} of entity `{entity}` does not exist")
            }
            Self::UnresolvedId { entity } => {
                write!(f, "unresolved pending identifier for entity `{entity}`")
            }
            Self::Db(err) => write!(f, "{err}"),
        }
    }
}

impl Error for SaveError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Model(violation) => Some(violation),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ModelViolation> for SaveError {
    fn from(value: ModelViolation) -> Self {
        Self::Model(value)
    }
}

impl From<rusqlite::Error> for SaveError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(value)
    }
}

/// One recorded mutation, applied in log order.
#[derive(Debug, Clone)]
pub(crate) enum PendingOp {
    Insert { id: IdKey, attrs: AttrMap },
    Update { id: IdKey, attrs: AttrMap },
    Delete { id: IdKey },
    DeleteAll,
}

#[derive(Debug, Clone)]
pub(crate) struct PendingChange {
    pub(crate) entity: String,
    pub(crate) op: PendingOp,
}

#[derive(Default)]
struct ContextState {
    pending: Vec<PendingChange>,
    /// Pending ids this context has obtained permanent ids for.
    id_map: HashMap<Uuid, i64>,
}

enum Upstream {
    Store(Arc<Store>),
    Parent(Context),
}

struct ContextInner {
    queue: Arc<ContextQueue>,
    upstream: Upstream,
    model: Arc<Model>,
    state: Mutex<ContextState>,
}

static CHILD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Handle to one unit-of-work context.
///
/// Cloning shares the same context; every operation is scheduled on the
/// context's own queue. Entities never cross context boundaries directly;
/// only [`crate::EntityId`] values do, re-resolved in the target context.
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("label", &self.label())
            .finish()
    }
}

impl Context {
    pub(crate) fn store_backed(store: Arc<Store>, model: Arc<Model>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                queue: ContextQueue::new("main"),
                upstream: Upstream::Store(store),
                model,
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    /// Derives a background child context whose parent is `self`, with its
    /// own private queue.
    pub fn derive_child(&self) -> Self {
        let seq = CHILD_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::new(ContextInner {
                queue: ContextQueue::new(format!("child-{seq}")),
                upstream: Upstream::Parent(self.clone()),
                model: self.inner.model.clone(),
                state: Mutex::new(ContextState::default()),
            }),
        }
    }

    pub fn label(&self) -> &str {
        self.inner.queue.label()
    }

    /// Whether this context writes directly to the store when saving.
    pub fn is_store_backed(&self) -> bool {
        matches!(self.inner.upstream, Upstream::Store(_))
    }

    pub fn parent(&self) -> Option<&Context> {
        match &self.inner.upstream {
            Upstream::Parent(parent) => Some(parent),
            Upstream::Store(_) => None,
        }
    }

    /// Whether this context holds unsaved changes.
    pub fn has_changes(&self) -> bool {
        !self.lock_state().pending.is_empty()
    }

    /// Schedules `f` on this context's queue and returns immediately.
    pub fn perform(&self, f: impl FnOnce(&Context) + Send + 'static) {
        let ctx = self.clone();
        self.inner.queue.dispatch(move || f(&ctx));
    }

    pub(crate) fn run_sync<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let ctx = self.clone();
        self.inner.queue.run_sync(move || f(&ctx))
    }

    pub(crate) fn model(&self) -> &Arc<Model> {
        &self.inner.model
    }

    fn lock_state(&self) -> MutexGuard<'_, ContextState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The store at the root of this chain.
    pub(crate) fn store(&self) -> Arc<Store> {
        let mut current = self.clone();
        loop {
            let next = match &current.inner.upstream {
                Upstream::Store(store) => return store.clone(),
                Upstream::Parent(parent) => parent.clone(),
            };
            current = next;
        }
    }

    fn chain_root_first(&self) -> Vec<Context> {
        let mut chain = vec![self.clone()];
        let mut current = self.clone();
        loop {
            let parent = match &current.inner.upstream {
                Upstream::Parent(parent) => parent.clone(),
                Upstream::Store(_) => break,
            };
            chain.push(parent.clone());
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// Union of the pending-to-permanent mappings along the chain.
    fn collect_id_maps(&self) -> HashMap<Uuid, i64> {
        let mut resolved = HashMap::new();
        for ctx in self.chain_root_first() {
            resolved.extend(ctx.lock_state().id_map.iter().map(|(k, v)| (*k, *v)));
        }
        resolved
    }

    pub(crate) fn resolve_key(&self, key: IdKey) -> IdKey {
        match key {
            IdKey::Pending(uuid) => match self.collect_id_maps().get(&uuid) {
                Some(id) => IdKey::Permanent(*id),
                None => key,
            },
            IdKey::Permanent(_) => key,
        }
    }

    /// Records one mutation in this context's log, on its queue, resolving
    /// identifiers that already obtained a permanent id.
    pub(crate) fn record_change(&self, entity: String, op: PendingOp) {
        self.run_sync(move |ctx| {
            let resolved = ctx.collect_id_maps();
            let op = resolve_op(op, &resolved);
            ctx.lock_state().pending.push(PendingChange { entity, op });
        });
    }

    pub(crate) fn record_delete_all(&self, entity: &str) {
        self.record_change(entity.to_string(), PendingOp::DeleteAll);
    }

    /// Builds the rows of `entity` visible from this context: the durable
    /// snapshot overlaid with every pending log from the root down to this
    /// context, in recording order.
    pub(crate) fn snapshot(&self, entity: &str) -> QueryResult<BTreeMap<IdKey, AttrMap>> {
        let mut rows: BTreeMap<IdKey, AttrMap> = self
            .store()
            .scan(entity)?
            .into_iter()
            .map(|(id, attrs)| (IdKey::Permanent(id), attrs))
            .collect();

        let resolved = self.collect_id_maps();
        for ctx in self.chain_root_first() {
            let state = ctx.lock_state();
            for change in state.pending.iter().filter(|c| c.entity == entity) {
                match &change.op {
                    PendingOp::Insert { id, attrs } => {
                        rows.insert(resolve_with(*id, &resolved), attrs.clone());
                    }
                    PendingOp::Update { id, attrs } => {
                        let key = resolve_with(*id, &resolved);
                        if let Some(slot) = rows.get_mut(&key) {
                            *slot = attrs.clone();
                        }
                    }
                    PendingOp::Delete { id } => {
                        rows.remove(&resolve_with(*id, &resolved));
                    }
                    PendingOp::DeleteAll => rows.clear(),
                }
            }
        }
        Ok(rows)
    }

    /// Saves this context and then every ancestor up to the store-backed
    /// root. The first failure aborts the walk and is returned; contexts
    /// saved before the failure stay saved.
    pub fn save_chain(&self) -> SaveResult<()> {
        self.run_sync(|ctx| ctx.save_local())?;
        match &self.inner.upstream {
            Upstream::Parent(parent) => parent.save_chain(),
            Upstream::Store(_) => Ok(()),
        }
    }

    /// Saves this context's own log: validates it, obtains permanent ids
    /// for pending inserts, then applies to the store (root) or pushes to
    /// the parent (child). Runs on this context's queue.
    fn save_local(&self) -> SaveResult<()> {
        let store = self.store();
        let mut state = self.lock_state();
        if state.pending.is_empty() {
            return Ok(());
        }

        for change in &state.pending {
            match &change.op {
                PendingOp::Insert { attrs, .. } | PendingOp::Update { attrs, .. } => {
                    self.inner.model.check_record(&change.entity, attrs)?;
                }
                PendingOp::Delete { .. } | PendingOp::DeleteAll => {}
            }
        }

        // Obtain permanent identifiers for every pending insert first.
        let mut new_map: HashMap<Uuid, i64> = HashMap::new();
        for change in &state.pending {
            if let PendingOp::Insert {
                id: IdKey::Pending(uuid),
                ..
            } = &change.op
            {
                if !new_map.contains_key(uuid) {
                    new_map.insert(*uuid, store.allocate_id());
                }
            }
        }

        let mut resolved = self.collect_ancestor_id_maps();
        resolved.extend(state.id_map.iter().map(|(k, v)| (*k, *v)));
        resolved.extend(new_map.iter().map(|(k, v)| (*k, *v)));

        let log: Vec<PendingChange> = state
            .pending
            .iter()
            .map(|change| PendingChange {
                entity: change.entity.clone(),
                op: resolve_op(change.op.clone(), &resolved),
            })
            .collect();

        let result = match &self.inner.upstream {
            Upstream::Store(store) => store.apply(&log),
            Upstream::Parent(parent) => {
                // The parent also learns the new permanent ids, so pending
                // identifiers resolve from anywhere in the tree afterwards.
                parent.absorb(log, new_map.clone());
                Ok(())
            }
        };

        match result {
            Ok(()) => {
                debug!(
                    "event=save module=context status=ok label={} ops={}",
                    self.label(),
                    state.pending.len()
                );
                state.pending.clear();
                state.id_map.extend(new_map);
                Ok(())
            }
            Err(err) => {
                // Changes stay pending; the caller may retry.
                error!(
                    "event=save module=context status=error label={} error={err}",
                    self.label()
                );
                Err(err)
            }
        }
    }

    /// Like [`collect_id_maps`](Self::collect_id_maps) but excluding this
    /// context, for callers already holding its state lock.
    fn collect_ancestor_id_maps(&self) -> HashMap<Uuid, i64> {
        match &self.inner.upstream {
            Upstream::Parent(parent) => parent.collect_id_maps(),
            Upstream::Store(_) => HashMap::new(),
        }
    }

    /// Appends a child's saved log to this context's pending log and adopts
    /// the permanent ids the child obtained for it.
    fn absorb(&self, log: Vec<PendingChange>, ids: HashMap<Uuid, i64>) {
        self.run_sync(move |ctx| {
            let mut state = ctx.lock_state();
            state.pending.extend(log);
            state.id_map.extend(ids);
        });
    }

    /// Saves the whole chain off this context's queue.
    ///
    /// Completes immediately with `Ok` when nothing is pending. Otherwise
    /// the chain save runs inside a derived child context and the
    /// completion resolves from a job on this context's queue, exactly
    /// once.
    pub fn async_save(&self) -> Task<SaveResult<()>> {
        let (completion, task) = Task::channel();
        if !self.has_changes() {
            self.perform(move |_| completion.resolve(Ok(())));
            return task;
        }

        let origin = self.clone();
        let child = self.derive_child();
        child.perform(move |background| {
            // The child is empty; its chain save drains the originating
            // context and every ancestor above it.
            let result = background.save_chain();
            origin.perform(move |_| completion.resolve(result));
        });
        task
    }
}

fn resolve_with(key: IdKey, resolved: &HashMap<Uuid, i64>) -> IdKey {
    match key {
        IdKey::Pending(uuid) => match resolved.get(&uuid) {
            Some(id) => IdKey::Permanent(*id),
            None => key,
        },
        IdKey::Permanent(_) => key,
    }
}

fn resolve_op(op: PendingOp, resolved: &HashMap<Uuid, i64>) -> PendingOp {
    match op {
        PendingOp::Insert { id, attrs } => PendingOp::Insert {
            id: resolve_with(id, resolved),
            attrs,
        },
        PendingOp::Update { id, attrs } => PendingOp::Update {
            id: resolve_with(id, resolved),
            attrs,
        },
        PendingOp::Delete { id } => PendingOp::Delete {
            id: resolve_with(id, resolved),
        },
        PendingOp::DeleteAll => PendingOp::DeleteAll,
    }
}
