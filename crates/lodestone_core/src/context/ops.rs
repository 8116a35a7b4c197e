//! Typed entity operations on a context.
//!
//! # Responsibility
//! - Record create / update / delete mutations for `Record` types.
//! - Evaluate count / exists / fetch requests over the context's merged
//!   view of the store and the pending logs of its chain.
//! - Run the asynchronous variants in a derived child context and marshal
//!   results back through the originating context's queue.
//!
//! # Invariants
//! - Reads see the durable rows overlaid with every unsaved change visible
//!   from this context, root first.
//! - Asynchronous results are re-resolved in the originating context before
//!   delivery; only identifiers cross the queue boundary.

use super::queue::Task;
use super::{Context, PendingOp};
use crate::model::{AttrMap, EntityId, IdKey, Record};
use crate::query::{order_rows, FetchRequest, Predicate, QueryError, QueryResult};

/// A record materialized by a fetch, paired with its identifier.
#[derive(Debug, Clone)]
pub struct Fetched<E> {
    pub id: EntityId<E>,
    pub record: E,
}

impl Context {
    /// Records a new entity and returns its identifier, pending until the
    /// chain saves.
    pub fn create<E: Record>(&self, record: &E) -> EntityId<E> {
        let id = EntityId::pending();
        self.record_change(
            E::entity_name().to_string(),
            PendingOp::Insert {
                id: id.key,
                attrs: record.to_attrs(),
            },
        );
        id
    }

    /// Replaces the stored attributes of `id` with the record's current
    /// ones. Updating a row that no longer exists surfaces at save time.
    pub fn update<E: Record>(&self, id: EntityId<E>, record: &E) {
        self.record_change(
            E::entity_name().to_string(),
            PendingOp::Update {
                id: id.key,
                attrs: record.to_attrs(),
            },
        );
    }

    /// Records the deletion of `id`. Deleting an absent row is a no-op.
    pub fn delete<E: Record>(&self, id: EntityId<E>) {
        self.record_change(
            E::entity_name().to_string(),
            PendingOp::Delete { id: id.key },
        );
    }

    /// Fetches one entity by identifier; `Ok(None)` when it does not exist
    /// in this context's view.
    pub fn get<E: Record>(&self, id: EntityId<E>) -> QueryResult<Option<Fetched<E>>> {
        self.run_sync(move |ctx| {
            let rows = ctx.snapshot(E::entity_name())?;
            let key = ctx.resolve_key(id.key);
            match rows.get(&key) {
                Some(attrs) => Ok(Some(materialize::<E>(key, attrs)?)),
                None => Ok(None),
            }
        })
    }

    /// Counts the entities matching `predicate` (all of them when `None`).
    pub fn count<E: Record>(&self, predicate: Option<&Predicate>) -> QueryResult<usize> {
        let predicate = predicate.cloned();
        self.run_sync(move |ctx| ctx.count_rows::<E>(predicate.as_ref()))
    }

    /// Whether at least one matching entity exists.
    pub fn exists<E: Record>(&self, predicate: Option<&Predicate>) -> QueryResult<bool> {
        let predicate = predicate.cloned();
        self.run_sync(move |ctx| {
            let entity = E::entity_name();
            if let Some(p) = &predicate {
                p.validate(ctx.model(), entity)?;
            }
            let rows = ctx.snapshot(entity)?;
            Ok(rows
                .values()
                .any(|attrs| predicate.as_ref().map_or(true, |p| p.matches(attrs))))
        })
    }

    /// Executes a fetch request; rows come back in request order.
    pub fn fetch<E: Record>(&self, request: &FetchRequest) -> QueryResult<Vec<Fetched<E>>> {
        let request = request.clone();
        self.run_sync(move |ctx| ctx.fetch_rows::<E>(&request))
    }

    /// Fetches only the first row of the request's order.
    pub fn fetch_first<E: Record>(&self, request: &FetchRequest) -> QueryResult<Option<Fetched<E>>> {
        let mut request = request.clone();
        request.limit = Some(1);
        Ok(self.fetch::<E>(&request)?.into_iter().next())
    }

    /// Returns the first entity matching `predicate`, creating one with
    /// `make` when none exists. The flag is `true` when a creation
    /// happened.
    pub fn fetch_or_create<E, F>(&self, predicate: &Predicate, make: F) -> QueryResult<(Fetched<E>, bool)>
    where
        E: Record,
        F: FnOnce() -> E + Send + 'static,
    {
        let predicate = predicate.clone();
        self.run_sync(move |ctx| {
            let request = FetchRequest::matching(predicate).limited(1);
            if let Some(found) = ctx.fetch_rows::<E>(&request)?.into_iter().next() {
                return Ok((found, false));
            }
            let record = make();
            let id = ctx.create(&record);
            Ok((Fetched { id, record }, true))
        })
    }

    /// The permanent form of `id`, once a save in this chain has assigned
    /// one. `None` while the identifier is still pending.
    pub fn permanent_id<E>(&self, id: EntityId<E>) -> Option<EntityId<E>> {
        match self.resolve_key(id.key) {
            IdKey::Permanent(value) => Some(EntityId::from_permanent(value)),
            IdKey::Pending(_) => None,
        }
    }

    /// Counts matching entities in a derived background context.
    pub fn count_async<E: Record>(&self, predicate: Option<Predicate>) -> Task<QueryResult<usize>> {
        self.offload(move |background| background.count_rows::<E>(predicate.as_ref()))
    }

    /// Existence check in a derived background context.
    pub fn exists_async<E: Record>(&self, predicate: Option<Predicate>) -> Task<QueryResult<bool>> {
        self.offload(move |background| {
            background
                .count_rows::<E>(predicate.as_ref())
                .map(|count| count > 0)
        })
    }

    /// Executes the fetch in a derived background context and re-resolves
    /// every result in this context before completing. Rows deleted between
    /// the two queues are dropped from the result.
    pub fn fetch_async<E: Record>(&self, request: FetchRequest) -> Task<QueryResult<Vec<Fetched<E>>>> {
        let (completion, task) = Task::channel();
        let origin = self.clone();
        let child = self.derive_child();
        child.perform(move |background| {
            let outcome = background.fetch_rows::<E>(&request);
            origin.perform(move |octx| {
                let marshaled = outcome.and_then(|found| {
                    let mut resolved = Vec::with_capacity(found.len());
                    for item in found {
                        if let Some(fetched) = octx.get(item.id)? {
                            resolved.push(fetched);
                        }
                    }
                    Ok(resolved)
                });
                completion.resolve(marshaled);
            });
        });
        task
    }

    /// Asynchronous [`fetch_or_create`](Self::fetch_or_create): the lookup
    /// runs in a derived background context, the creation (when needed)
    /// happens in this context.
    pub fn fetch_or_create_async<E, F>(
        &self,
        predicate: Predicate,
        make: F,
    ) -> Task<QueryResult<(Fetched<E>, bool)>>
    where
        E: Record,
        F: FnOnce() -> E + Send + 'static,
    {
        let (completion, task) = Task::channel();
        let origin = self.clone();
        let child = self.derive_child();
        child.perform(move |background| {
            let request = FetchRequest::matching(predicate).limited(1);
            let outcome = background
                .fetch_rows::<E>(&request)
                .map(|found| found.into_iter().next());
            origin.perform(move |octx| {
                let marshaled = match outcome {
                    Ok(Some(found)) => match octx.get(found.id) {
                        Ok(Some(fetched)) => Ok((fetched, false)),
                        // The row vanished between the two queues.
                        Ok(None) => Ok(octx.create_fresh(make)),
                        Err(err) => Err(err),
                    },
                    Ok(None) => Ok(octx.create_fresh(make)),
                    Err(err) => Err(err),
                };
                completion.resolve(marshaled);
            });
        });
        task
    }

    fn create_fresh<E: Record>(&self, make: impl FnOnce() -> E) -> (Fetched<E>, bool) {
        let record = make();
        let id = self.create(&record);
        (Fetched { id, record }, true)
    }

    /// Runs `f` in a derived background context and completes from this
    /// context's queue.
    fn offload<R, F>(&self, f: F) -> Task<R>
    where
        F: FnOnce(&Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (completion, task) = Task::channel();
        let origin = self.clone();
        let child = self.derive_child();
        child.perform(move |background| {
            let value = f(background);
            origin.perform(move |_| completion.resolve(value));
        });
        task
    }

    /// Count evaluation on this context's queue.
    fn count_rows<E: Record>(&self, predicate: Option<&Predicate>) -> QueryResult<usize> {
        let entity = E::entity_name();
        if let Some(p) = predicate {
            p.validate(self.model(), entity)?;
        }
        let rows = self.snapshot(entity)?;
        Ok(rows
            .values()
            .filter(|attrs| predicate.map_or(true, |p| p.matches(attrs)))
            .count())
    }

    /// Fetch evaluation on this context's queue: snapshot, filter, order,
    /// then window.
    fn fetch_rows<E: Record>(&self, request: &FetchRequest) -> QueryResult<Vec<Fetched<E>>> {
        let entity = E::entity_name();
        request.validate(self.model(), entity)?;
        let rows = self.snapshot(entity)?;

        let mut matched: Vec<(IdKey, AttrMap)> = rows
            .into_iter()
            .filter(|(_, attrs)| {
                request
                    .predicate
                    .as_ref()
                    .map_or(true, |p| p.matches(attrs))
            })
            .collect();
        order_rows(&mut matched, &request.sort);

        let limit = request.limit.map_or(usize::MAX, |limit| limit as usize);
        let mut out = Vec::new();
        for (key, attrs) in matched.into_iter().skip(request.offset as usize).take(limit) {
            out.push(materialize::<E>(key, &attrs)?);
        }
        Ok(out)
    }
}

fn materialize<E: Record>(key: IdKey, attrs: &AttrMap) -> QueryResult<Fetched<E>> {
    match E::from_attrs(attrs) {
        Ok(record) => Ok(Fetched {
            id: EntityId::new(key),
            record,
        }),
        Err(err) => Err(QueryError::InvalidData {
            entity: E::entity_name().to_string(),
            message: err.to_string(),
        }),
    }
}
