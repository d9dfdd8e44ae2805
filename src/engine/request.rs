use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use crate::core::{AnyId, ArcStr, Identity, Value};
use crate::engine::promise::Sink;
use crate::source::Source;

/// Result map delivered to batch waiters.
pub(crate) type Results<I, A> = Arc<HashMap<I, A>>;

/// Resolution of a pending request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus<T> {
    Done(T),
    Missing,
}

impl<I: Identity, A: Value> FetchStatus<Results<I, A>> {
    /// Narrows a batch resolution down to a single identity.
    pub(crate) fn project(&self, id: &I) -> FetchStatus<A> {
        match self {
            FetchStatus::Done(map) => match map.get(id) {
                Some(value) => FetchStatus::Done(value.clone()),
                None => FetchStatus::Missing,
            },
            FetchStatus::Missing => FetchStatus::Missing,
        }
    }
}

/// Type-erased description of a query, used by traces and errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub source: ArcStr,
    pub kind: QueryKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    One(AnyId),
    Batch(Vec<AnyId>),
}

impl Query {
    pub fn one<I: Identity>(source: &str, id: &I) -> Self {
        Self {
            source: source.into(),
            kind: QueryKind::One(AnyId::new(id.clone())),
        }
    }

    pub fn batch<I: Identity>(source: &str, ids: &[I]) -> Self {
        Self {
            source: source.into(),
            kind: QueryKind::Batch(ids.iter().cloned().map(AnyId::new).collect()),
        }
    }

    pub fn ids(&self) -> &[AnyId] {
        match &self.kind {
            QueryKind::One(id) => std::slice::from_ref(id),
            QueryKind::Batch(ids) => ids,
        }
    }
}

/// A caller blocked on a batch, either waiting for one of its identities or
/// for the whole result map.
pub(crate) enum Waiter<I, A> {
    One(I, Sink<FetchStatus<A>>),
    Batch(Sink<FetchStatus<Results<I, A>>>),
}

impl<I: Identity, A: Value> Waiter<I, A> {
    pub(crate) fn resolve(self, status: &FetchStatus<Results<I, A>>) {
        match self {
            Waiter::One(id, sink) => sink(status.project(&id)),
            Waiter::Batch(sink) => sink(status.clone()),
        }
    }
}

/// The pending half of a [`BlockedRequest`], either a single identity or a
/// non-empty ordered set of unique identities. Merged waiters are kept side
/// by side, resolving a request never recurses into nested callbacks.
pub(crate) enum Pending<I, A> {
    One {
        id: I,
        sinks: Vec<Sink<FetchStatus<A>>>,
    },
    Batch {
        ids: Vec<I>,
        seen: HashSet<I>,
        waiters: Vec<Waiter<I, A>>,
    },
}

/// Hands the same status to every sink of a single-identity request.
pub(crate) fn notify<A: Value>(sinks: Vec<Sink<FetchStatus<A>>>, status: FetchStatus<A>) {
    for sink in sinks {
        sink(status.clone());
    }
}

/// A query to one source together with the callbacks unblocking its waiters.
pub(crate) struct BlockedRequest<I: Identity, A: Value> {
    pub(crate) source: Source<I, A>,
    pub(crate) pending: Pending<I, A>,
}

impl<I: Identity, A: Value> BlockedRequest<I, A> {
    pub(crate) fn one(source: Source<I, A>, id: I, sink: Sink<FetchStatus<A>>) -> Self {
        Self {
            source,
            pending: Pending::One {
                id,
                sinks: vec![sink],
            },
        }
    }

    /// `ids` must be non-empty and free of duplicates.
    pub(crate) fn batch(
        source: Source<I, A>,
        ids: Vec<I>,
        sink: Sink<FetchStatus<Results<I, A>>>,
    ) -> Self {
        debug_assert!(!ids.is_empty());
        let seen: HashSet<I> = ids.iter().cloned().collect();
        debug_assert_eq!(seen.len(), ids.len());

        Self {
            source,
            pending: Pending::Batch {
                ids,
                seen,
                waiters: vec![Waiter::Batch(sink)],
            },
        }
    }

    pub(crate) fn query(&self) -> Query {
        let name = self.source.name();
        match &self.pending {
            Pending::One { id, .. } => Query::one(name, id),
            Pending::Batch { ids, .. } => Query::batch(name, ids),
        }
    }

    /// Merges two requests to the same source into one. Resolving the merged
    /// request resolves both originals, each with the shape it expects.
    ///
    /// Growing a batch costs the size of `other`, so folding many requests
    /// into one stays linear.
    pub(crate) fn combine(self, other: Self) -> Self {
        let source = self.source;

        let pending = match (self.pending, other.pending) {
            (Pending::One { id: a, sinks: mut sa }, Pending::One { id: b, sinks: sb }) if a == b => {
                sa.extend(sb);
                Pending::One { id: a, sinks: sa }
            }
            (Pending::One { id: a, sinks: sa }, Pending::One { id: b, sinks: sb }) => {
                let ids = vec![a.clone(), b.clone()];
                let seen = ids.iter().cloned().collect();
                let waiters = one_waiters(a, sa).chain(one_waiters(b, sb)).collect();
                Pending::Batch { ids, seen, waiters }
            }
            (Pending::One { id, sinks }, Pending::Batch { ids: rest, seen: _, waiters: more }) => {
                let mut ids = Vec::with_capacity(rest.len() + 1);
                let mut seen = HashSet::with_capacity(rest.len() + 1);
                push_id(&mut ids, &mut seen, id.clone());
                for other in rest {
                    push_id(&mut ids, &mut seen, other);
                }

                let mut waiters: Vec<_> = one_waiters(id, sinks).collect();
                waiters.extend(more);
                Pending::Batch { ids, seen, waiters }
            }
            (Pending::Batch { mut ids, mut seen, mut waiters }, Pending::One { id, sinks }) => {
                push_id(&mut ids, &mut seen, id.clone());
                waiters.extend(one_waiters(id, sinks));
                Pending::Batch { ids, seen, waiters }
            }
            (
                Pending::Batch { mut ids, mut seen, mut waiters },
                Pending::Batch { ids: rest, seen: _, waiters: more },
            ) => {
                for other in rest {
                    push_id(&mut ids, &mut seen, other);
                }
                waiters.extend(more);
                Pending::Batch { ids, seen, waiters }
            }
        };

        Self { source, pending }
    }
}

/// Appends `id` unless the batch already holds it.
fn push_id<I: Identity>(ids: &mut Vec<I>, seen: &mut HashSet<I>, id: I) {
    if seen.insert(id.clone()) {
        ids.push(id);
    }
}

fn one_waiters<I: Identity, A: Value>(
    id: I,
    sinks: Vec<Sink<FetchStatus<A>>>,
) -> impl Iterator<Item = Waiter<I, A>> {
    sinks.into_iter().map(move |sink| Waiter::One(id.clone(), sink))
}

/// Ordered union: everything in `x` in its order, then every id of `y` not
/// already present, in `y`'s order.
pub(crate) fn union<I: Eq + Hash + Clone>(x: Vec<I>, y: Vec<I>) -> Vec<I> {
    let mut seen: HashSet<I> = x.iter().cloned().collect();
    let mut acc = x;
    for id in y {
        if seen.insert(id.clone()) {
            acc.push(id);
        }
    }
    acc
}
