use std::any::{Any, TypeId};
use std::collections::HashMap;

use crate::core::{ArcStr, Identity, Value};
use crate::engine::diagnostics::Request;
use crate::engine::request::{BlockedRequest, Query};
use crate::engine::round::CacheCell;
use crate::error::SourceError;

/// Object-safe view of a [`BlockedRequest`], lets requests to sources of
/// different identity and value types share one map.
pub(crate) trait AnyRequest: Send {
    fn query(&self) -> Query;

    /// `other` must target the same source as `self`.
    fn merge(self: Box<Self>, other: Box<dyn AnyRequest>) -> Box<dyn AnyRequest>;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;

    /// Performs the request and returns the source calls it made.
    fn run(self: Box<Self>, cache: &dyn CacheCell) -> Result<Vec<Request>, SourceError>;
}

impl<I: Identity, A: Value> AnyRequest for BlockedRequest<I, A> {
    fn query(&self) -> Query {
        BlockedRequest::query(self)
    }

    fn merge(self: Box<Self>, other: Box<dyn AnyRequest>) -> Box<dyn AnyRequest> {
        let other = other
            .into_any()
            .downcast::<Self>()
            .expect("Type mismatch between requests to the same source");

        Box::new((*self).combine(*other))
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn run(self: Box<Self>, cache: &dyn CacheCell) -> Result<Vec<Request>, SourceError> {
        BlockedRequest::run(*self, cache)
    }
}

/// Sources are told apart by name and by their identity and value types, two
/// entries only merge when both match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SourceKey {
    name: ArcStr,
    kind: TypeId,
}

impl SourceKey {
    fn of<I: Identity, A: Value>(request: &BlockedRequest<I, A>) -> Self {
        Self {
            name: request.source.name().into(),
            kind: TypeId::of::<(I, A)>(),
        }
    }
}

/// Requests blocking a program, at most one per source.
#[derive(Default)]
pub struct RequestMap {
    map: HashMap<SourceKey, Box<dyn AnyRequest>>,
}

impl RequestMap {
    pub(crate) fn single<I: Identity, A: Value>(request: BlockedRequest<I, A>) -> Self {
        let mut map = Self::default();
        map.insert(request);
        map
    }

    /// Adds a request, merging it into the entry for its source if there is
    /// one already.
    pub(crate) fn insert<I: Identity, A: Value>(&mut self, request: BlockedRequest<I, A>) {
        self.insert_erased(SourceKey::of(&request), Box::new(request));
    }

    fn insert_erased(&mut self, key: SourceKey, request: Box<dyn AnyRequest>) {
        let request = match self.map.remove(&key) {
            Some(current) => current.merge(request),
            None => request,
        };
        self.map.insert(key, request);
    }

    /// Merges two maps so both sets of requests run in the same round.
    /// Requests to a shared source are combined with `self` on the left.
    pub(crate) fn combine(mut self, other: RequestMap) -> RequestMap {
        for (key, request) in other.map {
            self.insert_erased(key, request);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Describes the pending requests, in no particular order.
    pub fn queries(&self) -> Vec<Query> {
        self.map.values().map(|request| request.query()).collect()
    }

    pub(crate) fn into_requests(self) -> Vec<Box<dyn AnyRequest>> {
        self.map.into_values().collect()
    }
}

impl std::fmt::Debug for RequestMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.queries()).finish()
    }
}
