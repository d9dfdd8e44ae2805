use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{AnyId, ArcStr, Dynamic, Identity, Value};

/// Cache key, a source name paired with an identity from that source.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: ArcStr,
    pub id: AnyId,
}

impl CacheKey {
    pub fn new<I: Identity>(source: &str, id: I) -> Self {
        Self {
            source: source.into(),
            id: AnyId::new(id),
        }
    }
}

/// Storage for previously fetched values.
///
/// A cache is an immutable value, inserting produces a new cache and leaves
/// the old one untouched. During a run the engine keeps the current cache
/// behind a lock and swaps it after every write-back. A miss is always the
/// absence of an entry, "not found" results are never stored.
pub trait DataSourceCache: Send + Sync + 'static {
    fn lookup(&self, key: &CacheKey) -> Option<Dynamic>;

    fn insert(&self, key: CacheKey, value: Dynamic) -> Self
    where
        Self: Sized;

    fn insert_many(&self, entries: Vec<(CacheKey, Dynamic)>) -> Self
    where
        Self: Sized + Clone,
    {
        entries
            .into_iter()
            .fold(self.clone(), |cache, (key, value)| cache.insert(key, value))
    }
}

/// Typed helpers available on every [`DataSourceCache`].
pub trait CacheExt: DataSourceCache + Sized {
    /// Looks up a typed value. An entry holding another type reads as a miss.
    fn get<I: Identity, A: Value>(&self, source: &str, id: &I) -> Option<A> {
        self.lookup(&CacheKey::new(source, id.clone()))
            .and_then(|value| value.downcast_ref::<A>().cloned())
    }

    /// Returns a new cache with one more typed entry.
    fn with<I: Identity, A: Value>(&self, source: &str, id: I, value: A) -> Self {
        self.insert(CacheKey::new(source, id), Arc::new(value))
    }
}

impl<C: DataSourceCache> CacheExt for C {}

/// The default cache, an in-memory map keyed by `(source name, identity)`.
#[derive(Clone, Default)]
pub struct InMemoryCache {
    state: Arc<HashMap<CacheKey, Dynamic>>,
}

impl InMemoryCache {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.state.contains_key(key)
    }

    /// Union of two caches, entries of `other` win on conflict.
    pub fn merge(&self, other: &InMemoryCache) -> Self {
        let mut state = HashMap::clone(&self.state);
        state.extend(other.state.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self {
            state: Arc::new(state),
        }
    }
}

impl DataSourceCache for InMemoryCache {
    fn lookup(&self, key: &CacheKey) -> Option<Dynamic> {
        self.state.get(key).cloned()
    }

    fn insert(&self, key: CacheKey, value: Dynamic) -> Self {
        self.insert_many(vec![(key, value)])
    }

    fn insert_many(&self, entries: Vec<(CacheKey, Dynamic)>) -> Self {
        let mut state = HashMap::clone(&self.state);
        state.extend(entries);
        Self {
            state: Arc::new(state),
        }
    }
}

impl std::fmt::Debug for InMemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.state.keys()).finish()
    }
}
