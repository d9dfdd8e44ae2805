use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{AnyId, ArcStr, Completeness, Config, Identity, Value};
use crate::engine::{
    BlockedRequest, Env, FetchStatus, Promise, Query, RequestMap, Results, union,
};
use crate::error::{FetchError, SourceError};
use crate::source::Source;

/// Builds the error of a failed step once the environment is known.
pub type Thrower = Box<dyn FnOnce(Env) -> FetchError + Send>;

/// Outcome of stepping a [`Fetch`] once.
pub enum Step<A> {
    /// The program finished with a value.
    Done(A),
    /// The program needs the requests in the map to be performed, after that
    /// the continuation can be stepped.
    Blocked(RequestMap, Fetch<A>),
    /// The program failed.
    Throw(Thrower),
}

/// A program built from data source queries.
///
/// `Fetch` values describe what to fetch, nothing happens until the program
/// is handed to [`run`](crate::run) or a [`Runner`](crate::Runner). Queries
/// that do not depend on each other should be combined with
/// [`join`](Self::join) or [`join_all`](Self::join_all), so the engine can
/// dispatch them in the same round, merge duplicates and batch requests to
/// the same source.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use rondo::{DataSource, Fetch, InMemoryCache, Source, SourceError};
///
/// struct Lengths;
///
/// impl DataSource<String, usize> for Lengths {
///     fn name(&self) -> &str {
///         "lengths"
///     }
///
///     fn fetch(&self, id: &String) -> Result<Option<usize>, SourceError> {
///         Ok(Some(id.len()))
///     }
/// }
///
/// let source: Source<String, usize> = Arc::new(Lengths);
///
/// let program = Fetch::one("hello".to_string(), &source)
///     .join(Fetch::one("hi".to_string(), &source))
///     .map(|(a, b)| a + b);
///
/// assert_eq!(rondo::run(program, InMemoryCache::empty()).unwrap(), 7);
/// ```
pub struct Fetch<A> {
    step: Box<dyn FnOnce(&Config) -> Step<A> + Send>,
}

impl<A: Send + 'static> Fetch<A> {
    pub fn new(step: impl FnOnce(&Config) -> Step<A> + Send + 'static) -> Self {
        Self {
            step: Box::new(step),
        }
    }

    /// Advances the program until it finishes, fails or blocks.
    pub fn step(self, config: &Config) -> Step<A> {
        (self.step)(config)
    }

    /// A program that finishes with `value` without fetching anything.
    pub fn pure(value: A) -> Self {
        Fetch::new(move |_| Step::Done(value))
    }

    /// A program failing with an arbitrary [`FetchError`].
    pub fn exception(build: impl FnOnce(Env) -> FetchError + Send + 'static) -> Self {
        Fetch::new(move |_| Step::Throw(Box::new(build)))
    }

    /// A program failing with [`FetchError::UnhandledException`].
    pub fn error(cause: impl Into<SourceError>) -> Self {
        let cause = cause.into();
        Fetch::exception(move |env| FetchError::unhandled(cause, env))
    }

    pub fn map<B: Send + 'static>(self, f: impl FnOnce(A) -> B + Send + 'static) -> Fetch<B> {
        Fetch::new(move |config| match self.step(config) {
            Step::Done(a) => Step::Done(f(a)),
            Step::Blocked(requests, cont) => Step::Blocked(requests, cont.map(f)),
            Step::Throw(e) => Step::Throw(e),
        })
    }

    /// Sequential composition, `f` sees the value of `self` and decides what
    /// to fetch next. Stops at the first failure.
    pub fn and_then<B: Send + 'static>(
        self,
        f: impl FnOnce(A) -> Fetch<B> + Send + 'static,
    ) -> Fetch<B> {
        Fetch::new(move |config| match self.step(config) {
            Step::Done(a) => f(a).step(config),
            Step::Blocked(requests, cont) => Step::Blocked(requests, cont.and_then(f)),
            Step::Throw(e) => Step::Throw(e),
        })
    }

    /// Parallel composition, both sides are stepped together and their
    /// requests share rounds.
    ///
    /// Fails if either side fails, when both fail in the same step the error
    /// of `self` wins.
    pub fn join<B: Send + 'static>(self, other: Fetch<B>) -> Fetch<(A, B)> {
        Fetch::new(move |config| {
            let left = self.step(config);
            let right = other.step(config);

            match (left, right) {
                (Step::Throw(e), _) => Step::Throw(e),
                (_, Step::Throw(e)) => Step::Throw(e),
                (Step::Done(a), Step::Done(b)) => Step::Done((a, b)),
                (Step::Done(a), Step::Blocked(requests, cont)) => {
                    Step::Blocked(requests, Fetch::pure(a).join(cont))
                }
                (Step::Blocked(requests, cont), Step::Done(b)) => {
                    Step::Blocked(requests, cont.join(Fetch::pure(b)))
                }
                (Step::Blocked(x, cx), Step::Blocked(y, cy)) => {
                    Step::Blocked(x.combine(y), cx.join(cy))
                }
            }
        })
    }
}

/// A child of [`Fetch::join_all`], either finished or still running.
enum Slot<A> {
    Ready(A),
    Running(Fetch<A>),
}

impl<A: Send + 'static> Fetch<Vec<A>> {
    /// Runs every program in parallel, collecting values in input order.
    ///
    /// Children are stepped one after another in a loop and their requests
    /// folded into one map, so the size of the list never adds to the depth
    /// of the stack. When several children fail in the same step the
    /// left-most error wins.
    pub fn join_all(fetches: impl IntoIterator<Item = Fetch<A>>) -> Self {
        Self::gather(fetches.into_iter().map(Slot::Running).collect())
    }

    /// Maps every item to a program and runs them all in parallel.
    pub fn traverse<T>(items: impl IntoIterator<Item = T>, f: impl FnMut(T) -> Fetch<A>) -> Self {
        Fetch::join_all(items.into_iter().map(f))
    }

    fn gather(slots: Vec<Slot<A>>) -> Self {
        Fetch::new(move |config| {
            let mut requests = RequestMap::default();
            let mut blocked = false;
            let mut next = Vec::with_capacity(slots.len());

            for slot in slots {
                let fetch = match slot {
                    Slot::Ready(value) => {
                        next.push(Slot::Ready(value));
                        continue;
                    }
                    Slot::Running(fetch) => fetch,
                };

                match fetch.step(config) {
                    Step::Done(value) => next.push(Slot::Ready(value)),
                    Step::Blocked(more, cont) => {
                        requests = requests.combine(more);
                        blocked = true;
                        next.push(Slot::Running(cont));
                    }
                    Step::Throw(e) => return Step::Throw(e),
                }
            }

            if blocked {
                return Step::Blocked(requests, Self::gather(next));
            }

            let values = next
                .into_iter()
                .filter_map(|slot| match slot {
                    Slot::Ready(value) => Some(value),
                    Slot::Running(_) => None,
                })
                .collect();

            Step::Done(values)
        })
    }
}

impl<A: Value> Fetch<A> {
    /// Fetches one item, failing with [`FetchError::MissingIdentity`] when
    /// the source does not have it.
    pub fn one<I: Identity>(id: I, source: &Source<I, A>) -> Self {
        let query = Query::one(source.name(), &id);

        Fetch::optional(id.clone(), source).and_then(move |found| match found {
            Some(value) => Fetch::pure(value),
            None => Fetch::exception(move |env| FetchError::MissingIdentity {
                id: AnyId::new(id),
                query,
                env,
            }),
        })
    }
}

impl<A: Value> Fetch<Option<A>> {
    /// Fetches one item, `None` when the source does not have it.
    pub fn optional<I: Identity>(id: I, source: &Source<I, A>) -> Self {
        let source = source.clone();

        Fetch::new(move |_| {
            let promise = Promise::new();
            let query = Query::one(source.name(), &id);
            let request = BlockedRequest::one(source, id, promise.sink());

            Step::Blocked(
                RequestMap::single(request),
                Fetch::new(move |_| match promise.take() {
                    Some(FetchStatus::Done(value)) => Step::Done(Some(value)),
                    Some(FetchStatus::Missing) => Step::Done(None),
                    None => Step::Throw(unresolved(query)),
                }),
            )
        })
    }
}

impl<I: Identity, A: Value> Fetch<HashMap<I, A>> {
    /// Fetches many items from one source in a single request.
    ///
    /// Duplicate ids are ignored. What happens to ids the source does not
    /// have depends on [`Config::completeness`]: by default they are just
    /// absent from the map, with [`Completeness::Strict`] the run fails with
    /// [`FetchError::MissingIdentities`].
    pub fn many(ids: impl IntoIterator<Item = I>, source: &Source<I, A>) -> Self {
        batch(union(Vec::new(), ids.into_iter().collect()), source, None)
    }
}

impl<A: Value> Fetch<Vec<A>> {
    /// Fetches many items from one source in a single request, returning
    /// them in the order of `ids`. Fails with
    /// [`FetchError::MissingIdentities`] if any of them is missing.
    pub fn all<I: Identity>(ids: impl IntoIterator<Item = I>, source: &Source<I, A>) -> Self {
        let ids: Vec<I> = ids.into_iter().collect();
        let unique = union(Vec::new(), ids.clone());

        batch(unique, source, Some(Completeness::Strict))
            .map(move |found| ids.iter().filter_map(|id| found.get(id).cloned()).collect())
    }
}

/// Shared implementation of [`Fetch::many`] and [`Fetch::all`], `ids` must
/// already be unique. A `policy` overrides the one from the run config.
fn batch<I: Identity, A: Value>(
    ids: Vec<I>,
    source: &Source<I, A>,
    policy: Option<Completeness>,
) -> Fetch<HashMap<I, A>> {
    if ids.is_empty() {
        return Fetch::pure(HashMap::new());
    }

    let source = source.clone();

    Fetch::new(move |_| {
        let promise = Promise::<FetchStatus<Results<I, A>>>::new();
        let query = Query::batch(source.name(), &ids);
        let name: ArcStr = source.name().into();
        let request = BlockedRequest::batch(source, ids.clone(), promise.sink());

        Step::Blocked(
            RequestMap::single(request),
            Fetch::new(move |config| {
                let results = match promise.take() {
                    Some(FetchStatus::Done(results)) => results,
                    Some(FetchStatus::Missing) => Arc::new(HashMap::new()),
                    None => return Step::Throw(unresolved(query)),
                };

                // a merged request may have brought more ids than we asked for
                let mut found = HashMap::with_capacity(ids.len());
                let mut missing = Vec::new();
                for id in ids {
                    match results.get(&id) {
                        Some(value) => {
                            found.insert(id, value.clone());
                        }
                        None => missing.push(AnyId::new(id)),
                    }
                }

                let policy = policy.unwrap_or(config.completeness);
                if missing.is_empty() || policy == Completeness::Lenient {
                    return Step::Done(found);
                }

                Step::Throw(Box::new(move |env| FetchError::MissingIdentities {
                    source_name: name,
                    ids: missing,
                    env,
                }))
            }),
        )
    })
}

fn unresolved(query: Query) -> Thrower {
    Box::new(move |env| {
        let cause = anyhow::anyhow!("Request to source '{}' was never resolved", query.source);
        FetchError::unhandled(cause, env)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::InMemoryCache;
    use crate::engine::Runner;
    use crate::source::DataSource;

    /// Knows every even number, returns its half.
    #[derive(Default)]
    struct Halves {
        batches: AtomicUsize,
    }

    impl DataSource<u32, u32> for Halves {
        fn name(&self) -> &str {
            "halves"
        }

        fn fetch(&self, id: &u32) -> Result<Option<u32>, SourceError> {
            Ok((id % 2 == 0).then_some(id / 2))
        }

        fn batch(&self, ids: &[u32]) -> Result<HashMap<u32, u32>, SourceError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(ids
                .iter()
                .filter(|id| *id % 2 == 0)
                .map(|id| (*id, id / 2))
                .collect())
        }
    }

    fn halves() -> (Arc<Halves>, Source<u32, u32>) {
        let inner = Arc::new(Halves::default());
        let source: Source<u32, u32> = inner.clone();
        (inner, source)
    }

    fn blocked<A: Send + 'static>(fetch: Fetch<A>) -> (RequestMap, Fetch<A>) {
        match fetch.step(&Config::default()) {
            Step::Blocked(requests, cont) => (requests, cont),
            _ => panic!("expected the fetch to block"),
        }
    }

    #[test]
    fn test_join_merges_requests() {
        let (_, source) = halves();

        let (requests, _) = blocked(Fetch::one(2, &source).join(Fetch::one(4, &source)));

        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests.queries()[0].kind,
            crate::engine::QueryKind::Batch(vec![AnyId::new(2u32), AnyId::new(4u32)])
        );
    }

    #[test]
    fn test_join_left_error_wins() {
        let fetch = Fetch::<u8>::error(anyhow::anyhow!("left"))
            .join(Fetch::<u8>::error(anyhow::anyhow!("right")));

        let err = Runner::new().run(fetch, InMemoryCache::empty()).unwrap_err();
        assert!(err.to_string().contains("left"));
    }

    #[test]
    fn test_join_blocked_and_error_fails() {
        let (halves, source) = halves();

        let fetch = Fetch::one(2, &source).join(Fetch::<u8>::error(anyhow::anyhow!("nope")));
        let err = Runner::new().run(fetch, InMemoryCache::empty()).unwrap_err();

        assert!(err.to_string().contains("nope"));
        assert!(err.env().rounds().is_empty());
        assert_eq!(halves.batches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_many_empty_resolves_immediately() {
        let (_, source) = halves();

        match Fetch::many(Vec::new(), &source).step(&Config::default()) {
            Step::Done(found) => assert!(found.is_empty()),
            _ => panic!("expected an immediate result"),
        }
    }

    #[test]
    fn test_many_deduplicates_input() {
        let (_, source) = halves();

        let (requests, _) = blocked(Fetch::many([6, 2, 6, 2], &source));
        assert_eq!(requests.queries()[0].ids(), [AnyId::new(6u32), AnyId::new(2u32)]);
    }

    #[test]
    fn test_many_lenient_and_strict() {
        let (_, source) = halves();

        let found = Runner::new()
            .run(Fetch::many([1, 2, 3, 4], &source), InMemoryCache::empty())
            .unwrap();
        assert_eq!(found, HashMap::from([(2, 1), (4, 2)]));

        let err = Runner::new()
            .completeness(Completeness::Strict)
            .run(Fetch::many([1, 2, 3, 4], &source), InMemoryCache::empty())
            .unwrap_err();
        match err {
            FetchError::MissingIdentities { source_name, ids, .. } => {
                assert_eq!(&*source_name, "halves");
                assert_eq!(ids, vec![AnyId::new(1u32), AnyId::new(3u32)]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_all_keeps_input_order() {
        let (_, source) = halves();

        let values = Runner::new()
            .run(Fetch::all([8, 2, 8, 4], &source), InMemoryCache::empty())
            .unwrap();
        assert_eq!(values, vec![4, 1, 4, 2]);

        let err = Runner::new()
            .run(Fetch::all([2, 5], &source), InMemoryCache::empty())
            .unwrap_err();
        assert!(matches!(err, FetchError::MissingIdentities { .. }));
    }

    #[test]
    fn test_batch_waiter_sees_only_its_ids() {
        let (halves, source) = halves();

        let fetch = Fetch::many([2, 4], &source).join(Fetch::many([4, 6], &source));
        let (left, right) = Runner::new().run(fetch, InMemoryCache::empty()).unwrap();

        assert_eq!(left, HashMap::from([(2, 1), (4, 2)]));
        assert_eq!(right, HashMap::from([(4, 2), (6, 3)]));
        assert_eq!(halves.batches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_optional() {
        let (_, source) = halves();

        let fetch = Fetch::optional(3, &source).join(Fetch::optional(10, &source));
        let values = Runner::new().run(fetch, InMemoryCache::empty()).unwrap();

        assert_eq!(values, (None, Some(5)));
    }

    #[test]
    fn test_join_all_empty() {
        match Fetch::<Vec<u8>>::join_all(Vec::new()).step(&Config::default()) {
            Step::Done(values) => assert!(values.is_empty()),
            _ => panic!("expected an immediate result"),
        }
    }

    #[test]
    fn test_join_all_of_pure_programs_is_flat() {
        let fetch = Fetch::traverse(0..100_000u32, |i| Fetch::pure(i).map(|i| i * 2));

        match fetch.step(&Config::default()) {
            Step::Done(values) => {
                assert_eq!(values.len(), 100_000);
                assert_eq!(values[99_999], 199_998);
            }
            _ => panic!("expected an immediate result"),
        }
    }

    #[test]
    fn test_join_all_mixes_ready_and_blocked() {
        let (halves, source) = halves();

        let fetches = vec![
            Fetch::pure(100),
            Fetch::one(4, &source),
            Fetch::pure(200),
            Fetch::one(8, &source),
        ];
        let (requests, _) = blocked(Fetch::join_all(fetches));
        assert_eq!(requests.len(), 1);

        let values = Runner::new()
            .run(
                Fetch::join_all(vec![
                    Fetch::pure(100),
                    Fetch::one(4, &source),
                    Fetch::pure(200),
                    Fetch::one(8, &source),
                ]),
                InMemoryCache::empty(),
            )
            .unwrap();

        assert_eq!(values, vec![100, 2, 200, 4]);
        assert_eq!(halves.batches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_join_all_left_most_error_wins() {
        let (_, source) = halves();

        let fetches = vec![
            Fetch::one(2, &source),
            Fetch::error(anyhow::anyhow!("first")),
            Fetch::error(anyhow::anyhow!("second")),
        ];
        let err = Runner::new()
            .run(Fetch::join_all(fetches), InMemoryCache::empty())
            .unwrap_err();

        assert!(err.to_string().contains("first"));
        assert!(!err.to_string().contains("second"));
    }
}
