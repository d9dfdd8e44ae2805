use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::Level;

use crate::cache::DataSourceCache;
use crate::core::{Completeness, Config};
use crate::engine::diagnostics::Env;
use crate::engine::round::fetch_round;
use crate::error::{FetchError, panic_to_error};
use crate::fetch::{Fetch, Step};

/// Everything a finished run produced.
pub(crate) struct Outcome<A, C> {
    pub value: A,
    pub cache: C,
    pub env: Env,
}

/// Executes [`Fetch`] programs.
///
/// Each iteration steps the program until it blocks, then performs every
/// blocked request in one concurrent round and steps the continuation. The
/// run ends when the program finishes or fails.
///
/// ```rust
/// use rondo::{Completeness, Fetch, InMemoryCache, Runner};
///
/// let runner = Runner::new().trace(false).completeness(Completeness::Strict);
/// let (value, env) = runner
///     .run_with_env(Fetch::pure(3), InMemoryCache::empty())
///     .unwrap();
///
/// assert_eq!(value, 3);
/// assert!(env.rounds().is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Runner {
    config: Config,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        Self { config }
    }

    /// Whether rounds are recorded into the [`Env`].
    pub fn trace(mut self, trace: bool) -> Self {
        self.config.trace = trace;
        self
    }

    /// Policy applied to identities missing from [`Fetch::many`] results.
    pub fn completeness(mut self, completeness: Completeness) -> Self {
        self.config.completeness = completeness;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs the program and returns its value.
    pub fn run<A, C>(&self, fetch: Fetch<A>, cache: C) -> Result<A, FetchError>
    where
        A: Send + 'static,
        C: DataSourceCache + Clone,
    {
        self.perform(fetch, cache).map(|outcome| outcome.value)
    }

    /// Runs the program and returns its value along with the trace of rounds.
    pub fn run_with_env<A, C>(&self, fetch: Fetch<A>, cache: C) -> Result<(A, Env), FetchError>
    where
        A: Send + 'static,
        C: DataSourceCache + Clone,
    {
        self.perform(fetch, cache)
            .map(|outcome| (outcome.value, outcome.env))
    }

    /// Runs the program and returns its value along with the final cache,
    /// which can be handed to a later run.
    pub fn run_with_cache<A, C>(&self, fetch: Fetch<A>, cache: C) -> Result<(A, C), FetchError>
    where
        A: Send + 'static,
        C: DataSourceCache + Clone,
    {
        self.perform(fetch, cache)
            .map(|outcome| (outcome.value, outcome.cache))
    }

    fn perform<A, C>(&self, fetch: Fetch<A>, cache: C) -> Result<Outcome<A, C>, FetchError>
    where
        A: Send + 'static,
        C: DataSourceCache + Clone,
    {
        let config = self.config;
        let cache = Mutex::new(cache);
        let env = Mutex::new(Env::default());

        let span = tracing::span!(Level::INFO, "run");
        let _enter = span.enter();
        let start = Instant::now();

        let mut fetch = fetch;
        let mut round = 0;

        let value = loop {
            match interpret(fetch, &config) {
                Step::Done(value) => break value,
                Step::Blocked(requests, cont) => {
                    round += 1;
                    tracing::debug!(sources = requests.len(), "round {round} blocked on {requests:?}");
                    fetch_round(&config, round, requests, &cache, &env)?;
                    fetch = cont;
                }
                Step::Throw(build) => {
                    let error = build(env.lock().clone());
                    tracing::debug!("run failed after {round} rounds: {error}");
                    return Err(error);
                }
            }
        };

        let env = env.into_inner();
        tracing::info!(
            rounds = env.rounds().len(),
            requests = env.request_count(),
            "Finished fetching in {:?}",
            start.elapsed(),
        );

        Ok(Outcome {
            value,
            cache: cache.into_inner(),
            env,
        })
    }
}

/// Steps the program once, a panic inside user code fails the run.
fn interpret<A: Send + 'static>(fetch: Fetch<A>, config: &Config) -> Step<A> {
    match catch_unwind(AssertUnwindSafe(|| fetch.step(config))) {
        Ok(step) => step,
        Err(panic) => {
            let cause = panic_to_error(panic, "Step");
            Step::Throw(Box::new(move |env| FetchError::unhandled(cause, env)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::{CacheExt, InMemoryCache};
    use crate::error::SourceError;
    use crate::source::{DataSource, Source};

    #[derive(Default)]
    struct Squares {
        fetches: AtomicUsize,
        batches: AtomicUsize,
    }

    impl DataSource<u32, u64> for Squares {
        fn name(&self) -> &str {
            "squares"
        }

        fn fetch(&self, id: &u32) -> Result<Option<u64>, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok((*id < 100).then(|| u64::from(*id) * u64::from(*id)))
        }

        fn batch(&self, ids: &[u32]) -> Result<HashMap<u32, u64>, SourceError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(ids
                .iter()
                .filter(|id| **id < 100)
                .map(|id| (*id, u64::from(*id) * u64::from(*id)))
                .collect())
        }
    }

    fn squares() -> (Arc<Squares>, Source<u32, u64>) {
        let inner = Arc::new(Squares::default());
        let source: Source<u32, u64> = inner.clone();
        (inner, source)
    }

    #[test]
    fn test_pure_needs_no_rounds() {
        let (value, env) = Runner::new()
            .run_with_env(Fetch::pure("done"), InMemoryCache::empty())
            .unwrap();

        assert_eq!(value, "done");
        assert!(env.rounds().is_empty());
    }

    #[test]
    fn test_joined_fetches_share_a_round() {
        let (counter, source) = squares();

        let fetch = Fetch::one(2, &source)
            .join(Fetch::one(3, &source))
            .map(|(a, b)| a + b);
        let (value, env) = Runner::new()
            .run_with_env(fetch, InMemoryCache::empty())
            .unwrap();

        assert_eq!(value, 13);
        assert_eq!(env.rounds().len(), 1);
        assert_eq!(counter.batches.load(Ordering::SeqCst), 1);
        assert_eq!(counter.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_dependent_fetches_take_two_rounds() {
        let (_, source) = squares();

        let next = source.clone();
        let fetch = Fetch::one(3, &source).and_then(move |nine| Fetch::one(nine as u32, &next));
        let (value, env) = Runner::new()
            .run_with_env(fetch, InMemoryCache::empty())
            .unwrap();

        assert_eq!(value, 81);
        assert_eq!(env.rounds().len(), 2);
    }

    #[test]
    fn test_cache_is_returned_and_reused() {
        let (counter, source) = squares();
        let runner = Runner::new();

        let (_, cache) = runner
            .run_with_cache(Fetch::one(4, &source), InMemoryCache::empty())
            .unwrap();
        assert_eq!(cache.get::<u32, u64>("squares", &4), Some(16));

        let (value, env) = runner.run_with_env(Fetch::one(4, &source), cache).unwrap();
        assert_eq!(value, 16);
        assert!(env.rounds().is_empty());
        assert_eq!(counter.fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trace_disabled() {
        let (_, source) = squares();

        let (_, env) = Runner::new()
            .trace(false)
            .run_with_env(Fetch::one(1, &source), InMemoryCache::empty())
            .unwrap();

        assert!(env.rounds().is_empty());
    }

    #[test]
    fn test_missing_identity_carries_env() {
        let (_, source) = squares();

        let err = Runner::new()
            .run(Fetch::one(500, &source), InMemoryCache::empty())
            .unwrap_err();

        match err {
            FetchError::MissingIdentity { id, query, env } => {
                assert!(id.is(&500u32));
                assert_eq!(&*query.source, "squares");
                assert_eq!(env.rounds().len(), 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_panicking_step() {
        let fetch = Fetch::pure(1).map(|_: i32| -> i32 { panic!("bad step") });

        let err = Runner::new()
            .run(fetch, InMemoryCache::empty())
            .unwrap_err();

        assert!(matches!(err, FetchError::UnhandledException { .. }));
        assert!(err.to_string().contains("Step panicked: bad step"));
    }
}
