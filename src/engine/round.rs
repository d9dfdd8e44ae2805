use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use parking_lot::Mutex;
use rayon::iter::{IntoParallelIterator, IntoParallelRefIterator, ParallelIterator};
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cache::{CacheKey, DataSourceCache};
use crate::core::{Config, Dynamic, Identity, Value};
use crate::engine::diagnostics::{Env, Request, Round};
use crate::engine::promise::Sink;
use crate::engine::request::{BlockedRequest, FetchStatus, Pending, Query, Waiter, notify};
use crate::engine::request_map::RequestMap;
use crate::error::{FetchError, SourceError, panic_to_error};
use crate::source::{BatchExecution, Source};

/// Object-safe handle to the cache shared by every request of a run.
pub(crate) trait CacheCell: Sync {
    fn lookup(&self, key: &CacheKey) -> Option<Dynamic>;

    /// Replaces the current cache with one holding `entries` as well.
    fn insert_many(&self, entries: Vec<(CacheKey, Dynamic)>);
}

impl<C> CacheCell for Mutex<C>
where
    C: DataSourceCache + Clone,
{
    fn lookup(&self, key: &CacheKey) -> Option<Dynamic> {
        self.lock().lookup(key)
    }

    fn insert_many(&self, entries: Vec<(CacheKey, Dynamic)>) {
        if entries.is_empty() {
            return;
        }

        // read and replace under one lock so concurrent writers never lose updates
        let mut cache = self.lock();
        *cache = cache.insert_many(entries);
    }
}

/// Runs every request of a round concurrently and waits for all of them.
///
/// A failing request does not cancel its siblings, the first error is
/// reported only after the whole round settled. When tracing is enabled and
/// at least one source call happened, the calls are appended to `env` as a
/// new [`Round`].
pub(crate) fn fetch_round(
    config: &Config,
    index: usize,
    requests: RequestMap,
    cache: &dyn CacheCell,
    env: &Mutex<Env>,
) -> Result<(), FetchError> {
    if requests.is_empty() {
        return Ok(());
    }

    let span = tracing::span!(Level::INFO, "round", index, sources = requests.len());
    span.pb_set_length(requests.len() as u64);
    if let Ok(style) = crate::utils::get_style_round() {
        span.pb_set_style(&style);
    }
    span.pb_set_message(&format!("Round {index}"));
    let _enter = span.enter();

    let results: Vec<_> = requests
        .into_requests()
        .into_par_iter()
        .map(|request| {
            let performed = request.run(cache);
            span.pb_inc(1);
            performed
        })
        .collect();

    let mut performed = Vec::new();
    let mut failure = None;

    for result in results {
        match result {
            Ok(requests) => performed.extend(requests),
            Err(e) if failure.is_none() => failure = Some(e),
            Err(e) => tracing::warn!("additional failure in round {index}: {e:#}"),
        }
    }

    if let Some(cause) = failure {
        return Err(FetchError::unhandled(cause, env.lock().clone()));
    }

    tracing::debug!(calls = performed.len(), "round {index} settled");

    if config.trace && !performed.is_empty() {
        env.lock().evolve(Round {
            requests: performed,
        });
    }

    Ok(())
}

impl<I: Identity, A: Value> BlockedRequest<I, A> {
    /// Resolves this request from the cache where possible and from the
    /// source otherwise. Returns the source calls that were made.
    pub(crate) fn run(self, cache: &dyn CacheCell) -> Result<Vec<Request>, SourceError> {
        let BlockedRequest { source, pending } = self;

        match pending {
            Pending::One { id, sinks } => run_one(&source, id, sinks, cache),
            Pending::Batch { ids, waiters, .. } => run_batch(&source, ids, waiters, cache),
        }
    }
}

fn lookup<I: Identity, A: Value>(cache: &dyn CacheCell, source: &str, id: &I) -> Option<A> {
    cache
        .lookup(&CacheKey::new(source, id.clone()))
        .and_then(|value| value.downcast_ref::<A>().cloned())
}

/// Calls into the source, turning a panic into an error.
fn guarded<T>(name: &str, f: impl FnOnce() -> Result<T, SourceError>) -> Result<T, SourceError> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|panic| panic_to_error(panic, &format!("Source '{name}'")))?
}

fn run_one<I: Identity, A: Value>(
    source: &Source<I, A>,
    id: I,
    sinks: Vec<Sink<FetchStatus<A>>>,
    cache: &dyn CacheCell,
) -> Result<Vec<Request>, SourceError> {
    let name = source.name();

    if let Some(value) = lookup::<I, A>(cache, name, &id) {
        tracing::debug!("cache hit for {id:?} in '{name}'");
        notify(sinks, FetchStatus::Done(value));
        return Ok(Vec::new());
    }

    tracing::debug!("fetching {id:?} from '{name}'");
    let start = Instant::now();
    let result = guarded(name, || source.fetch(&id))
        .with_context(|| format!("Source '{name}' failed to fetch {id:?}"))?;
    let end = Instant::now();

    let request = Request {
        query: Query::one(name, &id),
        start,
        end,
    };

    match result {
        Some(value) => {
            let entry = Arc::new(value.clone()) as Dynamic;
            cache.insert_many(vec![(CacheKey::new(name, id), entry)]);
            notify(sinks, FetchStatus::Done(value));
        }
        // absence is never cached, a later round may try again
        None => notify(sinks, FetchStatus::Missing),
    }

    Ok(vec![request])
}

fn run_batch<I: Identity, A: Value>(
    source: &Source<I, A>,
    ids: Vec<I>,
    waiters: Vec<Waiter<I, A>>,
    cache: &dyn CacheCell,
) -> Result<Vec<Request>, SourceError> {
    let name = source.name();

    let mut found = HashMap::with_capacity(ids.len());
    let mut uncached = Vec::new();
    for id in ids {
        match lookup::<I, A>(cache, name, &id) {
            Some(value) => {
                found.insert(id, value);
            }
            None => uncached.push(id),
        }
    }

    if uncached.is_empty() {
        tracing::debug!("cache hit for all {} ids in '{name}'", found.len());
        resolve(waiters, found);
        return Ok(Vec::new());
    }

    let partials = match source.max_batch_size() {
        None => vec![batch_call(source, &uncached)?],
        Some(size) => {
            let chunks: Vec<&[I]> = uncached.chunks(size.get()).collect();
            tracing::debug!(
                "splitting {} ids for '{name}' into {} chunks of at most {size}",
                uncached.len(),
                chunks.len(),
            );

            match source.batch_execution() {
                BatchExecution::Sequential => chunks
                    .into_iter()
                    .map(|chunk| batch_call(source, chunk))
                    .collect::<Result<Vec<_>, _>>()?,
                BatchExecution::Parallel => chunks
                    .par_iter()
                    .map(|chunk| batch_call(source, chunk))
                    .collect::<Vec<_>>()
                    .into_iter()
                    .collect::<Result<Vec<_>, _>>()?,
            }
        }
    };

    let mut requests = Vec::with_capacity(partials.len());
    let mut entries = Vec::new();

    for (partial, request) in partials {
        requests.push(request);
        for (id, value) in partial {
            entries.push((CacheKey::new(name, id.clone()), Arc::new(value.clone()) as Dynamic));
            found.insert(id, value);
        }
    }

    cache.insert_many(entries);
    resolve(waiters, found);

    Ok(requests)
}

fn resolve<I: Identity, A: Value>(waiters: Vec<Waiter<I, A>>, found: HashMap<I, A>) {
    let status = FetchStatus::Done(Arc::new(found));
    for waiter in waiters {
        waiter.resolve(&status);
    }
}

/// One `batch` call against the source, timed.
fn batch_call<I: Identity, A: Value>(
    source: &Source<I, A>,
    ids: &[I],
) -> Result<(HashMap<I, A>, Request), SourceError> {
    let name = source.name();

    tracing::debug!("fetching batch of {} ids from '{name}'", ids.len());
    let start = Instant::now();
    let result = guarded(name, || source.batch(ids))
        .with_context(|| format!("Source '{name}' failed to fetch batch {ids:?}"))?;
    let end = Instant::now();

    let request = Request {
        query: Query::batch(name, ids),
        start,
        end,
    };

    Ok((result, request))
}
