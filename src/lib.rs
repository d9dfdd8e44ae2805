#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod core;
mod engine;
mod error;
mod fetch;
mod source;
mod utils;

pub use crate::cache::{CacheExt, CacheKey, DataSourceCache, InMemoryCache};
pub use crate::core::{AnyId, ArcStr, Completeness, Config, Dynamic, Identity, Value};
pub use crate::engine::{
    Env, EnvReport, FetchStatus, Query, QueryKind, Request, RequestMap, RequestReport, Round,
    RoundReport, Runner,
};
pub use crate::error::{FetchError, SourceError};
pub use crate::fetch::{Fetch, Step, Thrower};
pub use crate::source::{BatchExecution, DataSource, Source};

#[cfg(feature = "logging")]
pub use crate::utils::init_logging;

/// Runs the program with the default [`Config`] and returns its value.
pub fn run<A, C>(fetch: Fetch<A>, cache: C) -> Result<A, FetchError>
where
    A: Send + 'static,
    C: DataSourceCache + Clone,
{
    Runner::default().run(fetch, cache)
}

/// Runs the program with the default [`Config`], returning the trace of
/// rounds along with the value.
pub fn run_with_env<A, C>(fetch: Fetch<A>, cache: C) -> Result<(A, Env), FetchError>
where
    A: Send + 'static,
    C: DataSourceCache + Clone,
{
    Runner::default().run_with_env(fetch, cache)
}

/// Runs the program with the default [`Config`], returning the final cache
/// along with the value.
pub fn run_with_cache<A, C>(fetch: Fetch<A>, cache: C) -> Result<(A, C), FetchError>
where
    A: Send + 'static,
    C: DataSourceCache + Clone,
{
    Runner::default().run_with_cache(fetch, cache)
}
