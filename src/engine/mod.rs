mod diagnostics;
mod promise;
mod request;
mod request_map;
mod round;
mod runner;

pub use crate::engine::diagnostics::{Env, EnvReport, Request, RequestReport, Round, RoundReport};
pub use crate::engine::request::{FetchStatus, Query, QueryKind};
pub use crate::engine::request_map::RequestMap;
pub use crate::engine::runner::Runner;

pub(crate) use crate::engine::promise::Promise;
pub(crate) use crate::engine::request::{BlockedRequest, Results, union};
