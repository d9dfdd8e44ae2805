use thiserror::Error;

use crate::core::{AnyId, ArcStr};
use crate::engine::{Env, Query};

pub use anyhow::Error as SourceError;

/// Reasons a run can fail.
///
/// Every variant carries a snapshot of the [`Env`] taken at the moment of
/// failure, so the rounds completed so far remain available for diagnosis.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Identity {id} not found in source '{}'", .query.source)]
    MissingIdentity { id: AnyId, query: Query, env: Env },

    #[error("Source '{source_name}' is missing {} identities: {ids:?}", .ids.len())]
    MissingIdentities {
        source_name: ArcStr,
        ids: Vec<AnyId>,
        env: Env,
    },

    #[error("Unhandled exception:\n{cause:#}")]
    UnhandledException { cause: SourceError, env: Env },
}

impl FetchError {
    /// The environment captured when the run failed.
    pub fn env(&self) -> &Env {
        match self {
            FetchError::MissingIdentity { env, .. } => env,
            FetchError::MissingIdentities { env, .. } => env,
            FetchError::UnhandledException { env, .. } => env,
        }
    }

    pub(crate) fn unhandled(cause: impl Into<SourceError>, env: Env) -> Self {
        FetchError::UnhandledException {
            cause: cause.into(),
            env,
        }
    }
}

/// Turns a caught panic payload into an error.
pub(crate) fn panic_to_error(panic: Box<dyn std::any::Any + Send>, what: &str) -> SourceError {
    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
        format!("{what} panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("{what} panicked: {s}")
    } else {
        format!("{what} panicked with unknown payload")
    };

    anyhow::anyhow!(msg)
}
