use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::core::{Identity, Value};
use crate::error::SourceError;

/// How the chunks of a split batch are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchExecution {
    /// One chunk after another, in partition order.
    #[default]
    Sequential,
    /// All chunks at once.
    Parallel,
}

/// A pluggable integration point that knows how to fetch values of type `A`
/// identified by `I`.
///
/// Implementations are called from worker threads, possibly several at the
/// same time. Any retry or timeout policy belongs in the implementation, the
/// engine treats every returned error as fatal for the run.
///
/// # Example
///
/// ```rust
/// use rondo::{DataSource, SourceError};
///
/// struct Squares;
///
/// impl DataSource<u32, u64> for Squares {
///     fn name(&self) -> &str {
///         "squares"
///     }
///
///     fn fetch(&self, id: &u32) -> Result<Option<u64>, SourceError> {
///         Ok(Some(u64::from(*id) * u64::from(*id)))
///     }
/// }
/// ```
pub trait DataSource<I: Identity, A: Value>: Send + Sync {
    /// Stable identifier, also used as the cache namespace.
    fn name(&self) -> &str;

    /// Fetches a single item, `None` means the item does not exist.
    fn fetch(&self, id: &I) -> Result<Option<A>, SourceError>;

    /// Fetches many items at once. Identities missing from the returned map
    /// are treated as not found.
    ///
    /// The default implementation calls [`fetch`](Self::fetch) for every id
    /// in parallel.
    fn batch(&self, ids: &[I]) -> Result<HashMap<I, A>, SourceError> {
        let found = ids
            .par_iter()
            .map(|id| Ok(self.fetch(id)?.map(|value| (id.clone(), value))))
            .collect::<Result<Vec<_>, SourceError>>()?;

        Ok(found.into_iter().flatten().collect())
    }

    /// Largest number of identities a single [`batch`](Self::batch) call
    /// may receive. `None` means unbounded.
    fn max_batch_size(&self) -> Option<NonZeroUsize> {
        None
    }

    fn batch_execution(&self) -> BatchExecution {
        BatchExecution::Sequential
    }
}

/// Shared handle to a data source, this is what queries are built from.
pub type Source<I, A> = Arc<dyn DataSource<I, A>>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Evens;

    impl DataSource<u32, String> for Evens {
        fn name(&self) -> &str {
            "evens"
        }

        fn fetch(&self, id: &u32) -> Result<Option<String>, SourceError> {
            Ok((id % 2 == 0).then(|| format!("even {id}")))
        }
    }

    struct Broken;

    impl DataSource<u32, String> for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn fetch(&self, id: &u32) -> Result<Option<String>, SourceError> {
            anyhow::bail!("cannot fetch {id}")
        }
    }

    #[test]
    fn test_default_batch_skips_missing() {
        let result = Evens.batch(&[1, 2, 3, 4]).unwrap();

        assert_eq!(result.len(), 2);
        assert_eq!(result[&2], "even 2");
        assert_eq!(result[&4], "even 4");
    }

    #[test]
    fn test_default_batch_propagates_errors() {
        assert!(Broken.batch(&[1, 2]).is_err());
    }

    #[test]
    fn test_default_policy() {
        assert_eq!(Evens.max_batch_size(), None);
        assert_eq!(Evens.batch_execution(), BatchExecution::Sequential);
    }
}
