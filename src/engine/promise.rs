use std::sync::{Arc, OnceLock};

/// One-shot callback that resolves a waiter.
pub(crate) type Sink<T> = Box<dyn FnOnce(T) + Send>;

/// Write-once completion handle.
///
/// The producing side gets a [`Sink`] which may be called at most once, the
/// waiting side reads the value after the round barrier.
pub(crate) struct Promise<T> {
    cell: Arc<OnceLock<T>>,
}

impl<T> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub(crate) fn new() -> Self {
        Self {
            cell: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn sink(&self) -> Sink<T> {
        let cell = self.cell.clone();
        Box::new(move |value| {
            // second writes are ignored, the first resolution wins
            let _ = cell.set(value);
        })
    }

    /// Takes the resolved value, `None` if the sink was never called.
    pub(crate) fn take(self) -> Option<T> {
        match Arc::try_unwrap(self.cell) {
            Ok(cell) => cell.into_inner(),
            Err(shared) => shared.get().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_once() {
        let promise = Promise::new();
        let sink = promise.sink();
        sink(5);

        assert_eq!(promise.take(), Some(5));
    }

    #[test]
    fn test_first_write_wins() {
        let promise = Promise::new();
        let a = promise.sink();
        let b = promise.sink();
        a("first");
        b("second");

        assert_eq!(promise.take(), Some("first"));
    }

    #[test]
    fn test_unresolved() {
        let promise = Promise::<u8>::new();
        let _sink = promise.sink();

        assert_eq!(promise.take(), None);
    }
}
