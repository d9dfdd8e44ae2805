use std::any::{Any, TypeId};
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A type-erased, thread-safe container.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for source names.
pub type ArcStr = Arc<str>;

/// Anything that can identify a single item inside a data source.
///
/// Blanket implemented, you never need to implement this yourself.
pub trait Identity: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Identity for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Anything that can be returned by a data source.
pub trait Value: Clone + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Send + Sync + 'static {}

trait ErasedId: Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn ErasedId) -> bool;
    fn hash_dyn(&self, state: &mut dyn Hasher);
}

impl<T: Identity> ErasedId for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn ErasedId) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }
}

/// A type-erased identity.
///
/// Used wherever identities of different sources have to live side by side:
/// cache keys, trace entries and errors. Two `AnyId`s are equal only when
/// they wrap the same concrete type and the values compare equal.
#[derive(Clone)]
pub struct AnyId(Arc<dyn ErasedId>);

impl AnyId {
    pub fn new<I: Identity>(id: I) -> Self {
        Self(Arc::new(id))
    }

    /// Recovers the concrete identity, if it has type `I`.
    pub fn downcast_ref<I: Identity>(&self) -> Option<&I> {
        self.0.as_any().downcast_ref::<I>()
    }

    pub fn is<I: Identity>(&self, id: &I) -> bool {
        self.downcast_ref::<I>().is_some_and(|inner| inner == id)
    }
}

impl PartialEq for AnyId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_dyn(other.0.as_ref())
    }
}

impl Eq for AnyId {}

impl Hash for AnyId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_dyn(state);
    }
}

impl Debug for AnyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for AnyId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

/// What a batch waiter should do when some of its identities were not found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Completeness {
    /// Absent identities are simply left out of the result map.
    #[default]
    Lenient,
    /// Any absent identity fails the run with
    /// [`FetchError::MissingIdentities`](crate::FetchError::MissingIdentities).
    Strict,
}

/// Settings shared by every step of a single run.
///
/// # Example
///
/// ```rust
/// use rondo::{Completeness, Config};
///
/// let config = Config::from_json(r#"{ "completeness": "strict" }"#).unwrap();
/// assert!(config.trace);
/// assert_eq!(config.completeness, Completeness::Strict);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Record every round into the [`Env`](crate::Env).
    pub trace: bool,
    /// Policy applied to batch waiters.
    pub completeness: Completeness,
}

impl Config {
    /// Reads a config from JSON, missing fields take their default values.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace: true,
            completeness: Completeness::default(),
        }
    }
}
