//! Versioned store: the single source of truth for all ref states
//!
//! The store holds one immutable map from ref id to committed state. All
//! mutation replaces the whole map through a compare-and-set loop on the
//! `Arc` pointer, so no observer can ever see a partial set of changes.
//! Snapshots are `Arc` clones and cost O(1); the map itself is structurally
//! shared, so the replacement built by a commit copies only the paths to
//! the refs it touched.

use crate::pmap::PersistentMap;
use parking_lot::RwLock;
use refstm_core::{RefId, Result, StmError, Version};
use std::any::Any;
use std::sync::Arc;

/// Type-erased committed value of a ref.
///
/// The typed `Ref<T>` API is the only producer and consumer, so downcasts
/// cannot fail in practice; the erased form is what lets refs of different
/// types share one store.
pub(crate) type DynValue = Arc<dyn Any + Send + Sync>;

/// Type-erased validator predicate. Must be pure.
pub(crate) type DynValidator = Arc<dyn Fn(&DynValue) -> bool + Send + Sync>;

/// Committed state of a single ref.
#[derive(Clone)]
pub(crate) struct RefState {
    /// The committed value.
    pub value: DynValue,
    /// Bumped exactly once per commit that touches this ref.
    pub version: Version,
    /// Optional predicate every committed value must satisfy.
    pub validator: Option<DynValidator>,
}

impl std::fmt::Debug for RefState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefState")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl RefState {
    pub fn new(value: DynValue, validator: Option<DynValidator>) -> Self {
        RefState {
            value,
            version: Version::ZERO,
            validator,
        }
    }

    /// Copy of this state carrying `value` at the next version.
    pub fn advanced(&self, value: DynValue) -> Self {
        RefState {
            value,
            version: self.version.next(),
            validator: self.validator.clone(),
        }
    }

    /// Copy of this state carrying `value` at the same version. Used when a
    /// commit touches the same ref twice; the version must still move by
    /// exactly one per commit.
    pub fn replaced(&self, value: DynValue) -> Self {
        RefState {
            value,
            version: self.version,
            validator: self.validator.clone(),
        }
    }

    /// Run the validator, if any, against a candidate value.
    pub fn accepts(&self, candidate: &DynValue) -> bool {
        self.validator.as_ref().map_or(true, |v| v(candidate))
    }
}

/// The immutable world: every ref's committed state, keyed by id.
pub(crate) type StateMap = PersistentMap<RefState>;

/// Holder of the live `StateMap`, swapped as a whole.
///
/// The `RwLock` guards only the `Arc` pointer; it is never held across user
/// code, validation, or notification dispatch.
pub(crate) struct VersionedStore {
    current: RwLock<Arc<StateMap>>,
}

impl VersionedStore {
    pub fn new() -> Self {
        VersionedStore {
            current: RwLock::new(Arc::new(StateMap::new())),
        }
    }

    /// Point-in-time snapshot of the committed world. O(1).
    pub fn snapshot(&self) -> Arc<StateMap> {
        self.current.read().clone()
    }

    /// Committed state of one ref.
    pub fn read(&self, id: RefId) -> Result<RefState> {
        self.snapshot()
            .get(id)
            .cloned()
            .ok_or(StmError::UnknownRef(id))
    }

    /// Number of live refs.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Replace the live map through a compare-and-set loop.
    ///
    /// `update` receives the freshest committed map and returns the
    /// replacement map (or `None` to leave the store untouched) together
    /// with a caller-defined outcome. Under contention from other swaps the
    /// closure is re-run against the new map, so it must be pure.
    pub fn atomic_swap<R>(&self, update: impl Fn(&StateMap) -> (Option<StateMap>, R)) -> R {
        loop {
            let observed = self.snapshot();
            let (next, outcome) = update(&observed);
            let Some(next) = next else {
                return outcome;
            };
            let mut live = self.current.write();
            if Arc::ptr_eq(&live, &observed) {
                *live = Arc::new(next);
                return outcome;
            }
            // Another swap landed in between; rerun against the fresh map.
        }
    }
}
