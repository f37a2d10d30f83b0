//! Typed ref handles
//!
//! `Ref<T>` is the public face of a transactional cell: typed, cheap to
//! clone, and bound to the engine that created it. All staging and commit
//! machinery below it is type-erased; the handle is where values are
//! downcast back to `T`.
//!
//! Dropping the last handle for a ref removes it from the engine
//! deterministically. Transactions that raced the removal skip the ref at
//! commit instead of failing.

use crate::context;
use crate::notify::WatchFn;
use crate::runtime::StmShared;
use crate::store::DynValue;
use crate::transaction::{CommuteFn, Transaction};
use refstm_core::{RefId, Result, StmError, WatchToken};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// Shared ownership core of a ref. The last `Anchor` drop releases the ref
/// from the engine's store and watcher registry.
struct Anchor {
    id: RefId,
    shared: Arc<StmShared>,
}

impl Drop for Anchor {
    fn drop(&mut self) {
        self.shared.release(self.id);
    }
}

/// A transactional cell holding a value of type `T`.
///
/// Reads outside a transaction return the latest committed value. Writes,
/// swaps, and commutes require an active transaction on the current
/// execution context and stage their effects until that transaction
/// commits.
///
/// Clones are handles to the same cell. Equality compares current values,
/// not identity; `Hash` is deliberately not implemented, since the observed
/// value changes between commits.
pub struct Ref<T> {
    anchor: Arc<Anchor>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Ref {
            anchor: Arc::clone(&self.anchor),
            _marker: PhantomData,
        }
    }
}

impl<T> Ref<T> {
    pub(crate) fn attach(id: RefId, shared: Arc<StmShared>) -> Self {
        Ref {
            anchor: Arc::new(Anchor { id, shared }),
            _marker: PhantomData,
        }
    }

    /// Stable identifier of the underlying cell.
    pub fn id(&self) -> RefId {
        self.anchor.id
    }

    fn token(&self) -> usize {
        Arc::as_ptr(&self.anchor.shared) as usize
    }

    /// Run `f` against the transaction active on this context, rejecting
    /// transactions started by a different engine.
    fn with_txn<R>(&self, f: impl FnOnce(Option<&mut Transaction>) -> Result<R>) -> Result<R> {
        let token = self.token();
        context::with_active(|active| match active {
            Some(active) if active.engine_token == token => f(Some(&mut active.txn)),
            Some(_) => Err(StmError::invalid_operation(
                "ref belongs to a different engine than the active transaction",
            )),
            None => f(None),
        })
    }
}

impl<T: Clone + Send + Sync + 'static> Ref<T> {
    fn decode(&self, value: DynValue) -> Result<T> {
        match value.downcast::<T>() {
            Ok(typed) => Ok((*typed).clone()),
            Err(_) => Err(StmError::invalid_operation(format!(
                "value of {} has an unexpected type",
                self.anchor.id
            ))),
        }
    }

    /// Current value of the cell.
    ///
    /// Inside a transaction this is the transaction's view, staged effects
    /// included; outside it is the latest committed value.
    pub fn get(&self) -> Result<T> {
        let id = self.anchor.id;
        let value = self.with_txn(|txn| match txn {
            Some(txn) => txn.read(id),
            None => self.anchor.shared.store.read(id).map(|state| state.value),
        })?;
        self.decode(value)
    }

    /// Stage `value` as this cell's new content. Transaction only.
    pub fn set(&self, value: T) -> Result<()> {
        let id = self.anchor.id;
        self.with_txn(|txn| match txn {
            Some(txn) => txn.write(id, Arc::new(value)),
            None => Err(StmError::NotInTransaction),
        })
    }

    /// Read the in-transaction value, apply `f`, and stage the result as a
    /// plain write. Returns the new value. Transaction only.
    ///
    /// The read enters the read set like any other, so under serializable
    /// isolation a concurrent change to this cell conflicts. `f` runs with
    /// the context slot released, so it may freely touch other refs of the
    /// same transaction.
    pub fn swap(&self, f: impl FnOnce(&T) -> T) -> Result<T> {
        let id = self.anchor.id;
        let current = self.with_txn(|txn| match txn {
            Some(txn) => txn.read(id),
            None => Err(StmError::NotInTransaction),
        })?;
        let current = self.decode(current)?;
        let next = f(&current);
        self.with_txn(|txn| match txn {
            Some(txn) => txn.write(id, Arc::new(next.clone())),
            None => Err(StmError::NotInTransaction),
        })?;
        Ok(next)
    }

    /// Stage a commutative update. Transaction only.
    ///
    /// `f` is applied to the in-transaction value immediately, so later
    /// reads in this transaction observe the result, and re-applied to the
    /// live committed value when the transaction commits. Because of the
    /// re-application the final committed value may differ from the staged
    /// one; `f` must be pure and order-independent with respect to
    /// concurrent commutes. Commutes do not conflict on this cell. Like
    /// [`Ref::swap`], `f` runs with the context slot released and may touch
    /// other refs.
    pub fn commute(&self, f: impl Fn(&T) -> T + Send + Sync + 'static) -> Result<CommuteHandle<T>> {
        let id = self.anchor.id;
        let erased: CommuteFn = Arc::new(move |value: &DynValue| match value.downcast_ref::<T>() {
            Some(typed) => Arc::new(f(typed)) as DynValue,
            None => value.clone(),
        });
        let base = self.with_txn(|txn| match txn {
            Some(txn) => txn.commute_base(id),
            None => Err(StmError::NotInTransaction),
        })?;
        let mapped = erased(&base);
        self.with_txn(|txn| match txn {
            Some(txn) => txn.stage_commute(id, mapped.clone(), Arc::clone(&erased)),
            None => Err(StmError::NotInTransaction),
        })?;
        let staged = self.decode(mapped)?;
        Ok(CommuteHandle {
            reference: self.clone(),
            staged,
        })
    }

    /// Register `hook` to run once per committed change of this cell, with
    /// the newly committed value. Not transactional: registration takes
    /// effect immediately and survives until `unwatch` or the cell's
    /// release.
    pub fn watch(&self, hook: impl Fn(&T) + Send + Sync + 'static) -> WatchToken {
        let erased: WatchFn = Arc::new(move |value: &DynValue| {
            if let Some(typed) = value.downcast_ref::<T>() {
                hook(typed);
            }
        });
        self.anchor.shared.watchers.register(self.anchor.id, erased)
    }

    /// Remove a callback registered with [`Ref::watch`]. Unknown tokens are
    /// ignored.
    pub fn unwatch(&self, token: WatchToken) {
        self.anchor.shared.watchers.unregister(self.anchor.id, token);
    }
}

impl<T: Clone + Send + Sync + PartialEq + 'static> PartialEq for Ref<T> {
    /// Compares current values; two distinct cells holding equal values are
    /// equal.
    fn eq(&self, other: &Self) -> bool {
        match (self.get(), other.get()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Ref");
        out.field("id", &self.anchor.id);
        match self.get() {
            Ok(value) => out.field("value", &value).finish(),
            Err(_) => out.finish_non_exhaustive(),
        }
    }
}

impl<T: Clone + Send + Sync + fmt::Display + 'static> fmt::Display for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Ok(value) => value.fmt(f),
            Err(_) => write!(f, "<released {}>", self.anchor.id),
        }
    }
}

impl<T: Clone + Send + Sync + fmt::Debug + 'static> fmt::Debug for CommuteHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommuteHandle")
            .field("reference", &self.reference)
            .field("staged", &self.staged)
            .finish()
    }
}

/// Receipt for a staged commute on a `Ref<T>`.
///
/// Holds the value the commute produced against the transaction's view. The
/// committed value may differ once the function re-runs against the live
/// value; [`CommuteHandle::latest`] reads whatever is current now.
pub struct CommuteHandle<T> {
    reference: Ref<T>,
    staged: T,
}

impl<T: Clone + Send + Sync + 'static> CommuteHandle<T> {
    /// The value produced against the transaction's view at staging time.
    pub fn staged(&self) -> &T {
        &self.staged
    }

    /// Current value of the underlying cell: the in-transaction view while
    /// the transaction is still running, the committed result afterwards.
    pub fn latest(&self) -> Result<T> {
        self.reference.get()
    }

    /// Handle to the cell the commute was staged on.
    pub fn cell(&self) -> &Ref<T> {
        &self.reference
    }
}
