//! STM coordinator
//!
//! Drives the attempt/retry loop: snapshot, execute the user operation,
//! validate against the live store, and commit through a single atomic map
//! swap. Only conflicts are retried; validator failures, `NotInTransaction`,
//! and user errors surface unchanged.
//!
//! Validation and commit run inside one `atomic_swap` update closure. The
//! closure always sees the freshest committed map (the CAS loop re-runs it
//! when another commit lands first), so "the store moved between validate
//! and commit" is handled below the STM retry loop, exactly once per ref.

use crate::backoff::Backoff;
use crate::context::{self, ActiveTxn, ContextState, SyncSlotGuard};
use crate::handle::Ref;
use crate::notify::WatcherRegistry;
use crate::store::{DynValidator, DynValue, RefState, StateMap, VersionedStore};
use crate::transaction::Transaction;
use refstm_core::{Isolation, RefId, Result, StmConfig, StmError, TxnId};
use std::cell::RefCell;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of one commit pass. `Conflict` is internal control flow and never
/// becomes an error value.
enum CommitOutcome {
    /// Committed; carries each changed ref with its newly committed value,
    /// for watcher dispatch after the swap.
    Committed(Vec<(RefId, DynValue)>),
    /// Another transaction invalidated this attempt; retry from a fresh
    /// snapshot.
    Conflict,
    /// Permanent failure (validator rejection); surfaced without retry.
    Failed(StmError),
}

pub(crate) struct StmShared {
    pub store: VersionedStore,
    pub watchers: WatcherRegistry,
    next_ref_id: AtomicU64,
    next_txn_id: AtomicU64,
    config: StmConfig,
}

impl StmShared {
    /// Remove a ref whose last handle dropped. Unconditional: concurrent
    /// commits treat the missing entry as "this ref no longer exists".
    pub fn release(&self, id: RefId) {
        self.watchers.drop_ref(id);
        self.store.atomic_swap(|map| {
            if map.contains(id) {
                (Some(map.without(id)), ())
            } else {
                (None, ())
            }
        });
    }
}

/// The STM engine: owns the versioned store and coordinates transactions.
///
/// Cloning is cheap and yields another handle to the same engine. Refs are
/// bound to the engine that created them.
///
/// # Example
///
/// ```
/// use refstm_engine::Stm;
///
/// let stm = Stm::new();
/// let balance = stm.new_ref(100i64);
/// let audit = stm.new_ref(0u32);
///
/// stm.run_serializable(|| {
///     let current = balance.get()?;
///     balance.set(current - 30)?;
///     audit.swap(|n| n + 1)?;
///     Ok(())
/// })?;
///
/// assert_eq!(balance.get()?, 70);
/// # Ok::<(), refstm_engine::StmError>(())
/// ```
#[derive(Clone)]
pub struct Stm {
    shared: Arc<StmShared>,
}

impl Stm {
    /// Engine with default configuration (unlimited retries).
    pub fn new() -> Self {
        Self::with_config(StmConfig::default())
    }

    /// Engine with explicit tuning knobs.
    pub fn with_config(config: StmConfig) -> Self {
        Stm {
            shared: Arc::new(StmShared {
                store: VersionedStore::new(),
                watchers: WatcherRegistry::new(),
                next_ref_id: AtomicU64::new(1),
                next_txn_id: AtomicU64::new(1),
                config,
            }),
        }
    }

    fn token(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    fn next_txn_id(&self) -> TxnId {
        TxnId::new(self.shared.next_txn_id.fetch_add(1, Ordering::SeqCst))
    }

    fn install(&self, value: DynValue, validator: Option<DynValidator>) -> RefId {
        let id = RefId::new(self.shared.next_ref_id.fetch_add(1, Ordering::SeqCst));
        self.shared.store.atomic_swap(|map| {
            (
                Some(map.with(id, RefState::new(value.clone(), validator.clone()))),
                (),
            )
        });
        id
    }

    /// Create a new ref holding `initial`.
    pub fn new_ref<T: Clone + Send + Sync + 'static>(&self, initial: T) -> Ref<T> {
        let id = self.install(Arc::new(initial), None);
        Ref::attach(id, Arc::clone(&self.shared))
    }

    /// Create a new ref whose committed values must satisfy `validator`.
    ///
    /// The initial value is checked too; rejection fails with
    /// `ValidationFailed` and creates nothing.
    pub fn new_ref_with_validator<T: Clone + Send + Sync + 'static>(
        &self,
        initial: T,
        validator: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Result<Ref<T>> {
        let erased: DynValidator = Arc::new(move |value: &DynValue| {
            value.downcast_ref::<T>().map(&validator).unwrap_or(false)
        });
        let value: DynValue = Arc::new(initial);
        let id = RefId::new(self.shared.next_ref_id.fetch_add(1, Ordering::SeqCst));
        if !erased(&value) {
            return Err(StmError::ValidationFailed(id));
        }
        self.shared.store.atomic_swap(|map| {
            (
                Some(map.with(id, RefState::new(value.clone(), Some(erased.clone())))),
                (),
            )
        });
        Ok(Ref::attach(id, Arc::clone(&self.shared)))
    }

    /// Number of live refs. Diagnostics only.
    pub fn ref_count(&self) -> usize {
        self.shared.store.len()
    }

    /// Run `op` transactionally under snapshot isolation: only writes and
    /// commutes are validated at commit.
    pub fn run_snapshot<T>(&self, op: impl FnMut() -> Result<T>) -> Result<T> {
        self.run(Isolation::Snapshot, op)
    }

    /// Run `op` transactionally under serializable isolation: reads are
    /// validated too.
    pub fn run_serializable<T>(&self, op: impl FnMut() -> Result<T>) -> Result<T> {
        self.run(Isolation::Serializable, op)
    }

    /// Attempt/retry loop for synchronous operations.
    ///
    /// `op` may run several times under contention; it must be free of
    /// external side effects. A call made while a transaction from this
    /// engine is already active on the context joins that transaction (the
    /// `isolation` argument of the nested call is ignored).
    pub fn run<T>(&self, isolation: Isolation, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        match context::state_for(self.token()) {
            ContextState::OwnedBySelf => return op(),
            ContextState::OwnedByOther => {
                return Err(StmError::invalid_operation(
                    "a transaction from a different engine is active on this context",
                ))
            }
            ContextState::Free => {}
        }

        let mut backoff = Backoff::new();
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            let txn = Transaction::new(self.next_txn_id(), isolation, self.shared.store.snapshot());
            let txn_id = txn.txn_id;

            let guard = SyncSlotGuard::install(ActiveTxn {
                engine_token: self.token(),
                txn,
            });
            let body = op();
            // The guard clears the slot in every branch, panics included.
            let Some(active) = guard.finish() else {
                return Err(StmError::invalid_operation(
                    "active transaction slot was cleared during the attempt",
                ));
            };

            let value = body?;

            match self.commit(&active.txn) {
                CommitOutcome::Committed(changed) => {
                    tracing::trace!(
                        txn_id = txn_id.as_u64(),
                        attempts,
                        refs_changed = changed.len(),
                        "transaction committed"
                    );
                    self.publish(changed);
                    return Ok(value);
                }
                CommitOutcome::Conflict => {
                    tracing::debug!(
                        txn_id = txn_id.as_u64(),
                        attempt = attempts,
                        "commit conflict; retrying from a fresh snapshot"
                    );
                    if let Some(limit) = self.shared.config.max_retries {
                        if attempts >= limit {
                            return Err(StmError::RetryLimitExceeded { attempts });
                        }
                    }
                    backoff.snooze();
                }
                CommitOutcome::Failed(err) => return Err(err),
            }
        }
    }

    /// Run an asynchronous operation under snapshot isolation.
    pub async fn run_snapshot_async<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_async(Isolation::Snapshot, op).await
    }

    /// Run an asynchronous operation under serializable isolation.
    pub async fn run_serializable_async<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_async(Isolation::Serializable, op).await
    }

    /// Attempt/retry loop for asynchronous operations.
    ///
    /// The future produced by `op` is awaited to completion before
    /// validation, and `op` is invoked afresh for every retry, so the whole
    /// body re-runs under contention; keep it free of external effects.
    /// Dropping the returned future cancels the attempt and commits nothing.
    pub async fn run_async<T, F, Fut>(&self, isolation: Isolation, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match context::state_for(self.token()) {
            ContextState::OwnedBySelf => return op().await,
            ContextState::OwnedByOther => {
                return Err(StmError::invalid_operation(
                    "a transaction from a different engine is active on this context",
                ))
            }
            ContextState::Free => {}
        }

        let mut backoff = Backoff::new();
        let mut attempts = 0usize;
        loop {
            attempts += 1;
            let txn = Transaction::new(self.next_txn_id(), isolation, self.shared.store.snapshot());
            let txn_id = txn.txn_id;
            let active = ActiveTxn {
                engine_token: self.token(),
                txn,
            };

            // Scope the transaction to this task so ref operations inside
            // the body find it across await points, then pull it back out
            // for validation once the body has completed.
            let (body, taken) = context::ASYNC_SLOT
                .scope(RefCell::new(Some(active)), async {
                    let body = op().await;
                    let taken = context::ASYNC_SLOT.with(|slot| slot.borrow_mut().take());
                    (body, taken)
                })
                .await;

            let Some(active) = taken else {
                return Err(StmError::invalid_operation(
                    "active transaction slot was cleared during the attempt",
                ));
            };

            let value = body?;

            match self.commit(&active.txn) {
                CommitOutcome::Committed(changed) => {
                    tracing::trace!(
                        txn_id = txn_id.as_u64(),
                        attempts,
                        refs_changed = changed.len(),
                        "transaction committed"
                    );
                    self.publish(changed);
                    return Ok(value);
                }
                CommitOutcome::Conflict => {
                    tracing::debug!(
                        txn_id = txn_id.as_u64(),
                        attempt = attempts,
                        "commit conflict; retrying from a fresh snapshot"
                    );
                    if let Some(limit) = self.shared.config.max_retries {
                        if attempts >= limit {
                            return Err(StmError::RetryLimitExceeded { attempts });
                        }
                    }
                    backoff.snooze_async().await;
                }
                CommitOutcome::Failed(err) => return Err(err),
            }
        }
    }

    /// Validate the transaction against the live store and, if clean, stage
    /// all of its effects into one replacement map.
    ///
    /// Runs inside `atomic_swap`, so the closure may execute several times
    /// against successively fresher maps; it reads only `txn` and the map it
    /// is handed, never partial results of earlier invocations.
    fn commit(&self, txn: &Transaction) -> CommitOutcome {
        // Pure reads commit with zero store interaction.
        if txn.is_read_only() {
            return CommitOutcome::Committed(Vec::new());
        }

        self.shared.store.atomic_swap(|live| {
            // Serializable only: every ref read during the attempt must
            // still be at the version the snapshot saw. A ref that vanished
            // can never change again, so it cannot invalidate the reads.
            if txn.isolation == Isolation::Serializable {
                for id in &txn.read_set {
                    let Some(seen) = txn.baseline_version(*id) else {
                        continue;
                    };
                    if let Some(state) = live.get(*id) {
                        if state.version != seen {
                            return (None, CommitOutcome::Conflict);
                        }
                    }
                }
            }

            let mut next: StateMap = live.clone();
            // Ids already advanced in this commit: the version moves by
            // exactly one per ref per commit, no matter how many staged
            // operations touch it.
            let mut advanced: Vec<RefId> = Vec::new();

            for (id, staged) in &txn.writes {
                let committed = {
                    let Some(current) = next.get(*id) else {
                        tracing::warn!(ref_id = id.as_u64(), "skipping write to a released ref");
                        continue;
                    };
                    if Some(current.version) != txn.baseline_version(*id) {
                        return (None, CommitOutcome::Conflict);
                    }
                    if !current.accepts(staged) {
                        return (None, CommitOutcome::Failed(StmError::ValidationFailed(*id)));
                    }
                    current.advanced(staged.clone())
                };
                next = next.with(*id, committed);
                advanced.push(*id);
            }

            // Commutes re-run against the live value, in issue order: the
            // function sees whatever was committed in the meantime, not the
            // snapshot the transaction started from.
            for (id, f) in &txn.commute_ops {
                let first_touch = !advanced.contains(id);
                let committed = {
                    let Some(current) = next.get(*id) else {
                        tracing::warn!(ref_id = id.as_u64(), "skipping commute on a released ref");
                        continue;
                    };
                    let mapped = f(&current.value);
                    if !current.accepts(&mapped) {
                        return (None, CommitOutcome::Failed(StmError::ValidationFailed(*id)));
                    }
                    if first_touch {
                        current.advanced(mapped)
                    } else {
                        current.replaced(mapped)
                    }
                };
                next = next.with(*id, committed);
                if first_touch {
                    advanced.push(*id);
                }
            }

            let changed = advanced
                .iter()
                .filter_map(|id| next.get(*id).map(|state| (*id, state.value.clone())))
                .collect();
            (Some(next), CommitOutcome::Committed(changed))
        })
    }

    /// Deliver change notifications after the swap, outside any critical
    /// section, so callbacks may start transactions of their own.
    fn publish(&self, changed: Vec<(RefId, DynValue)>) {
        for (id, value) in changed {
            self.shared.watchers.dispatch(id, &value);
        }
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

/// Id of the transaction active on the current execution context.
///
/// Diagnostics only; fails with `NotInTransaction` when no transaction is
/// running here.
pub fn current_transaction_id() -> Result<TxnId> {
    context::active_txn_id().ok_or(StmError::NotInTransaction)
}
