//! Execution-context-local tracking of the active transaction
//!
//! One slot per logical thread of control: a `thread_local!` for synchronous
//! transactions and a `tokio::task_local!` for asynchronous ones. Ref
//! operations consult the task-local slot first, then the thread-local one,
//! which is what lets `Ref::get`/`Ref::set` find "the" transaction without
//! explicit handle threading. The task-local slot propagates across `.await`
//! points of its own task only; unrelated concurrent tasks and threads never
//! observe it.

use crate::transaction::Transaction;
use refstm_core::TxnId;
use std::cell::RefCell;

thread_local! {
    static SYNC_SLOT: RefCell<Option<ActiveTxn>> = const { RefCell::new(None) };
}

tokio::task_local! {
    /// Slot scoped around one async attempt by the coordinator.
    pub(crate) static ASYNC_SLOT: RefCell<Option<ActiveTxn>>;
}

/// The transaction bound to this execution context, tagged with the engine
/// that started it so handles from other engines can be rejected.
pub(crate) struct ActiveTxn {
    /// Address of the owning engine's shared state, used as an identity tag.
    pub engine_token: usize,
    pub txn: Transaction,
}

/// Disposition of the current context relative to one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextState {
    /// No transaction active; a new one may be installed.
    Free,
    /// A transaction from the given engine is active; nested calls join it.
    OwnedBySelf,
    /// A transaction from a different engine holds the slot.
    OwnedByOther,
}

/// Run `f` with the active transaction for this context, if any.
pub(crate) fn with_active<R>(f: impl FnOnce(Option<&mut ActiveTxn>) -> R) -> R {
    // Task-local first: a ref operation inside an async transaction body
    // must see the task's transaction, not whatever the polling thread has.
    let task_holds_txn = ASYNC_SLOT
        .try_with(|slot| slot.borrow().is_some())
        .unwrap_or(false);
    if task_holds_txn {
        return ASYNC_SLOT.with(|slot| f(slot.borrow_mut().as_mut()));
    }

    SYNC_SLOT.with(|slot| f(slot.borrow_mut().as_mut()))
}

/// How the current context relates to the engine identified by `token`.
pub(crate) fn state_for(token: usize) -> ContextState {
    with_active(|active| match active {
        None => ContextState::Free,
        Some(active) if active.engine_token == token => ContextState::OwnedBySelf,
        Some(_) => ContextState::OwnedByOther,
    })
}

/// Id of the transaction active on this context, if any.
pub(crate) fn active_txn_id() -> Option<TxnId> {
    with_active(|active| active.map(|a| a.txn.txn_id))
}

/// Holds the thread-local slot for the duration of one synchronous attempt.
///
/// Dropping the guard clears the slot, so the "finally" semantics hold even
/// when the transaction body panics.
pub(crate) struct SyncSlotGuard {
    _private: (),
}

impl SyncSlotGuard {
    /// Install `active` into the thread-local slot.
    pub fn install(active: ActiveTxn) -> Self {
        SYNC_SLOT.with(|slot| *slot.borrow_mut() = Some(active));
        SyncSlotGuard { _private: () }
    }

    /// Clear the slot and hand the transaction back for validation.
    pub fn finish(self) -> Option<ActiveTxn> {
        let active = SYNC_SLOT.with(|slot| slot.borrow_mut().take());
        std::mem::forget(self);
        active
    }
}

impl Drop for SyncSlotGuard {
    fn drop(&mut self) {
        SYNC_SLOT.with(|slot| slot.borrow_mut().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateMap;
    use refstm_core::Isolation;
    use std::sync::Arc;

    fn dummy_txn(id: u64) -> Transaction {
        Transaction::new(TxnId::new(id), Isolation::Snapshot, Arc::new(StateMap::new()))
    }

    #[test]
    fn test_slot_starts_free() {
        assert_eq!(state_for(1), ContextState::Free);
        assert!(active_txn_id().is_none());
    }

    #[test]
    fn test_install_and_finish() {
        let guard = SyncSlotGuard::install(ActiveTxn {
            engine_token: 7,
            txn: dummy_txn(1),
        });
        assert_eq!(state_for(7), ContextState::OwnedBySelf);
        assert_eq!(state_for(8), ContextState::OwnedByOther);
        assert_eq!(active_txn_id(), Some(TxnId::new(1)));

        let active = guard.finish().unwrap();
        assert_eq!(active.txn.txn_id, TxnId::new(1));
        assert_eq!(state_for(7), ContextState::Free);
    }

    #[test]
    fn test_drop_clears_slot() {
        {
            let _guard = SyncSlotGuard::install(ActiveTxn {
                engine_token: 7,
                txn: dummy_txn(2),
            });
            assert_eq!(state_for(7), ContextState::OwnedBySelf);
        }
        assert_eq!(state_for(7), ContextState::Free);
    }

    #[test]
    fn test_slot_is_per_thread() {
        let _guard = SyncSlotGuard::install(ActiveTxn {
            engine_token: 7,
            txn: dummy_txn(3),
        });
        let other = std::thread::spawn(|| state_for(7)).join().unwrap();
        assert_eq!(other, ContextState::Free);
    }
}
