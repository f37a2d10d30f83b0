//! Transaction scratchpad
//!
//! A `Transaction` isolates one attempt's reads, writes, and commutes from
//! the shared store until commit. A fresh one is created for every attempt,
//! including retries, and discarded afterwards; it is never shared across
//! threads.
//!
//! Reads implement read-your-own-writes: a staged write or commute is
//! visible to every later read in the same transaction. Only reads that
//! fall through to the snapshot enter the read set.

use crate::store::{DynValue, RefState, StateMap};
use refstm_core::{Isolation, RefId, Result, StmError, TxnId, Version};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// None of the methods here invoke caller-supplied functions: the transaction
// lives inside a context-slot `RefCell`, and running user code under that
// borrow would make any re-entrant ref access panic. Callers apply their
// functions between calls into this type.

/// Deferred commutative update. Re-applied against the live value at commit
/// time, so it must be pure.
pub(crate) type CommuteFn = Arc<dyn Fn(&DynValue) -> DynValue + Send + Sync>;

/// Per-attempt private view of the world.
pub(crate) struct Transaction {
    /// Diagnostics only; no effect on commit logic.
    pub txn_id: TxnId,
    /// Strength of the read-set check applied at commit.
    pub isolation: Isolation,
    /// The committed world captured at attempt start.
    snapshot: Arc<StateMap>,
    /// Staged states overlaying the snapshot; a miss falls through.
    local: HashMap<RefId, RefState>,
    /// Ids read from the snapshot (not from staged writes).
    pub read_set: HashSet<RefId>,
    /// Plain writes by ref. Kept apart from `local` so a commute staged on
    /// the same ref does not leak into the committed write value; commutes
    /// are re-applied on top at commit time.
    pub writes: HashMap<RefId, DynValue>,
    /// Deferred commutes in issue order.
    pub commute_ops: Vec<(RefId, CommuteFn)>,
}

impl Transaction {
    pub fn new(txn_id: TxnId, isolation: Isolation, snapshot: Arc<StateMap>) -> Self {
        Transaction {
            txn_id,
            isolation,
            snapshot,
            local: HashMap::new(),
            read_set: HashSet::new(),
            writes: HashMap::new(),
            commute_ops: Vec::new(),
        }
    }

    fn state(&self, id: RefId) -> Result<&RefState> {
        self.local
            .get(&id)
            .or_else(|| self.snapshot.get(id))
            .ok_or(StmError::UnknownRef(id))
    }

    /// Version this transaction's view holds for `id`: the snapshot version.
    /// Staged states never bump versions; only commit does.
    pub fn baseline_version(&self, id: RefId) -> Option<Version> {
        self.snapshot.get(id).map(|state| state.version)
    }

    /// Transaction-local read.
    ///
    /// A ref with a staged write returns the staged value without touching
    /// the read set; everything else is recorded for serializable
    /// validation and served from the overlay or the snapshot.
    pub fn read(&mut self, id: RefId) -> Result<DynValue> {
        if !self.writes.contains_key(&id) {
            self.read_set.insert(id);
        }
        self.state(id).map(|state| state.value.clone())
    }

    /// Stage a plain write. Not validated until commit.
    pub fn write(&mut self, id: RefId, value: DynValue) -> Result<()> {
        let staged = self.state(id)?.replaced(value.clone());
        self.local.insert(id, staged);
        self.writes.insert(id, value);
        Ok(())
    }

    /// Transaction-local value a commute will be staged over. Not a read:
    /// the read set is untouched, since commutes never conflict.
    pub fn commute_base(&self, id: RefId) -> Result<DynValue> {
        self.state(id).map(|state| state.value.clone())
    }

    /// Stage a commute whose locally mapped value the caller computed from
    /// [`Transaction::commute_base`]: overlay `mapped` so later reads in
    /// this transaction see it, and queue `f` for re-application against
    /// the live value at commit time.
    pub fn stage_commute(&mut self, id: RefId, mapped: DynValue, f: CommuteFn) -> Result<()> {
        let staged = self.state(id)?.replaced(mapped);
        self.local.insert(id, staged);
        self.commute_ops.push((id, f));
        Ok(())
    }

    /// True when commit needs no store interaction at all.
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty() && self.commute_ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RefState;

    fn snapshot_with(entries: &[(u64, i64)]) -> Arc<StateMap> {
        let mut map = StateMap::new();
        for (raw, n) in entries {
            map = map.with(
                RefId::new(*raw),
                RefState::new(Arc::new(*n) as DynValue, None),
            );
        }
        Arc::new(map)
    }

    fn txn(snapshot: Arc<StateMap>) -> Transaction {
        Transaction::new(TxnId::new(1), Isolation::Serializable, snapshot)
    }

    /// Apply a commute the way the handle layer does: fetch the base, run
    /// the function outside the transaction, stage the result.
    fn commute(t: &mut Transaction, id: RefId, f: CommuteFn) -> DynValue {
        let base = t.commute_base(id).unwrap();
        let mapped = f(&base);
        t.stage_commute(id, mapped.clone(), f).unwrap();
        mapped
    }

    fn as_i64(value: DynValue) -> i64 {
        *value.downcast_ref::<i64>().unwrap()
    }

    #[test]
    fn test_read_falls_through_to_snapshot() {
        let mut t = txn(snapshot_with(&[(1, 10)]));
        assert_eq!(as_i64(t.read(RefId::new(1)).unwrap()), 10);
        assert!(t.read_set.contains(&RefId::new(1)));
        assert!(t.is_read_only());
    }

    #[test]
    fn test_read_unknown_ref_fails() {
        let mut t = txn(snapshot_with(&[]));
        let err = t.read(RefId::new(5)).unwrap_err();
        assert_eq!(err, StmError::UnknownRef(RefId::new(5)));
    }

    #[test]
    fn test_read_your_own_writes() {
        let id = RefId::new(1);
        let mut t = txn(snapshot_with(&[(1, 10)]));
        t.write(id, Arc::new(99i64)).unwrap();
        assert_eq!(as_i64(t.read(id).unwrap()), 99);
        // Reading a staged write does not grow the read set.
        assert!(!t.read_set.contains(&id));
        assert!(t.writes.contains_key(&id));
    }

    #[test]
    fn test_write_to_unknown_ref_fails() {
        let mut t = txn(snapshot_with(&[]));
        let err = t.write(RefId::new(3), Arc::new(1i64)).unwrap_err();
        assert_eq!(err, StmError::UnknownRef(RefId::new(3)));
    }

    #[test]
    fn test_commute_is_locally_visible() {
        let id = RefId::new(1);
        let mut t = txn(snapshot_with(&[(1, 10)]));
        let mapped = commute(
            &mut t,
            id,
            Arc::new(|v: &DynValue| {
                let n = *v.downcast_ref::<i64>().unwrap();
                Arc::new(n + 5) as DynValue
            }),
        );
        assert_eq!(as_i64(mapped), 15);
        assert_eq!(as_i64(t.read(id).unwrap()), 15);
        // Commutes queue for commit-time re-application but are not writes.
        assert_eq!(t.commute_ops.len(), 1);
        assert!(t.writes.is_empty());
        assert!(!t.is_read_only());
    }

    #[test]
    fn test_commutes_stack_in_order() {
        let id = RefId::new(1);
        let mut t = txn(snapshot_with(&[(1, 1)]));
        let double: CommuteFn = Arc::new(|v: &DynValue| {
            let n = *v.downcast_ref::<i64>().unwrap();
            Arc::new(n * 2) as DynValue
        });
        let inc: CommuteFn = Arc::new(|v: &DynValue| {
            let n = *v.downcast_ref::<i64>().unwrap();
            Arc::new(n + 1) as DynValue
        });
        commute(&mut t, id, double);
        commute(&mut t, id, inc);
        // (1 * 2) + 1, in issue order.
        assert_eq!(as_i64(t.read(id).unwrap()), 3);
        assert_eq!(t.commute_ops.len(), 2);
    }

    #[test]
    fn test_write_then_commute_keeps_write_value_apart() {
        let id = RefId::new(1);
        let mut t = txn(snapshot_with(&[(1, 0)]));
        t.write(id, Arc::new(5i64)).unwrap();
        commute(
            &mut t,
            id,
            Arc::new(|v: &DynValue| {
                let n = *v.downcast_ref::<i64>().unwrap();
                Arc::new(n + 1) as DynValue
            }),
        );
        // The local view folds both in; the staged write value does not,
        // since the commute re-runs on top of it at commit.
        assert_eq!(as_i64(t.read(id).unwrap()), 6);
        assert_eq!(as_i64(t.writes.get(&id).unwrap().clone()), 5);
    }

    #[test]
    fn test_baseline_version_is_snapshot_version() {
        let id = RefId::new(1);
        let mut t = txn(snapshot_with(&[(1, 10)]));
        t.write(id, Arc::new(20i64)).unwrap();
        // Staging never bumps the version the transaction validates against.
        assert_eq!(t.baseline_version(id), Some(Version::ZERO));
    }
}
