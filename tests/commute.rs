//! Commute semantics: deferred re-application against the live value.

use refstm::{Stm, StmError};
use std::sync::mpsc;
use std::thread;

#[test]
fn commute_applies_to_live_value_not_snapshot() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);

    let (ask, serve) = mpsc::channel::<()>();
    let (done, bumped) = mpsc::channel::<()>();
    let helper = {
        let stm = stm.clone();
        let r = r.clone();
        thread::spawn(move || {
            if serve.recv().is_ok() {
                stm.run_snapshot(|| r.swap(|_| 100).map(|_| ())).unwrap();
                done.send(()).unwrap();
            }
        })
    };

    let mut attempts = 0usize;
    let staged = stm
        .run_snapshot(|| {
            attempts += 1;
            let handle = r.commute(|n| n + 1)?;
            if attempts == 1 {
                ask.send(()).unwrap();
                bumped.recv().unwrap();
            }
            Ok(*handle.staged())
        })
        .unwrap();
    helper.join().unwrap();

    // The commute itself never conflicts: one attempt, staged against the
    // snapshot (1 + 1), committed against the live value (100 + 1).
    assert_eq!(attempts, 1);
    assert_eq!(staged, 2);
    assert_eq!(r.get().unwrap(), 101);
}

#[test]
fn commute_handle_latest_reads_committed_result() {
    let stm = Stm::new();
    let r = stm.new_ref(10i64);

    let handle = stm.run_snapshot(|| r.commute(|n| n * 2)).unwrap();
    assert_eq!(*handle.staged(), 20);
    // No concurrent commits here, so committed == staged.
    assert_eq!(handle.latest().unwrap(), 20);
    assert_eq!(handle.cell().get().unwrap(), 20);
}

#[test]
fn multiple_commutes_in_one_transaction_bump_version_once() {
    let stm = Stm::new();
    let r = stm.new_ref(1i64);

    stm.run_snapshot(|| {
        r.commute(|n| n * 2)?;
        r.commute(|n| n + 3)?;
        // In-transaction view folds both, in issue order.
        assert_eq!(r.get()?, 5);
        Ok(())
    })
    .unwrap();
    assert_eq!(r.get().unwrap(), 5);
}

#[test]
fn write_then_commute_commits_both_in_order() {
    let stm = Stm::new();
    let r = stm.new_ref(0i64);

    stm.run_snapshot(|| {
        r.set(10)?;
        r.commute(|n| n + 1)?;
        assert_eq!(r.get()?, 11);
        Ok(())
    })
    .unwrap();
    assert_eq!(r.get().unwrap(), 11);
}

#[test]
fn commute_function_may_read_sibling_cells() {
    let stm = Stm::new();
    let total = stm.new_ref(100i64);
    let rate = stm.new_ref(3i64);

    let rate_hook = rate.clone();
    stm.run_serializable(|| {
        let rate_hook = rate_hook.clone();
        total
            .commute(move |n| n + rate_hook.get().unwrap_or(0))
            .map(|_| ())
    })
    .unwrap();
    assert_eq!(total.get().unwrap(), 103);
}

#[test]
fn commute_validator_failure_is_terminal() {
    let stm = Stm::new();
    let r = stm
        .new_ref_with_validator(5i64, |n| *n >= 0)
        .unwrap();

    let err = stm
        .run_snapshot(|| r.commute(|n| n - 10).map(|_| ()))
        .unwrap_err();
    assert_eq!(err, StmError::ValidationFailed(r.id()));
    assert_eq!(r.get().unwrap(), 5);
}
