use multiverse_barrier::{BarrierError, CountDownCommitBarrier, VetoCommitBarrier};
use multiverse_stm::{NoBackoff, Stm, StmConfig, StmError, TxnLong};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn spawn_joiner(
    stm: &Stm,
    barrier: &Arc<CountDownCommitBarrier>,
    var: &TxnLong,
    value: i64,
) -> thread::JoinHandle<Result<(), BarrierError>> {
    let (stm, barrier, var) = (stm.clone(), barrier.clone(), var.clone());
    thread::spawn(move || {
        let mut tx = stm.new_transaction();
        var.set(&mut tx, value)?;
        barrier.join_commit(&mut tx)
    })
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_all_parties_commit_together() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    // small spin budget so the locked read below gives up quickly
    let stm = Stm::with_config(StmConfig {
        spin_count: 4,
        backoff: Arc::new(NoBackoff),
        ..Default::default()
    })
    .unwrap();
    let barrier = Arc::new(CountDownCommitBarrier::new(3));
    let vars: Vec<TxnLong> = (0..3).map(|_| stm.new_long(0)).collect();

    let first = spawn_joiner(&stm, &barrier, &vars[0], 1);
    let second = spawn_joiner(&stm, &barrier, &vars[1], 2);

    wait_for("two waiting parties", || barrier.number_waiting() == 2);
    assert!(barrier.is_closed());
    assert!(vars.iter().all(|v| v.atomic_weak_get().unwrap() == 0));
    // prepared participants keep their locks until the barrier opens
    assert!(matches!(vars[0].atomic_get(), Err(StmError::LockedReference { .. })));

    let mut tx = stm.new_transaction();
    vars[2].set(&mut tx, 3).unwrap();
    barrier.join_commit(&mut tx).unwrap();

    first.join().unwrap().unwrap();
    second.join().unwrap().unwrap();
    assert!(barrier.is_committed());
    let values: Vec<i64> = vars.iter().map(|v| v.atomic_get().unwrap()).collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_abort_rolls_back_waiting_parties() {
    let stm = Stm::new();
    let barrier = Arc::new(CountDownCommitBarrier::new(3));
    let a = stm.new_long(0);
    let b = stm.new_long(0);

    let first = spawn_joiner(&stm, &barrier, &a, 1);
    let second = spawn_joiner(&stm, &barrier, &b, 2);
    wait_for("two waiting parties", || barrier.number_waiting() == 2);

    barrier.abort().unwrap();

    assert!(matches!(first.join().unwrap(), Err(BarrierError::Aborted)));
    assert!(matches!(second.join().unwrap(), Err(BarrierError::Aborted)));
    assert!(barrier.is_aborted());
    assert_eq!(a.atomic_get().unwrap(), 0);
    assert_eq!(b.atomic_get().unwrap(), 0);

    // nothing stays locked after the rollback
    a.atomic_set(7).unwrap();
    assert_eq!(a.atomic_get().unwrap(), 7);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_await_open_wakes_on_commit() {
    let stm = Stm::new();
    let barrier = Arc::new(CountDownCommitBarrier::new(1));
    let var = stm.new_long(0);

    let observer = {
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.await_open();
            barrier.is_committed()
        })
    };
    assert!(!barrier.try_await_open_for(Duration::from_millis(10)));

    let mut tx = stm.new_transaction();
    var.set(&mut tx, 9).unwrap();
    barrier.join_commit(&mut tx).unwrap();

    assert!(observer.join().unwrap());
    assert_eq!(var.atomic_get().unwrap(), 9);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_conflicting_participant_does_not_join() {
    let stm = Stm::new();
    let barrier = CountDownCommitBarrier::new(2);
    let var = stm.new_long(0);

    let mut tx = stm.new_transaction();
    let seen = var.get(&mut tx).unwrap();
    var.set(&mut tx, seen + 1).unwrap();
    var.atomic_set(100).unwrap();

    assert!(matches!(
        barrier.join_commit(&mut tx),
        Err(BarrierError::Stm(StmError::ReadWriteConflict))
    ));
    assert_eq!(barrier.number_waiting(), 0);
    assert!(barrier.is_closed());
    assert_eq!(var.atomic_get().unwrap(), 100);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_veto_commits_every_waiter() {
    let stm = Stm::new();
    let barrier = Arc::new(VetoCommitBarrier::new());
    let vars: Vec<TxnLong> = (0..4).map(|_| stm.new_long(0)).collect();

    let handles: Vec<_> = vars
        .iter()
        .enumerate()
        .map(|(i, var)| {
            let (stm, barrier, var) = (stm.clone(), barrier.clone(), var.clone());
            thread::spawn(move || {
                let mut tx = stm.new_transaction();
                var.set(&mut tx, i as i64 + 1)?;
                barrier.join_commit(&mut tx)
            })
        })
        .collect();

    wait_for("four waiting parties", || barrier.number_waiting() == 4);
    assert!(vars.iter().all(|v| v.atomic_weak_get().unwrap() == 0));

    barrier.veto_commit().unwrap();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    let sum: i64 = vars.iter().map(|v| v.atomic_get().unwrap()).sum();
    assert_eq!(sum, 10);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_veto_abort_rolls_back_waiters() {
    let stm = Stm::new();
    let barrier = Arc::new(VetoCommitBarrier::new());
    let var = stm.new_long(0);

    let waiter = {
        let (stm, barrier, var) = (stm.clone(), barrier.clone(), var.clone());
        thread::spawn(move || {
            let mut tx = stm.new_transaction();
            var.set(&mut tx, 1)?;
            barrier.join_commit(&mut tx)
        })
    };
    wait_for("one waiting party", || barrier.number_waiting() == 1);

    barrier.abort().unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(BarrierError::Aborted)));
    assert_eq!(var.atomic_get().unwrap(), 0);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_try_join_commit_before_last_party_aborts_barrier() {
    let stm = Stm::new();
    let barrier = CountDownCommitBarrier::new(2);
    let var = stm.new_long(0);

    let mut tx = stm.new_transaction();
    var.set(&mut tx, 4).unwrap();
    assert!(!barrier.try_join_commit(&mut tx).unwrap());

    assert!(barrier.is_aborted());
    assert_eq!(barrier.number_waiting(), 0);
    assert_eq!(var.atomic_get().unwrap(), 0);
    var.atomic_set(5).unwrap();
    assert_eq!(var.atomic_get().unwrap(), 5);
}

#[test]
#[cfg_attr(miri, ignore)]
fn test_join_timeout_aborts_waiting_parties() {
    let stm = Stm::new();
    let barrier = Arc::new(CountDownCommitBarrier::new(3));
    let a = stm.new_long(0);
    let b = stm.new_long(0);

    let waiter = spawn_joiner(&stm, &barrier, &a, 1);
    wait_for("one waiting party", || barrier.number_waiting() == 1);

    let mut tx = stm.new_transaction();
    b.set(&mut tx, 2).unwrap();
    assert!(matches!(
        barrier.try_join_commit_for(&mut tx, Duration::from_millis(20)),
        Err(BarrierError::Timeout)
    ));

    assert!(matches!(waiter.join().unwrap(), Err(BarrierError::Aborted)));
    assert!(barrier.is_aborted());
    assert_eq!(barrier.number_waiting(), 0);
    assert_eq!(a.atomic_get().unwrap(), 0);
    assert_eq!(b.atomic_get().unwrap(), 0);
}
