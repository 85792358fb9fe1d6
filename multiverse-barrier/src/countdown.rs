use crate::group::{CommitGroup, GroupState};
use crate::{BarrierError, BarrierStatus};
use multiverse_stm::Transaction;
use std::fmt;
use std::time::{Duration, Instant};

fn all_arrived(state: &GroupState) -> bool {
    state.number_waiting >= state.parties
}

/// Commits its participants once `parties` of them have joined.
///
/// Share it between threads behind an `Arc`.
pub struct CountDownCommitBarrier {
    group: CommitGroup,
}

impl CountDownCommitBarrier {
    /// A barrier with zero parties is committed right away.
    pub fn new(parties: usize) -> Self {
        let status = if parties == 0 {
            BarrierStatus::Committed
        } else {
            BarrierStatus::Closed
        };
        Self {
            group: CommitGroup::new(status, parties),
        }
    }

    pub fn parties(&self) -> usize {
        self.group.lock().parties
    }

    /// Participants that joined and are waiting for the barrier to open.
    pub fn number_waiting(&self) -> usize {
        self.group.lock().number_waiting
    }

    pub fn status(&self) -> BarrierStatus {
        self.group.status()
    }

    pub fn is_closed(&self) -> bool {
        self.status() == BarrierStatus::Closed
    }

    pub fn is_committed(&self) -> bool {
        self.status() == BarrierStatus::Committed
    }

    pub fn is_aborted(&self) -> bool {
        self.status() == BarrierStatus::Aborted
    }

    /// Prepare `tx` and wait until all parties joined, then commit it.
    ///
    /// The last party to arrive commits without waiting. If the barrier is
    /// aborted meanwhile, `tx` is aborted and [`BarrierError::Aborted`] returned.
    /// A transaction that fails to prepare is aborted and the barrier is left
    /// as it was.
    pub fn join_commit(&self, tx: &mut Transaction) -> Result<(), BarrierError> {
        self.group.join(tx, None, all_arrived)
    }

    /// Like [`join_commit`](Self::join_commit) but gives up after `timeout`.
    ///
    /// On timeout the barrier is aborted along with `tx` and every waiting
    /// participant, and [`BarrierError::Timeout`] returned.
    pub fn try_join_commit_for(&self, tx: &mut Transaction, timeout: Duration) -> Result<(), BarrierError> {
        self.group.join(tx, Some(Instant::now() + timeout), all_arrived)
    }

    /// Join without waiting.
    ///
    /// Returns `true` if this was the last party and the group committed.
    /// Otherwise the barrier can't complete without this party, so it is
    /// aborted together with `tx` and `false` returned.
    pub fn try_join_commit(&self, tx: &mut Transaction) -> Result<bool, BarrierError> {
        self.group.try_join(tx, all_arrived)
    }

    /// Raise the number of parties by `extra`.
    pub fn inc_parties(&self, extra: i32) -> Result<(), BarrierError> {
        if extra < 0 {
            return Err(BarrierError::IllegalArgument(format!(
                "extra parties can't be negative, was {extra}"
            )));
        }
        if extra == 0 {
            return Ok(());
        }

        let mut state = self.group.lock();
        if state.status != BarrierStatus::Closed {
            return Err(BarrierError::BarrierOpen { status: state.status });
        }
        state.parties += extra as usize;
        tracing::debug!(parties = state.parties, "commit barrier parties raised");
        Ok(())
    }

    /// Abort the barrier and every waiting participant.
    ///
    /// Aborting an aborted barrier is fine; aborting a committed one fails.
    pub fn abort(&self) -> Result<(), BarrierError> {
        self.group.close(BarrierStatus::Aborted)
    }

    /// Block until the barrier committed or aborted.
    pub fn await_open(&self) {
        self.group.await_open(None);
    }

    /// Returns `false` if the barrier was still closed after `timeout`.
    pub fn try_await_open_for(&self, timeout: Duration) -> bool {
        self.group.await_open(Some(Instant::now() + timeout))
    }

    /// Run `task` once the barrier commits. Dropped if it aborts.
    pub fn register_on_commit_task<F>(&self, task: F) -> Result<(), BarrierError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.group.register_task(true, Box::new(task))
    }

    /// Run `task` once the barrier aborts. Dropped if it commits.
    pub fn register_on_abort_task<F>(&self, task: F) -> Result<(), BarrierError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.group.register_task(false, Box::new(task))
    }
}

impl fmt::Debug for CountDownCommitBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.group.lock();
        f.debug_struct("CountDownCommitBarrier")
            .field("status", &state.status)
            .field("parties", &state.parties)
            .field("number_waiting", &state.number_waiting)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use multiverse_stm::Stm;

    #[test]
    fn test_zero_parties_is_committed() {
        let barrier = CountDownCommitBarrier::new(0);
        assert!(barrier.is_committed());
        assert!(barrier.try_await_open_for(Duration::from_millis(1)));
    }

    #[test]
    fn test_single_party_commits_immediately() {
        let stm = Stm::new();
        let var = stm.new_long(0);
        let barrier = CountDownCommitBarrier::new(1);

        let mut tx = stm.new_transaction();
        var.set(&mut tx, 5).unwrap();
        barrier.join_commit(&mut tx).unwrap();

        assert!(barrier.is_committed());
        assert_eq!(var.atomic_get().unwrap(), 5);
    }

    #[test]
    fn test_inc_parties_validation() {
        let barrier = CountDownCommitBarrier::new(1);
        assert!(matches!(barrier.inc_parties(-1), Err(BarrierError::IllegalArgument(_))));
        assert_eq!(barrier.parties(), 1);

        barrier.inc_parties(0).unwrap();
        barrier.inc_parties(2).unwrap();
        assert_eq!(barrier.parties(), 3);

        barrier.abort().unwrap();
        assert!(matches!(
            barrier.inc_parties(1),
            Err(BarrierError::BarrierOpen { status: BarrierStatus::Aborted })
        ));

        let committed = CountDownCommitBarrier::new(0);
        assert!(matches!(
            committed.inc_parties(1),
            Err(BarrierError::BarrierOpen { status: BarrierStatus::Committed })
        ));
        assert_eq!(committed.parties(), 0);
    }

    #[test]
    fn test_abort_twice_and_after_commit() {
        let barrier = CountDownCommitBarrier::new(2);
        barrier.abort().unwrap();
        barrier.abort().unwrap();
        assert!(barrier.is_aborted());

        let committed = CountDownCommitBarrier::new(0);
        assert!(matches!(
            committed.abort(),
            Err(BarrierError::BarrierOpen { status: BarrierStatus::Committed })
        ));
    }

    #[test]
    fn test_try_join_as_last_party_commits() {
        let stm = Stm::new();
        let var = stm.new_long(0);
        let barrier = CountDownCommitBarrier::new(1);

        let mut tx = stm.new_transaction();
        var.set(&mut tx, 2).unwrap();
        assert!(barrier.try_join_commit(&mut tx).unwrap());

        assert!(barrier.is_committed());
        assert!(!tx.is_alive());
        assert_eq!(var.atomic_get().unwrap(), 2);
    }

    #[test]
    fn test_try_join_too_early_aborts_barrier() {
        let stm = Stm::new();
        let var = stm.new_long(0);
        let barrier = CountDownCommitBarrier::new(2);

        let mut tx = stm.new_transaction();
        var.set(&mut tx, 1).unwrap();
        assert!(!barrier.try_join_commit(&mut tx).unwrap());

        assert!(barrier.is_aborted());
        assert!(!tx.is_alive());
        assert_eq!(barrier.number_waiting(), 0);
        assert_eq!(var.atomic_get().unwrap(), 0);

        let mut late = stm.new_transaction();
        var.set(&mut late, 3).unwrap();
        assert!(matches!(
            barrier.try_join_commit(&mut late),
            Err(BarrierError::BarrierOpen { status: BarrierStatus::Aborted })
        ));
    }

    #[test]
    fn test_join_after_open_aborts_transaction() {
        let stm = Stm::new();
        let var = stm.new_long(0);
        let barrier = CountDownCommitBarrier::new(0);

        let mut tx = stm.new_transaction();
        var.set(&mut tx, 1).unwrap();
        assert!(matches!(
            barrier.join_commit(&mut tx),
            Err(BarrierError::BarrierOpen { status: BarrierStatus::Committed })
        ));
        assert!(!tx.is_alive());
        assert_eq!(var.atomic_get().unwrap(), 0);
    }

    #[test]
    fn test_join_timeout_aborts_barrier() {
        let stm = Stm::new();
        let var = stm.new_long(0);
        let barrier = CountDownCommitBarrier::new(2);

        let mut tx = stm.new_transaction();
        var.set(&mut tx, 1).unwrap();
        assert!(matches!(
            barrier.try_join_commit_for(&mut tx, Duration::from_millis(20)),
            Err(BarrierError::Timeout)
        ));
        assert_eq!(barrier.number_waiting(), 0);
        assert!(barrier.is_aborted());
        assert!(!tx.is_alive());
        assert_eq!(var.atomic_get().unwrap(), 0);
        // the aborted transaction released its locks
        var.atomic_set(3).unwrap();
    }
}
