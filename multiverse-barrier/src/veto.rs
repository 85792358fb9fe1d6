use crate::group::CommitGroup;
use crate::{BarrierError, BarrierStatus};
use multiverse_stm::Transaction;
use std::fmt;
use std::time::{Duration, Instant};

/// Holds any number of prepared participants until someone vetoes the commit.
pub struct VetoCommitBarrier {
    group: CommitGroup,
}

impl Default for VetoCommitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl VetoCommitBarrier {
    pub fn new() -> Self {
        Self {
            group: CommitGroup::new(BarrierStatus::Closed, 0),
        }
    }

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

    /// Prepare `tx` and wait for [`veto_commit`](Self::veto_commit) or [`abort`](Self::abort).
    pub fn join_commit(&self, tx: &mut Transaction) -> Result<(), BarrierError> {
        self.group.join(tx, None, |_| false)
    }

    /// Like [`join_commit`](Self::join_commit) but gives up after `timeout`,
    /// aborting the barrier and everyone waiting on it.
    pub fn try_join_commit_for(&self, tx: &mut Transaction, timeout: Duration) -> Result<(), BarrierError> {
        self.group.join(tx, Some(Instant::now() + timeout), |_| false)
    }

    /// Open the barrier and commit everybody waiting on it.
    ///
    /// Vetoing twice is fine; vetoing an aborted barrier fails.
    pub fn veto_commit(&self) -> Result<(), BarrierError> {
        self.group.close(BarrierStatus::Committed)
    }

    /// Prepare `tx` and commit it together with everybody waiting.
    pub fn veto_commit_with(&self, tx: &mut Transaction) -> Result<(), BarrierError> {
        self.group.commit_with(tx)
    }

    pub fn abort(&self) -> Result<(), BarrierError> {
        self.group.close(BarrierStatus::Aborted)
    }

    pub fn await_open(&self) {
        self.group.await_open(None);
    }

    pub fn try_await_open_for(&self, timeout: Duration) -> bool {
        self.group.await_open(Some(Instant::now() + timeout))
    }

    pub fn register_on_commit_task<F>(&self, task: F) -> Result<(), BarrierError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.group.register_task(true, Box::new(task))
    }

    pub fn register_on_abort_task<F>(&self, task: F) -> Result<(), BarrierError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.group.register_task(false, Box::new(task))
    }
}

impl fmt::Debug for VetoCommitBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.group.lock();
        f.debug_struct("VetoCommitBarrier")
            .field("status", &state.status)
            .field("number_waiting", &state.number_waiting)
            .finish()
    }
}
