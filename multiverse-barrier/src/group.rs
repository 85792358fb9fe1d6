use crate::{BarrierError, BarrierStatus};
use multiverse_stm::Transaction;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Instant;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

pub(crate) struct GroupState {
    pub(crate) status: BarrierStatus,
    pub(crate) parties: usize,
    pub(crate) number_waiting: usize,
    on_commit: Vec<Task>,
    on_abort: Vec<Task>,
}

/// Shared machinery of the commit barriers.
///
/// Every joiner keeps its own transaction and commits or aborts it once the
/// group closes. A joiner that gives up aborts the whole group, so no
/// participant is left waiting on a group that can't complete.
pub(crate) struct CommitGroup {
    state: Mutex<GroupState>,
    cond: Condvar,
}

impl CommitGroup {
    pub(crate) fn new(status: BarrierStatus, parties: usize) -> Self {
        Self {
            state: Mutex::new(GroupState {
                status,
                parties,
                number_waiting: 0,
                on_commit: Vec::new(),
                on_abort: Vec::new(),
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock()
    }

    pub(crate) fn status(&self) -> BarrierStatus {
        self.state.lock().status
    }

    /// Prepare `tx` and count it in. Returns the guard with the caller counted,
    /// or an error after aborting `tx`.
    fn arrive(&self, tx: &mut Transaction) -> Result<MutexGuard<'_, GroupState>, BarrierError> {
        let status = self.status();
        if status != BarrierStatus::Closed {
            tx.abort();
            return Err(BarrierError::BarrierOpen { status });
        }

        tx.prepare()?;

        let mut state = self.state.lock();
        if state.status != BarrierStatus::Closed {
            let status = state.status;
            drop(state);
            tx.abort();
            return Err(BarrierError::closed_as(status));
        }
        state.number_waiting += 1;
        Ok(state)
    }

    /// Join and block until the group closes or `deadline` passes.
    pub(crate) fn join(
        &self,
        tx: &mut Transaction,
        deadline: Option<Instant>,
        complete: impl Fn(&GroupState) -> bool,
    ) -> Result<(), BarrierError> {
        let mut state = self.arrive(tx)?;
        if complete(&state) {
            return self.finish(state, BarrierStatus::Committed, Some(tx));
        }

        loop {
            match state.status {
                BarrierStatus::Closed => {}
                BarrierStatus::Committed => {
                    drop(state);
                    tx.commit()?;
                    return Ok(());
                }
                BarrierStatus::Aborted => {
                    drop(state);
                    tx.abort();
                    return Err(BarrierError::Aborted);
                }
            }

            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out()
                        && state.status == BarrierStatus::Closed
                    {
                        tracing::debug!("commit barrier join timed out, aborting the group");
                        self.finish(state, BarrierStatus::Aborted, Some(tx))?;
                        return Err(BarrierError::Timeout);
                    }
                }
            }
        }
    }

    /// Join without blocking.
    ///
    /// Commits the group and returns `true` when this was the last party;
    /// otherwise aborts the group and `tx` and returns `false`.
    pub(crate) fn try_join(
        &self,
        tx: &mut Transaction,
        complete: impl Fn(&GroupState) -> bool,
    ) -> Result<bool, BarrierError> {
        let state = self.arrive(tx)?;
        if complete(&state) {
            self.finish(state, BarrierStatus::Committed, Some(tx))?;
            return Ok(true);
        }
        tracing::debug!(
            parties = state.parties,
            waiting = state.number_waiting,
            "non-blocking join came early, aborting the group"
        );
        self.finish(state, BarrierStatus::Aborted, Some(tx))?;
        Ok(false)
    }

    /// Prepare `tx` and commit it together with the whole group.
    pub(crate) fn commit_with(&self, tx: &mut Transaction) -> Result<(), BarrierError> {
        let state = self.arrive(tx)?;
        self.finish(state, BarrierStatus::Committed, Some(tx))
    }

    /// Close an accepting group with `status`.
    ///
    /// Closing with the same status again is a no-op; closing with the other
    /// status fails.
    pub(crate) fn close(&self, status: BarrierStatus) -> Result<(), BarrierError> {
        let state = self.state.lock();
        match state.status {
            BarrierStatus::Closed => self.finish(state, status, None),
            current if current == status => Ok(()),
            current => Err(BarrierError::BarrierOpen { status: current }),
        }
    }

    fn finish(
        &self,
        mut state: MutexGuard<'_, GroupState>,
        status: BarrierStatus,
        own: Option<&mut Transaction>,
    ) -> Result<(), BarrierError> {
        state.status = status;
        let (tasks, discarded) = if status == BarrierStatus::Committed {
            (std::mem::take(&mut state.on_commit), std::mem::take(&mut state.on_abort))
        } else {
            (std::mem::take(&mut state.on_abort), std::mem::take(&mut state.on_commit))
        };
        tracing::debug!(%status, parties = state.parties, waiting = state.number_waiting, "commit barrier closed");
        state.number_waiting = 0;
        self.cond.notify_all();
        drop(state);
        drop(discarded);

        let result = match own {
            Some(tx) if status == BarrierStatus::Committed => tx.commit().map_err(BarrierError::from),
            Some(tx) => {
                tx.abort();
                Ok(())
            }
            None => Ok(()),
        };

        for task in tasks {
            task();
        }
        result
    }

    pub(crate) fn register_task(&self, on_commit: bool, task: Task) -> Result<(), BarrierError> {
        let mut state = self.state.lock();
        if state.status != BarrierStatus::Closed {
            return Err(BarrierError::BarrierOpen { status: state.status });
        }
        if on_commit {
            state.on_commit.push(task);
        } else {
            state.on_abort.push(task);
        }
        Ok(())
    }

    pub(crate) fn await_open(&self, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        while state.status == BarrierStatus::Closed {
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.status != BarrierStatus::Closed;
                    }
                }
            }
        }
        true
    }
}
