//! Two-phase commit of a [`Transaction`].
//!
//! 1. **Prepare**: in reference-id order, dirty entries take the exclusive lock
//!    (commuting entries are fixated under it first), clean entries take a read
//!    lock when write skew has to be prevented. Every lock revalidates the
//!    version the entry was derived from.
//! 2. **Publish**: one write version is taken from the clock, each dirty entry
//!    installs its value and version and unlocks, clean entries depart.
//! 3. **Wake**: detached listener latches are opened, then commit hooks run.
//!
//! Past prepare nothing can conflict anymore, so a prepared transaction always commits.

use crate::errors::{PanicError, StmError, StmResult};
use crate::transaction::{Transaction, TxnStatus};

impl Transaction {
    /// Lock and validate every entry.
    ///
    /// A conflict aborts the transaction and reports [`StmError::ReadWriteConflict`].
    pub fn prepare(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::New | TxnStatus::Active => {}
            TxnStatus::Prepared => return Ok(()),
            status @ (TxnStatus::Committed | TxnStatus::Aborted) => {
                return Err(StmError::DeadTransaction {
                    family: self.family(),
                    operation: "prepare",
                    status,
                });
            }
        }

        if self.is_abort_only() {
            self.abort();
            return Err(StmError::AbortOnly { family: self.family() });
        }

        if self.has_writes {
            let config = self.config.clone();
            let mut failure = None;
            for entry in self.entries.values_mut() {
                match entry.prepare(&config, &mut self.commit_conflict) {
                    Ok(true) => {}
                    Ok(false) => {
                        failure = Some(StmError::ReadWriteConflict);
                        break;
                    }
                    Err(error) => {
                        failure = Some(error);
                        break;
                    }
                }
            }

            if let Some(error) = failure {
                tracing::debug!(
                    family = %config.family_name,
                    attempt = self.attempt,
                    %error,
                    "prepare failed"
                );
                self.abort();
                return Err(error);
            }
        }

        self.status = TxnStatus::Prepared;
        Ok(())
    }

    /// Commit, preparing first when needed.
    ///
    /// Committing a committed transaction does nothing.
    pub fn commit(&mut self) -> StmResult<()> {
        match self.status {
            TxnStatus::Committed => return Ok(()),
            TxnStatus::Aborted => {
                return Err(StmError::DeadTransaction {
                    family: self.family(),
                    operation: "commit",
                    status: TxnStatus::Aborted,
                });
            }
            TxnStatus::New | TxnStatus::Active | TxnStatus::Prepared => {}
        }

        if self.is_abort_only() {
            self.abort();
            return Err(StmError::AbortOnly { family: self.family() });
        }

        let fault = if self.has_writes {
            self.prepare()?;
            self.publish()
        } else {
            self.release_reads()
        };

        self.entries.clear();
        self.status = TxnStatus::Committed;
        tracing::trace!(
            family = %self.config.family_name,
            attempt = self.attempt,
            "transaction committed"
        );

        for hook in std::mem::take(&mut self.post_commit_hooks) {
            hook();
        }

        match fault {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    fn release_reads(&mut self) -> Option<PanicError> {
        let mut fault = None;
        for entry in self.entries.values_mut() {
            if let Err(error) = entry.release_after_reading() {
                fault.get_or_insert(error);
            }
        }
        fault
    }

    /// Write phase of a prepared transaction. Keeps going past faults and
    /// returns the first one.
    fn publish(&mut self) -> Option<PanicError> {
        let dirty = self.entries.values().any(|entry| entry.is_dirty());
        let write_version = if dirty {
            if self.commit_conflict {
                self.stm.conflict_counter().signal_conflict();
            }
            self.stm.clock().tick()
        } else {
            0
        };

        let mut fault = None;
        let mut listeners = Vec::new();
        for entry in self.entries.values_mut() {
            match entry.commit(write_version) {
                Ok(Some(detached)) => listeners.push(detached),
                Ok(None) => {}
                Err(error) => {
                    fault.get_or_insert(error);
                }
            }
        }

        let woken: usize = listeners.into_iter().map(|detached| detached.open_all()).sum();
        if woken > 0 {
            tracing::trace!(family = %self.config.family_name, woken, write_version, "woke blocked transactions");
        }
        fault
    }
}

#[cfg(test)]
mod tests {
    use crate::{IsolationLevel, LockMode, Stm, StmError, TxnRef, TxnStatus};

    #[test]
    fn prepared_transaction_holds_exclusive_locks() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 1);
        let mut tx = stm.new_transaction();
        r.set(&mut tx, 2).unwrap();
        tx.prepare().unwrap();
        assert_eq!(tx.status(), TxnStatus::Prepared);
        assert_eq!(r.atomic_lock_mode(), LockMode::Exclusive);

        tx.commit().unwrap();
        assert_eq!(r.atomic_lock_mode(), LockMode::None);
        assert_eq!(r.atomic_get().unwrap(), 2);
    }

    #[test]
    fn clean_write_publishes_nothing() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 7);
        let before = r.version();
        let mut tx = stm.new_transaction();
        r.set(&mut tx, 7).unwrap();
        tx.commit().unwrap();
        assert_eq!(r.version(), before);
    }

    #[test]
    fn dirty_check_off_publishes_equal_values() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 7);
        let before = r.version();
        let mut tx = stm.factory_builder().dirty_check(false).build().unwrap().new_transaction();
        r.set(&mut tx, 7).unwrap();
        tx.commit().unwrap();
        assert!(r.version() > before);
    }

    #[test]
    fn stale_write_conflicts() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 0);
        let mut tx = stm.new_transaction();
        r.set(&mut tx, 1).unwrap();
        r.atomic_set(5).unwrap();
        assert!(matches!(tx.commit(), Err(StmError::ReadWriteConflict)));
        assert_eq!(tx.status(), TxnStatus::Aborted);
        assert_eq!(r.atomic_get().unwrap(), 5);
        assert_eq!(r.atomic_lock_mode(), LockMode::None);
    }

    #[test]
    fn stale_read_conflicts_only_when_serializable() {
        for (level, conflicts) in [(IsolationLevel::Snapshot, false), (IsolationLevel::Serializable, true)] {
            let stm = Stm::new();
            let read = TxnRef::new(&stm, 0);
            let written = TxnRef::new(&stm, 0);
            let mut tx = stm.factory_builder().isolation_level(level).build().unwrap().new_transaction();
            read.get(&mut tx).unwrap();
            written.set(&mut tx, 1).unwrap();
            read.atomic_set(9).unwrap();
            assert_eq!(tx.commit().is_err(), conflicts, "{level:?}");
        }
    }

    #[test]
    fn abort_only_fails_commit() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 0);
        let mut tx = stm.new_transaction();
        r.set(&mut tx, 1).unwrap();
        tx.set_abort_only().unwrap();
        assert!(matches!(tx.commit(), Err(StmError::AbortOnly { .. })));
        assert_eq!(r.atomic_get().unwrap(), 0);
    }

    #[test]
    fn commit_twice_is_a_no_op() {
        let stm = Stm::new();
        let mut tx = stm.new_transaction();
        tx.commit().unwrap();
        tx.commit().unwrap();
        tx.abort();
        assert_eq!(tx.status(), TxnStatus::Committed);
    }
}
