use crate::config::TxnConfig;
use crate::errors::{PanicError, StmError, StmResult};
use crate::latch::Latch;
use crate::orec::LockMode;
use crate::reference::{RefId, TxnRef, TxnValue};
use crate::tranlocal::{Registration, Tranlocal, TranlocalEntry, TranlocalMode, downcast_mut};
use crate::Stm;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

type Hook = Box<dyn FnOnce() + Send>;

/// Lifecycle state of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    /// Created or reset, nothing opened yet.
    New,
    Active,
    /// Locks are held, the commit can no longer fail on a conflict.
    Prepared,
    Committed,
    Aborted,
}

impl TxnStatus {
    pub fn is_alive(self) -> bool {
        matches!(self, TxnStatus::New | TxnStatus::Active | TxnStatus::Prepared)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnStatus::New => "new",
            TxnStatus::Active => "active",
            TxnStatus::Prepared => "prepared",
            TxnStatus::Committed => "committed",
            TxnStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// A transaction over [`TxnRef`]s.
///
/// Entries are kept in a map ordered by reference id, which is also the order
/// locks are taken in at commit. A transaction starts *lean* unless its family
/// already learned it needs more (see [`SpeculativeConfig`](crate::SpeculativeConfig));
/// a lean transaction refuses commuting writes, explicit locks and construction.
pub struct Transaction {
    pub(crate) stm: Stm,
    pub(crate) config: Arc<TxnConfig>,
    pub(crate) fat: bool,
    pub(crate) status: TxnStatus,
    pub(crate) entries: BTreeMap<RefId, Box<dyn TranlocalEntry>>,
    pub(crate) has_writes: bool,
    has_reads: bool,
    /// Some reads skipped the orec arrival; validation can't rely on the conflict counter.
    has_untracked_reads: bool,
    local_conflict_count: u64,
    pub(crate) commit_conflict: bool,
    pub(crate) attempt: usize,
    pub(crate) remaining_timeout: Option<Duration>,
    abort_only: bool,
    pub(crate) post_commit_hooks: Vec<Hook>,
    post_abort_hooks: Vec<Hook>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("family", &self.config.family_name)
            .field("status", &self.status)
            .field("attempt", &self.attempt)
            .field("fat", &self.fat)
            .field("entries", &self.entries.len())
            .field("abort_only", &self.abort_only)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.status.is_alive() {
            self.abort();
        }
    }
}

impl Transaction {
    pub(crate) fn new(stm: Stm, config: Arc<TxnConfig>) -> Self {
        let fat = config.requires_fat();
        let remaining_timeout = config.timeout;
        Self {
            stm,
            config,
            fat,
            status: TxnStatus::New,
            entries: BTreeMap::new(),
            has_writes: false,
            has_reads: false,
            has_untracked_reads: false,
            local_conflict_count: 0,
            commit_conflict: false,
            attempt: 1,
            remaining_timeout,
            abort_only: false,
            post_commit_hooks: Vec::new(),
            post_abort_hooks: Vec::new(),
        }
    }

    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    pub fn config(&self) -> &Arc<TxnConfig> {
        &self.config
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn is_alive(&self) -> bool {
        self.status.is_alive()
    }

    /// 1 on the first attempt, incremented by every [`soft_reset`](Self::soft_reset).
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Time left for blocking retries, `None` when unbounded.
    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.remaining_timeout
    }

    /// Whether this attempt runs in the fat shape.
    pub fn is_fat(&self) -> bool {
        self.fat
    }

    pub fn is_abort_only(&self) -> bool {
        self.abort_only
    }

    /// Make the eventual commit fail with [`StmError::AbortOnly`].
    pub fn set_abort_only(&mut self) -> StmResult<()> {
        self.ensure_open("set abort only")?;
        self.abort_only = true;
        Ok(())
    }

    /// Schedule a side effect to run only if this attempt commits.
    ///
    /// Runs after every lock is released and every waiting transaction is woken.
    pub fn on_commit<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_commit_hooks.push(Box::new(f));
    }

    /// Schedule a side effect to run if this attempt aborts.
    ///
    /// Hooks of an attempt that is restarted by an atomic block run too, once per
    /// aborted attempt.
    pub fn on_abort<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.post_abort_hooks.push(Box::new(f));
    }

    pub(crate) fn family(&self) -> Arc<str> {
        self.config.family_name.clone()
    }

    /// Move a new transaction to active, refuse dead and prepared ones.
    pub(crate) fn ensure_open(&mut self, operation: &'static str) -> StmResult<()> {
        match self.status {
            TxnStatus::New => {
                self.status = TxnStatus::Active;
                Ok(())
            }
            TxnStatus::Active => Ok(()),
            TxnStatus::Prepared => {
                self.abort();
                Err(StmError::PreparedTransaction {
                    family: self.family(),
                    operation,
                })
            }
            status @ (TxnStatus::Committed | TxnStatus::Aborted) => Err(StmError::DeadTransaction {
                family: self.family(),
                operation,
                status,
            }),
        }
    }

    pub(crate) fn ensure_writable(&mut self, operation: &'static str) -> StmResult<()> {
        if self.config.readonly {
            self.abort();
            return Err(StmError::ReadonlyViolation {
                family: self.family(),
                operation,
            });
        }
        Ok(())
    }

    /// Fail a lean transaction that needs the fat shape for `feature`.
    pub(crate) fn require_fat(&mut self, feature: &'static str) -> StmResult<()> {
        if self.fat {
            return Ok(());
        }
        self.config.speculative.signal_fat_required();
        self.abort();
        Err(StmError::SpeculativeConfigurationFailure(feature))
    }

    fn check_owner<T: TxnValue>(&mut self, reference: &TxnRef<T>) -> StmResult<()> {
        if reference.stm().ptr_eq(&self.stm) {
            return Ok(());
        }
        self.abort();
        Err(StmError::IllegalArgument(format!(
            "[{}] reference {} belongs to a different stm",
            self.config.family_name,
            reference.id()
        )))
    }

    fn abort_on_error<R>(&mut self, result: StmResult<R>) -> StmResult<R> {
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn entry_mut<T: TxnValue>(&mut self, id: RefId) -> StmResult<&mut Tranlocal<T>> {
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or_else(|| PanicError::new(format!("no tranlocal for reference {id}")))?;
        Ok(downcast_mut::<T>(entry)?)
    }

    pub(crate) fn open_for_read<T: TxnValue>(
        &mut self,
        reference: &TxnRef<T>,
        lock_mode: LockMode,
    ) -> StmResult<&mut Tranlocal<T>> {
        self.ensure_open("read")?;
        self.check_owner(reference)?;
        let desired = lock_mode.max(self.config.read_lock_mode);
        if desired != LockMode::None {
            self.require_fat("explicit locking")?;
        }

        let result = self.open(reference, desired, TranlocalMode::Read);
        self.abort_on_error(result)?;
        self.entry_mut(reference.id())
    }

    pub(crate) fn open_for_write<T: TxnValue>(
        &mut self,
        reference: &TxnRef<T>,
        lock_mode: LockMode,
    ) -> StmResult<&mut Tranlocal<T>> {
        self.ensure_open("write")?;
        self.check_owner(reference)?;
        self.ensure_writable("write")?;
        let desired = lock_mode.max(self.config.write_lock_mode);
        if desired != LockMode::None {
            self.require_fat("explicit locking")?;
        }

        let result = self.open(reference, desired, TranlocalMode::Write);
        self.abort_on_error(result)?;
        self.has_writes = true;
        self.entry_mut(reference.id())
    }

    pub(crate) fn open_for_commute<T, F>(&mut self, reference: &TxnRef<T>, function: F) -> StmResult<()>
    where
        T: TxnValue,
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.ensure_open("commute")?;
        self.check_owner(reference)?;
        self.ensure_writable("commute")?;
        self.require_fat("commute")?;
        self.has_writes = true;

        let id = reference.id();
        if !self.entries.contains_key(&id) {
            let mut tranlocal = Tranlocal::commuting(reference.clone(), &self.config);
            tranlocal.commute.push(function);
            self.entries.insert(id, Box::new(tranlocal));
            return Ok(());
        }

        let config = self.config.clone();
        let result = self.entry_mut::<T>(id).and_then(|tranlocal| {
            match tranlocal.mode {
                TranlocalMode::Commuting => tranlocal.commute.push(function),
                TranlocalMode::Read | TranlocalMode::Write | TranlocalMode::Constructing => {
                    tranlocal.promote_to_write(&config);
                    let value = tranlocal
                        .value
                        .take()
                        .ok_or_else(|| PanicError::new("opened tranlocal has no value"))?;
                    tranlocal.value = Some(function(value));
                }
            }
            Ok(())
        });
        self.abort_on_error(result)
    }

    pub(crate) fn attach_constructed<T: TxnValue>(&mut self, reference: TxnRef<T>, value: T) {
        let id = reference.id();
        self.entries.insert(id, Box::new(Tranlocal::constructing(reference, value)));
        self.has_writes = true;
    }

    /// Lock mode this transaction holds on `reference`.
    pub(crate) fn lock_mode_of<T: TxnValue>(&mut self, reference: &TxnRef<T>) -> StmResult<LockMode> {
        self.ensure_open("get lock mode")?;
        Ok(self
            .entries
            .get(&reference.id())
            .map_or(LockMode::None, |entry| entry.lock_mode()))
    }

    /// Load a new entry or bring an existing one up to `mode` and `desired`.
    fn open<T: TxnValue>(&mut self, reference: &TxnRef<T>, desired: LockMode, mode: TranlocalMode) -> StmResult<()> {
        let id = reference.id();
        let spin = self.config.spin_count;
        let config = self.config.clone();

        if !self.has_reads {
            self.local_conflict_count = self.stm.conflict_counter().count();
            self.has_reads = true;
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            let tranlocal = downcast_mut::<T>(entry)?;
            if tranlocal.mode == TranlocalMode::Commuting {
                let loaded = reference
                    .inner()
                    .load(spin, desired, true)?
                    .ok_or(StmError::ReadWriteConflict)?;
                self.commit_conflict |= loaded.conflict;
                tranlocal.fixate(loaded, &config);
            } else if mode == TranlocalMode::Write {
                tranlocal.promote_to_write(&config);
            }

            if tranlocal.mode != TranlocalMode::Constructing
                && desired > tranlocal.lock_mode
                && !reference.inner().try_lock_and_check_conflict(
                    tranlocal,
                    spin,
                    desired,
                    &mut self.commit_conflict,
                )?
            {
                return Err(StmError::ReadWriteConflict);
            }
        } else {
            let arrive_needed = !config.readonly || config.track_reads;
            let loaded = reference
                .inner()
                .load(spin, desired, arrive_needed)?
                .ok_or(StmError::ReadWriteConflict)?;
            self.commit_conflict |= loaded.conflict;
            self.has_untracked_reads |= !arrive_needed;
            let tranlocal = Tranlocal::loaded(reference.clone(), mode, loaded, &config);
            self.entries.insert(id, Box::new(tranlocal));
        }

        if self.is_read_consistent() {
            Ok(())
        } else {
            Err(StmError::ReadWriteConflict)
        }
    }

    /// Revalidate every entry when some committer reported a conflict since the last check.
    fn is_read_consistent(&mut self) -> bool {
        if self.config.read_lock_mode != LockMode::None {
            return true;
        }
        let count = self.stm.conflict_counter().count();
        if count == self.local_conflict_count && !self.has_untracked_reads {
            return true;
        }
        self.local_conflict_count = count;
        !self.entries.values().any(|entry| entry.has_read_conflict())
    }

    /// Hang one fresh latch on every tracked entry and abort.
    ///
    /// The latch is returned when at least one registration happened.
    pub(crate) fn prepare_retry_wait(&mut self) -> StmResult<Arc<Latch>> {
        if !self.status.is_alive() {
            return Err(StmError::DeadTransaction {
                family: self.family(),
                operation: "retry",
                status: self.status,
            });
        }
        if !self.config.blocking_allowed {
            self.abort();
            return Err(StmError::RetryNotAllowed { family: self.family() });
        }

        let latch = Arc::new(Latch::new());
        let mut registered = false;
        for entry in self.entries.values_mut() {
            match entry.register_change_listener(&latch) {
                Registration::Done | Registration::NotNeeded => registered = true,
                Registration::None => {}
            }
        }
        self.abort();

        if registered {
            Ok(latch)
        } else {
            Err(StmError::NoRetryPossible { family: self.family() })
        }
    }

    /// Release everything and move to aborted. Never fails.
    ///
    /// Aborting an aborted transaction does nothing; aborting a committed one is
    /// logged and ignored.
    pub fn abort(&mut self) {
        match self.status {
            TxnStatus::Aborted => return,
            TxnStatus::Committed => {
                tracing::warn!(family = %self.config.family_name, "ignoring abort of a committed transaction");
                return;
            }
            TxnStatus::New | TxnStatus::Active | TxnStatus::Prepared => {}
        }

        for entry in self.entries.values_mut() {
            // Faults are logged where they are raised; an abort still releases the rest.
            let _ = entry.release_after_failure();
        }
        self.entries.clear();
        self.status = TxnStatus::Aborted;
        tracing::trace!(family = %self.config.family_name, attempt = self.attempt, "transaction aborted");

        self.post_commit_hooks.clear();
        for hook in std::mem::take(&mut self.post_abort_hooks) {
            hook();
        }
    }

    /// Start another attempt of the same transaction.
    ///
    /// Fails with [`StmError::TooManyRetries`] once the family's retry budget is spent.
    pub fn soft_reset(&mut self) -> StmResult<()> {
        if self.attempt > self.config.max_retries {
            self.abort();
            tracing::warn!(
                family = %self.config.family_name,
                max_retries = self.config.max_retries,
                "too many retries"
            );
            return Err(StmError::TooManyRetries {
                family: self.family(),
                max_retries: self.config.max_retries,
            });
        }
        self.restart();
        self.attempt += 1;
        Ok(())
    }

    /// Start over as if freshly created.
    pub fn hard_reset(&mut self) {
        self.restart();
        self.attempt = 1;
        self.remaining_timeout = self.config.timeout;
        self.fat = self.config.requires_fat();
    }

    /// Reset state for another attempt without touching the attempt counter.
    pub(crate) fn restart(&mut self) {
        self.abort();
        self.status = TxnStatus::New;
        self.has_writes = false;
        self.has_reads = false;
        self.has_untracked_reads = false;
        self.commit_conflict = false;
        self.abort_only = false;
        self.post_abort_hooks.clear();
        self.fat = self.fat || self.config.requires_fat();
    }
}
