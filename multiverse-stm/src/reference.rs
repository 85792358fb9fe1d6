//! Transactional references.
//!
//! A [`TxnRef`] is a shared cell: an orec, the committed version, the committed
//! value in a kovan-managed node, and the listeners of transactions blocked on
//! it. The committed value is only replaced under the orec's exclusive lock;
//! replaced nodes are handed to kovan's `retire` so concurrent readers that
//! pinned the old node can finish cloning it.

use crate::config::TxnConfig;
use crate::errors::{PanicError, StmError, StmResult};
use crate::latch::Latch;
use crate::listeners::{DetachedListeners, Listeners};
use crate::orec::{ArriveStatus, LockMode, Orec};
use crate::scope::TxnScope;
use crate::tranlocal::{Registration, Tranlocal, TranlocalMode};
use crate::transaction::Transaction;
use crate::Stm;
use kovan::{Atomic, RetiredNode, Shared, pin, retire};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Values a transactional reference can hold.
///
/// `PartialEq` drives the dirty check: a write of an equal value publishes nothing.
pub trait TxnValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> TxnValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Identity of a reference; transactions lock in ascending id order.
pub type RefId = u64;

/// Version of a reference that has never been committed.
pub(crate) const VERSION_UNCOMMITTED: u64 = 0;

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// Committed value node.
///
/// `RetiredNode` must stay the first field: kovan's `retire` reinterprets the
/// pointer as one.
#[repr(C)]
struct ValueNode<T> {
    header: RetiredNode,
    value: T,
}

impl<T> ValueNode<T> {
    fn boxed(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            header: RetiredNode::new(),
            value,
        }))
    }
}

/// Snapshot taken by a successful load.
pub(crate) struct Loaded<T> {
    pub(crate) value: T,
    pub(crate) version: u64,
    pub(crate) lock_mode: LockMode,
    pub(crate) depart_obligation: bool,
    pub(crate) conflict: bool,
}

pub(crate) struct RefInner<T> {
    id: RefId,
    stm: Stm,
    pub(crate) orec: Orec,
    version: AtomicU64,
    value: Atomic<ValueNode<T>>,
    listeners: Listeners,
}

// SAFETY: the value node is only reached through kovan's `Atomic` under a guard
// and replaced under the exclusive lock.
unsafe impl<T: Send + Sync> Send for RefInner<T> {}
unsafe impl<T: Send + Sync> Sync for RefInner<T> {}

impl<T> Drop for RefInner<T> {
    fn drop(&mut self) {
        let guard = pin();
        let node = self.value.load(Ordering::Acquire, &guard);
        if !node.is_null() {
            // SAFETY: the last handle is gone, nobody else can reach this node.
            unsafe { drop(Box::from_raw(node.as_raw())) };
        }
    }
}

impl<T: TxnValue> RefInner<T> {
    fn new(stm: Stm, value: Option<T>, version: u64) -> Self {
        let orec = Orec::new(stm.config().read_biased_threshold);
        let value = match value {
            Some(value) => Atomic::new(ValueNode::boxed(value)),
            None => Atomic::null(),
        };
        Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            stm,
            orec,
            version: AtomicU64::new(version),
            value,
            listeners: Listeners::new(),
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Clone of the committed value, `None` while never committed.
    fn read_committed(&self) -> Option<T> {
        let guard = pin();
        let node = self.value.load(Ordering::SeqCst, &guard);
        // SAFETY: the guard keeps a retired node alive until it is dropped.
        unsafe { node.as_ref().map(|node| node.value.clone()) }
    }

    /// Install a new committed value. The caller holds the exclusive lock.
    fn publish(&self, value: T, version: u64) -> DetachedListeners {
        let guard = pin();
        // SAFETY: freshly boxed node with `RetiredNode` at offset zero.
        let new = unsafe { Shared::from_raw(ValueNode::boxed(value)) };
        let old = self.value.swap(new, Ordering::SeqCst, &guard);
        if !old.is_null() {
            // SAFETY: `old` came from `Box::into_raw`, was unlinked by this swap
            // and is retired exactly once.
            unsafe { retire(old.as_raw()) };
        }
        self.version.store(version, Ordering::SeqCst);
        self.listeners.take()
    }

    /// Load value and version, arriving (or locking) on the orec.
    ///
    /// `Ok(None)` when the orec stayed locked for the whole spin.
    pub(crate) fn load(
        &self,
        spin: usize,
        lock_mode: LockMode,
        arrive_needed: bool,
    ) -> StmResult<Option<Loaded<T>>> {
        if lock_mode != LockMode::None {
            let status = self.orec.arrive_and_lock(spin, lock_mode)?;
            if !status.is_success() {
                return Ok(None);
            }
            let version = self.version();
            let Some(value) = self.read_committed() else {
                self.depart_after_failed_lock(status)?;
                return Err(StmError::UncommittedReadConflict);
            };
            return Ok(Some(Loaded {
                value,
                version,
                lock_mode,
                depart_obligation: !status.is_unregistered(),
                conflict: status.is_conflict(),
            }));
        }

        loop {
            let version = self.version();
            let Some(value) = self.read_committed() else {
                return Err(StmError::UncommittedReadConflict);
            };
            if self.version() != version {
                continue;
            }

            let status = if arrive_needed {
                self.orec.arrive(spin)?
            } else if self.orec.wait_for_exclusive_lock_to_become_free(spin) {
                ArriveStatus::SUCCESS | ArriveStatus::UNREGISTERED
            } else {
                ArriveStatus::FAILURE
            };

            if !status.is_success() {
                return Ok(None);
            }

            if self.version() == version {
                return Ok(Some(Loaded {
                    value,
                    version,
                    lock_mode: LockMode::None,
                    depart_obligation: !status.is_unregistered(),
                    conflict: false,
                }));
            }

            if !status.is_unregistered() {
                self.orec.depart_after_failure()?;
            }
        }
    }

    fn depart_after_failed_lock(&self, status: ArriveStatus) -> Result<(), PanicError> {
        if status.is_unregistered() {
            self.orec.unlock_by_unregistered()
        } else {
            self.orec.depart_after_failure_and_unlock()
        }
    }

    /// Raise the entry's lock to `desired`, checking the version did not move.
    pub(crate) fn try_lock_and_check_conflict(
        &self,
        tranlocal: &mut Tranlocal<T>,
        spin: usize,
        desired: LockMode,
        commit_conflict: &mut bool,
    ) -> Result<bool, PanicError> {
        let current = tranlocal.lock_mode;
        if current >= desired {
            return Ok(true);
        }

        match current {
            LockMode::None => {
                let expected = tranlocal.version;
                if self.version() != expected {
                    return Ok(false);
                }

                if tranlocal.depart_obligation {
                    let status = self.orec.try_lock_after_normal_arrive(spin, desired)?;
                    if !status.is_success() {
                        return Ok(false);
                    }
                    *commit_conflict |= status.is_conflict();
                    if self.version() != expected {
                        tranlocal.depart_obligation = false;
                        self.orec.depart_after_failure_and_unlock()?;
                        return Ok(false);
                    }
                } else {
                    let status = self.orec.arrive_and_lock(spin, desired)?;
                    if !status.is_success() {
                        return Ok(false);
                    }
                    tranlocal.lock_mode = desired;
                    tranlocal.depart_obligation = !status.is_unregistered();
                    *commit_conflict |= status.is_conflict();
                    if self.version() != expected {
                        return Ok(false);
                    }
                }

                tranlocal.lock_mode = desired;
                Ok(true)
            }
            LockMode::Read => {
                if !self.orec.try_upgrade_read_lock(spin, desired == LockMode::Exclusive)? {
                    return Ok(false);
                }
                if desired == LockMode::Exclusive {
                    let state = self.orec.snapshot();
                    *commit_conflict |= state.is_read_biased() || state.surplus() > 1;
                }
                tranlocal.lock_mode = desired;
                Ok(true)
            }
            LockMode::Write | LockMode::Exclusive => {
                *commit_conflict |= self.orec.upgrade_write_lock()?;
                tranlocal.lock_mode = LockMode::Exclusive;
                Ok(true)
            }
        }
    }

    pub(crate) fn has_read_conflict(&self, tranlocal: &Tranlocal<T>) -> bool {
        if tranlocal.lock_mode != LockMode::None {
            return false;
        }
        if matches!(tranlocal.mode, TranlocalMode::Commuting | TranlocalMode::Constructing) {
            return false;
        }
        if self.orec.has_exclusive_lock() {
            return true;
        }
        tranlocal.version != self.version()
    }

    pub(crate) fn prepare(
        &self,
        tranlocal: &mut Tranlocal<T>,
        config: &TxnConfig,
        commit_conflict: &mut bool,
    ) -> StmResult<bool> {
        let spin = config.spin_count();
        match tranlocal.mode {
            TranlocalMode::Constructing => return Ok(true),
            TranlocalMode::Read => {
                return if tranlocal.write_skew_check {
                    Ok(self.try_lock_and_check_conflict(tranlocal, spin, LockMode::Read, commit_conflict)?)
                } else {
                    Ok(true)
                };
            }
            TranlocalMode::Commuting => {
                let Some(loaded) = self.load(spin, LockMode::Exclusive, true)? else {
                    return Ok(false);
                };
                *commit_conflict |= loaded.conflict;
                tranlocal.fixate(loaded, config);
            }
            TranlocalMode::Write => {}
        }

        if !tranlocal.is_dirty() {
            return if tranlocal.write_skew_check {
                Ok(self.try_lock_and_check_conflict(tranlocal, spin, LockMode::Read, commit_conflict)?)
            } else {
                Ok(true)
            };
        }

        tranlocal.dirty = true;
        Ok(self.try_lock_and_check_conflict(tranlocal, spin, LockMode::Exclusive, commit_conflict)?)
    }

    pub(crate) fn commit(
        &self,
        tranlocal: &mut Tranlocal<T>,
        write_version: u64,
    ) -> Result<Option<DetachedListeners>, PanicError> {
        if !tranlocal.is_dirty() {
            self.release_after_reading(tranlocal)?;
            return Ok(None);
        }

        let Some(value) = tranlocal.value.take() else {
            return Err(PanicError::new("dirty tranlocal without a value at commit"));
        };
        tranlocal.origin = None;

        let listeners = self.publish(value, write_version);
        self.orec.depart_after_update_and_unlock()?;
        tranlocal.lock_mode = LockMode::None;
        tranlocal.depart_obligation = false;
        Ok((!listeners.is_empty()).then_some(listeners))
    }

    pub(crate) fn release_after_reading(&self, tranlocal: &mut Tranlocal<T>) -> Result<(), PanicError> {
        tranlocal.value = None;
        tranlocal.origin = None;

        if tranlocal.depart_obligation {
            if tranlocal.lock_mode != LockMode::None {
                self.orec.depart_after_reading_and_unlock()?;
            } else {
                self.orec.depart_after_reading()?;
            }
            tranlocal.depart_obligation = false;
        } else if tranlocal.lock_mode != LockMode::None {
            self.orec.unlock_by_unregistered()?;
        }
        tranlocal.lock_mode = LockMode::None;
        Ok(())
    }

    pub(crate) fn release_after_failure(&self, tranlocal: &mut Tranlocal<T>) -> Result<(), PanicError> {
        tranlocal.value = None;
        tranlocal.origin = None;
        drop(std::mem::take(&mut tranlocal.commute));

        if tranlocal.depart_obligation {
            if tranlocal.lock_mode != LockMode::None {
                self.orec.depart_after_failure_and_unlock()?;
            } else {
                self.orec.depart_after_failure()?;
            }
            tranlocal.depart_obligation = false;
        } else if tranlocal.lock_mode != LockMode::None {
            self.orec.unlock_by_unregistered()?;
        }
        tranlocal.lock_mode = LockMode::None;
        Ok(())
    }

    /// Hang `latch` on this reference unless the version the entry saw is already stale.
    pub(crate) fn register_change_listener(&self, tranlocal: &Tranlocal<T>, latch: &Arc<Latch>) -> Registration {
        if !tranlocal.tracked
            || matches!(tranlocal.mode, TranlocalMode::Commuting | TranlocalMode::Constructing)
        {
            return Registration::None;
        }

        let version = tranlocal.version;
        if version != self.version() {
            latch.open();
            return Registration::NotNeeded;
        }

        self.listeners.push(latch.clone());

        // A commit that stored its version before our push may already have
        // detached the listeners; it will not see this latch, nor the ones
        // the push held off the list while pruning.
        if version == self.version() {
            return Registration::Done;
        }

        self.listeners.take().open_all();
        Registration::NotNeeded
    }
}

/// Exclusive lock on a single reference held outside any transaction.
///
/// Atomic operations use it instead of allocating a transaction. Dropping the
/// token without publishing releases the lock as a failed arrival.
pub(crate) struct AnonymousLock<'a, T: TxnValue> {
    inner: &'a RefInner<T>,
    status: ArriveStatus,
    held: bool,
}

impl<'a, T: TxnValue> AnonymousLock<'a, T> {
    fn acquire(inner: &'a RefInner<T>, operation: &'static str) -> StmResult<Self> {
        let config = inner.stm.config();
        for attempt in 0..=config.max_retries {
            let status = inner.orec.arrive_and_exclusive_lock(config.spin_count)?;
            if status.is_success() {
                return Ok(Self {
                    inner,
                    status,
                    held: true,
                });
            }
            config.backoff.backoff(attempt + 1);
        }
        tracing::warn!(reference = inner.id, operation, "exclusive lock stayed unavailable");
        Err(StmError::LockedReference {
            operation,
            reference: inner.id,
        })
    }

    fn current(&self) -> StmResult<T> {
        self.inner
            .read_committed()
            .ok_or(StmError::UncommittedReadConflict)
    }

    /// Release without changing the value.
    fn release_unchanged(mut self) -> Result<(), PanicError> {
        self.held = false;
        if self.status.is_unregistered() {
            self.inner.orec.unlock_by_unregistered()
        } else {
            self.inner.orec.depart_after_reading_and_unlock()
        }
    }

    fn publish(mut self, value: T) -> Result<(), PanicError> {
        self.held = false;
        if self.status.is_conflict() {
            self.inner.stm.conflict_counter().signal_conflict();
        }
        let version = self.inner.stm.clock().tick();
        let listeners = self.inner.publish(value, version);
        self.inner.orec.depart_after_update_and_unlock()?;
        listeners.open_all();
        Ok(())
    }
}

impl<T: TxnValue> Drop for AnonymousLock<'_, T> {
    fn drop(&mut self) {
        if self.held
            && let Err(fault) = self.inner.orec.depart_after_failure_and_unlock()
        {
            tracing::error!(reference = self.inner.id, %fault, "releasing anonymous lock failed");
        }
    }
}

/// Shared transactional cell.
///
/// Cloning is cheap and yields a handle to the same cell.
pub struct TxnRef<T: TxnValue> {
    inner: Arc<RefInner<T>>,
}

impl<T: TxnValue> Clone for TxnRef<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: TxnValue + fmt::Debug> fmt::Debug for TxnRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnRef")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version())
            .field("value", &self.inner.read_committed())
            .field("orec", &self.inner.orec)
            .finish()
    }
}

impl<T: TxnValue> TxnRef<T> {
    /// Create a committed reference owned by `stm`.
    pub fn new(stm: &Stm, value: T) -> Self {
        Self {
            inner: Arc::new(RefInner::new(stm.clone(), Some(value), stm.clock().now())),
        }
    }

    /// Create a reference inside `tx`. It becomes visible when `tx` commits;
    /// until then other transactions fail to read it with an uncommitted read conflict.
    pub fn new_in(tx: &mut Transaction, value: T) -> StmResult<Self> {
        tx.ensure_open("construct a reference")?;
        tx.ensure_writable("construct a reference")?;
        tx.require_fat("construction")?;
        let inner = RefInner::new(tx.stm().clone(), None, VERSION_UNCOMMITTED);
        let status = inner.orec.arrive_and_exclusive_lock(0)?;
        if !status.is_success() {
            return Err(PanicError::on_orec("fresh orec refused its first lock", inner.orec.snapshot()).into());
        }
        let reference = Self {
            inner: Arc::new(inner),
        };
        tx.attach_constructed(reference.clone(), value);
        Ok(reference)
    }

    pub(crate) fn inner(&self) -> &RefInner<T> {
        &self.inner
    }

    pub fn id(&self) -> RefId {
        self.inner.id
    }

    pub fn stm(&self) -> &Stm {
        &self.inner.stm
    }

    /// Committed version, zero when never committed.
    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ---- transactional ---------------------------------------------------

    pub fn get(&self, tx: &mut Transaction) -> StmResult<T> {
        let tranlocal = tx.open_for_read(self, LockMode::None)?;
        tranlocal
            .value
            .clone()
            .ok_or_else(|| PanicError::new("opened tranlocal has no value").into())
    }

    pub fn set(&self, tx: &mut Transaction, value: T) -> StmResult<()> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        tranlocal.value = Some(value);
        Ok(())
    }

    /// Write `value` and return the previous one.
    pub fn get_and_set(&self, tx: &mut Transaction, value: T) -> StmResult<T> {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        tranlocal
            .value
            .replace(value)
            .ok_or_else(|| PanicError::new("opened tranlocal has no value").into())
    }

    pub fn alter_and_get<F>(&self, tx: &mut Transaction, function: F) -> StmResult<T>
    where
        F: FnOnce(T) -> T,
    {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let Some(old) = tranlocal.value.take() else {
            return Err(PanicError::new("opened tranlocal has no value").into());
        };
        let new = function(old);
        tranlocal.value = Some(new.clone());
        Ok(new)
    }

    pub fn get_and_alter<F>(&self, tx: &mut Transaction, function: F) -> StmResult<T>
    where
        F: FnOnce(T) -> T,
    {
        let tranlocal = tx.open_for_write(self, LockMode::None)?;
        let Some(old) = tranlocal.value.take() else {
            return Err(PanicError::new("opened tranlocal has no value").into());
        };
        tranlocal.value = Some(function(old.clone()));
        Ok(old)
    }

    /// Apply `function` at commit without reading the current value now.
    ///
    /// Two transactions commuting on the same reference don't conflict as
    /// long as neither also reads it.
    pub fn commute<F>(&self, tx: &mut Transaction, function: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        tx.open_for_commute(self, function)
    }

    /// Block (through a retry) until the value equals `expected`.
    pub fn await_value(&self, tx: &mut Transaction, expected: &T) -> StmResult<()> {
        if self.get(tx)? != *expected {
            return Err(StmError::Retry);
        }
        Ok(())
    }

    /// Block (through a retry) until `predicate` holds for the value.
    pub fn await_until<P>(&self, tx: &mut Transaction, predicate: P) -> StmResult<()>
    where
        P: FnOnce(&T) -> bool,
    {
        if !predicate(&self.get(tx)?) {
            return Err(StmError::Retry);
        }
        Ok(())
    }

    /// Protect this reference against write skew: it is read locked and
    /// validated at commit even when the transaction allows write skew.
    pub fn ensure(&self, tx: &mut Transaction) -> StmResult<()> {
        tx.require_fat("ensure")?;
        if tx.config().is_readonly() {
            return Ok(());
        }
        let tranlocal = tx.open_for_read(self, LockMode::None)?;
        tranlocal.write_skew_check = true;
        Ok(())
    }

    /// Pessimistically lock this reference for the rest of the transaction.
    pub fn acquire(&self, tx: &mut Transaction, mode: LockMode) -> StmResult<()> {
        tx.require_fat("explicit locking")?;
        tx.open_for_read(self, mode)?;
        Ok(())
    }

    /// Lock mode `tx` holds on this reference.
    pub fn lock_mode(&self, tx: &mut Transaction) -> StmResult<LockMode> {
        tx.lock_mode_of(self)
    }

    // ---- atomic ----------------------------------------------------------

    /// Read the committed value, waiting out a concurrent commit.
    pub fn atomic_get(&self) -> StmResult<T> {
        let config = self.inner.stm.config();
        for attempt in 1..=config.spin_count.max(1) {
            if !self.inner.orec.has_exclusive_lock() {
                let value = self
                    .inner
                    .read_committed()
                    .ok_or(StmError::UncommittedReadConflict)?;
                if !self.inner.orec.has_exclusive_lock() {
                    return Ok(value);
                }
            }
            config.backoff.backoff(attempt);
        }
        Err(StmError::LockedReference {
            operation: "atomic_get",
            reference: self.inner.id,
        })
    }

    /// Read the committed value without regard for locks.
    pub fn atomic_weak_get(&self) -> StmResult<T> {
        self.inner
            .read_committed()
            .ok_or(StmError::UncommittedReadConflict)
    }

    pub fn atomic_set(&self, value: T) -> StmResult<()> {
        self.atomic_get_and_set(value).map(drop)
    }

    pub fn atomic_get_and_set(&self, value: T) -> StmResult<T> {
        let lock = AnonymousLock::acquire(&self.inner, "atomic_set")?;
        let old = lock.current()?;
        if old == value {
            lock.release_unchanged()?;
        } else {
            lock.publish(value)?;
        }
        Ok(old)
    }

    /// Replace the value with `new` only if it currently equals `expected`.
    pub fn atomic_compare_and_set(&self, expected: &T, new: T) -> StmResult<bool> {
        let lock = AnonymousLock::acquire(&self.inner, "atomic_compare_and_set")?;
        let current = lock.current()?;
        if current != *expected {
            return Ok(false);
        }
        if current == new {
            lock.release_unchanged()?;
        } else {
            lock.publish(new)?;
        }
        Ok(true)
    }

    pub fn atomic_alter_and_get<F>(&self, function: F) -> StmResult<T>
    where
        F: FnOnce(T) -> T,
    {
        let lock = AnonymousLock::acquire(&self.inner, "atomic_alter")?;
        let old = lock.current()?;
        let new = function(old.clone());
        if new == old {
            lock.release_unchanged()?;
        } else {
            lock.publish(new.clone())?;
        }
        Ok(new)
    }

    pub fn atomic_get_and_alter<F>(&self, function: F) -> StmResult<T>
    where
        F: FnOnce(T) -> T,
    {
        let lock = AnonymousLock::acquire(&self.inner, "atomic_alter")?;
        let old = lock.current()?;
        let new = function(old.clone());
        if new == old {
            lock.release_unchanged()?;
        } else {
            lock.publish(new)?;
        }
        Ok(old)
    }

    /// Lock mode currently held on the orec by anyone.
    pub fn atomic_lock_mode(&self) -> LockMode {
        self.inner.orec.lock_mode()
    }

    // ---- scoped ----------------------------------------------------------

    /// Read through the scope's transaction, or atomically when there is none.
    pub fn get_in(&self, scope: &mut TxnScope) -> StmResult<T> {
        match scope.get() {
            Some(tx) => self.get(tx),
            None => self.atomic_get(),
        }
    }

    /// Write through the scope's transaction, or atomically when there is none.
    pub fn set_in(&self, scope: &mut TxnScope, value: T) -> StmResult<()> {
        match scope.get() {
            Some(tx) => self.set(tx, value),
            None => self.atomic_set(value),
        }
    }

    pub fn alter_and_get_in<F>(&self, scope: &mut TxnScope, function: F) -> StmResult<T>
    where
        F: FnOnce(T) -> T,
    {
        match scope.get() {
            Some(tx) => self.alter_and_get(tx, function),
            None => self.atomic_alter_and_get(function),
        }
    }

    /// `ensure` has no atomic counterpart and needs the scope's transaction.
    pub fn ensure_in(&self, scope: &mut TxnScope) -> StmResult<()> {
        let tx = scope
            .get()
            .ok_or(StmError::TransactionRequired { operation: "ensure" })?;
        self.ensure(tx)
    }

    pub fn await_value_in(&self, scope: &mut TxnScope, expected: &T) -> StmResult<()> {
        let tx = scope
            .get()
            .ok_or(StmError::TransactionRequired { operation: "await" })?;
        self.await_value(tx, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_reference_is_committed() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 5u32);
        assert_ne!(r.version(), VERSION_UNCOMMITTED);
        assert_eq!(r.atomic_get().unwrap(), 5);
        assert_eq!(r.atomic_lock_mode(), LockMode::None);
    }

    #[test]
    fn ids_are_unique_and_clones_share_identity() {
        let stm = Stm::new();
        let a = TxnRef::new(&stm, 1u8);
        let b = TxnRef::new(&stm, 1u8);
        assert_ne!(a.id(), b.id());
        let a2 = a.clone();
        assert!(a.ptr_eq(&a2));
        assert_eq!(a.id(), a2.id());
    }

    #[test]
    fn atomic_set_bumps_version_only_on_change() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, String::from("a"));
        let before = r.version();

        assert_eq!(r.atomic_get_and_set("a".to_string()).unwrap(), "a");
        assert_eq!(r.version(), before);

        r.atomic_set("b".to_string()).unwrap();
        assert!(r.version() > before);
        assert_eq!(r.atomic_get().unwrap(), "b");
        assert_eq!(r.inner().orec.snapshot(), Default::default());
    }

    #[test]
    fn atomic_compare_and_set() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 10i64);
        assert!(!r.atomic_compare_and_set(&11, 12).unwrap());
        assert_eq!(r.atomic_get().unwrap(), 10);
        assert!(r.atomic_compare_and_set(&10, 12).unwrap());
        assert_eq!(r.atomic_get().unwrap(), 12);
        assert_eq!(r.atomic_lock_mode(), LockMode::None);
        assert_eq!(r.inner().orec.surplus(), 0);
    }

    #[test]
    fn dropped_anonymous_lock_releases_orec() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 3i64);
        let before = r.version();
        {
            let lock = AnonymousLock::acquire(r.inner(), "test").unwrap();
            assert_eq!(lock.current().unwrap(), 3);
            assert_eq!(r.atomic_lock_mode(), LockMode::Exclusive);
        }
        assert_eq!(r.atomic_lock_mode(), LockMode::None);
        assert_eq!(r.inner().orec.surplus(), 0);
        assert_eq!(r.version(), before);
    }

    #[test]
    fn dropped_anonymous_lock_survives_release_fault() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 3i64);
        let lock = AnonymousLock::acquire(r.inner(), "test").unwrap();
        // released behind the token's back, so its own release faults
        r.inner().orec.depart_after_failure_and_unlock().unwrap();
        drop(lock);
        assert_eq!(r.atomic_lock_mode(), LockMode::None);
        assert_eq!(r.atomic_get().unwrap(), 3);
    }

    #[test]
    fn atomic_alter() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, vec![1, 2]);
        let new = r
            .atomic_alter_and_get(|mut v| {
                v.push(3);
                v
            })
            .unwrap();
        assert_eq!(new, vec![1, 2, 3]);
        let old = r.atomic_get_and_alter(|_| Vec::new()).unwrap();
        assert_eq!(old, vec![1, 2, 3]);
        assert!(r.atomic_get().unwrap().is_empty());
    }

    #[test]
    fn atomic_set_opens_listeners() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 0i32);
        let latch = Arc::new(Latch::new());
        r.inner().listeners.push(latch.clone());
        r.atomic_set(1).unwrap();
        assert!(latch.is_open());
        assert!(r.inner().listeners.is_empty());
    }

    #[test]
    fn atomic_get_fails_while_exclusively_locked() {
        let stm = Stm::with_config(crate::StmConfig {
            spin_count: 2,
            backoff: Arc::new(crate::NoBackoff),
            ..Default::default()
        })
        .unwrap();
        let r = TxnRef::new(&stm, 1u64);
        r.inner().orec.arrive_and_exclusive_lock(0).unwrap();
        assert!(matches!(
            r.atomic_get(),
            Err(StmError::LockedReference { .. })
        ));
        assert_eq!(r.atomic_weak_get().unwrap(), 1);
    }
}
