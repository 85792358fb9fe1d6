use crate::config::TxnConfig;
use crate::errors::{PanicError, StmResult};
use crate::latch::Latch;
use crate::listeners::DetachedListeners;
use crate::orec::LockMode;
use crate::reference::{Loaded, TxnRef, TxnValue};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// How a transaction currently uses a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranlocalMode {
    Read,
    Write,
    /// Only deferred functions, no value has been loaded.
    Commuting,
    /// The reference was created by this transaction and has never been committed.
    Constructing,
}

/// Deferred functions of a commuting write, applied in registration order.
pub struct CommuteLog<T> {
    functions: Vec<Box<dyn FnOnce(T) -> T + Send>>,
}

impl<T> Default for CommuteLog<T> {
    fn default() -> Self {
        Self {
            functions: Vec::new(),
        }
    }
}

impl<T> fmt::Debug for CommuteLog<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommuteLog")
            .field("pending", &self.functions.len())
            .finish()
    }
}

impl<T> CommuteLog<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F>(&mut self, function: F)
    where
        F: FnOnce(T) -> T + Send + 'static,
    {
        self.functions.push(Box::new(function));
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Apply every deferred function to `base`.
    pub fn fixate(self, base: T) -> T {
        self.functions.into_iter().fold(base, |value, function| function(value))
    }
}

/// Registration outcome of a retry latch on one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Registration {
    /// Nothing to wait on for this entry.
    None,
    /// The latch sits in the reference's listeners.
    Done,
    /// The reference already changed and the latch was opened.
    NotNeeded,
}

/// Transaction-local view of one reference.
pub(crate) struct Tranlocal<T: TxnValue> {
    pub(crate) owner: TxnRef<T>,
    pub(crate) mode: TranlocalMode,
    pub(crate) value: Option<T>,
    /// Value as loaded, kept once the entry is opened for writing.
    pub(crate) origin: Option<T>,
    /// Committed version the value was derived from.
    pub(crate) version: u64,
    pub(crate) lock_mode: LockMode,
    pub(crate) depart_obligation: bool,
    /// Set when dirtiness is decided without comparing values.
    pub(crate) dirty: bool,
    /// Take a read lock at prepare, even when write skew is allowed.
    pub(crate) write_skew_check: bool,
    /// Counts as a dependency for blocking retries.
    pub(crate) tracked: bool,
    pub(crate) commute: CommuteLog<T>,
}

impl<T: TxnValue> Tranlocal<T> {
    pub(crate) fn loaded(owner: TxnRef<T>, mode: TranlocalMode, loaded: Loaded<T>, config: &TxnConfig) -> Self {
        let origin = (mode == TranlocalMode::Write).then(|| loaded.value.clone());
        Self {
            owner,
            mode,
            value: Some(loaded.value),
            origin,
            version: loaded.version,
            lock_mode: loaded.lock_mode,
            depart_obligation: loaded.depart_obligation,
            dirty: mode == TranlocalMode::Write && !config.dirty_check(),
            write_skew_check: !config.is_write_skew_allowed(),
            tracked: config.is_track_reads(),
            commute: CommuteLog::new(),
        }
    }

    pub(crate) fn commuting(owner: TxnRef<T>, config: &TxnConfig) -> Self {
        Self {
            owner,
            mode: TranlocalMode::Commuting,
            value: None,
            origin: None,
            version: 0,
            lock_mode: LockMode::None,
            depart_obligation: false,
            dirty: false,
            write_skew_check: !config.is_write_skew_allowed(),
            tracked: false,
            commute: CommuteLog::new(),
        }
    }

    pub(crate) fn constructing(owner: TxnRef<T>, value: T) -> Self {
        Self {
            owner,
            mode: TranlocalMode::Constructing,
            value: Some(value),
            origin: None,
            version: 0,
            lock_mode: LockMode::Exclusive,
            depart_obligation: true,
            dirty: true,
            write_skew_check: false,
            tracked: false,
            commute: CommuteLog::new(),
        }
    }

    /// Turn a commuting entry into a concrete write on top of `loaded`.
    pub(crate) fn fixate(&mut self, loaded: Loaded<T>, config: &TxnConfig) {
        let commute = std::mem::take(&mut self.commute);
        self.origin = Some(loaded.value.clone());
        self.value = Some(commute.fixate(loaded.value));
        self.version = loaded.version;
        self.lock_mode = loaded.lock_mode;
        self.depart_obligation = loaded.depart_obligation;
        self.dirty = !config.dirty_check();
        self.tracked = config.is_track_reads();
        self.mode = TranlocalMode::Write;
    }

    /// Promote a read entry to a write entry in place.
    pub(crate) fn promote_to_write(&mut self, config: &TxnConfig) {
        if self.mode == TranlocalMode::Read {
            self.origin = self.value.clone();
            self.dirty = !config.dirty_check();
            self.mode = TranlocalMode::Write;
        }
    }

    pub(crate) fn is_dirty(&self) -> bool {
        match self.mode {
            TranlocalMode::Read => false,
            TranlocalMode::Constructing => true,
            TranlocalMode::Commuting => !self.commute.is_empty(),
            TranlocalMode::Write => self.dirty || self.value != self.origin,
        }
    }
}

/// Type-erased operations the transaction runs over its entries.
pub(crate) trait TranlocalEntry: Send {
    fn as_any_mut(&mut self) -> &mut dyn Any;

    fn lock_mode(&self) -> LockMode;

    fn is_dirty(&self) -> bool;

    fn has_read_conflict(&self) -> bool;

    /// Lock and validate for commit. `Ok(false)` is a conflict.
    fn prepare(&mut self, config: &TxnConfig, commit_conflict: &mut bool) -> StmResult<bool>;

    /// Publish (dirty) or release (clean). Requires a successful prepare.
    fn commit(&mut self, write_version: u64) -> Result<Option<DetachedListeners>, PanicError>;

    fn release_after_reading(&mut self) -> Result<(), PanicError>;

    fn release_after_failure(&mut self) -> Result<(), PanicError>;

    fn register_change_listener(&mut self, latch: &Arc<Latch>) -> Registration;
}

impl<T: TxnValue> TranlocalEntry for Tranlocal<T> {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    fn is_dirty(&self) -> bool {
        Tranlocal::is_dirty(self)
    }

    fn has_read_conflict(&self) -> bool {
        self.owner.inner().has_read_conflict(self)
    }

    fn prepare(&mut self, config: &TxnConfig, commit_conflict: &mut bool) -> StmResult<bool> {
        let owner = self.owner.clone();
        owner.inner().prepare(self, config, commit_conflict)
    }

    fn commit(&mut self, write_version: u64) -> Result<Option<DetachedListeners>, PanicError> {
        let owner = self.owner.clone();
        owner.inner().commit(self, write_version)
    }

    fn release_after_reading(&mut self) -> Result<(), PanicError> {
        let owner = self.owner.clone();
        owner.inner().release_after_reading(self)
    }

    fn release_after_failure(&mut self) -> Result<(), PanicError> {
        let owner = self.owner.clone();
        owner.inner().release_after_failure(self)
    }

    fn register_change_listener(&mut self, latch: &Arc<Latch>) -> Registration {
        self.owner.inner().register_change_listener(self, latch)
    }
}

/// Downcast a stored entry back to its concrete tranlocal.
pub(crate) fn downcast_mut<T: TxnValue>(
    entry: &mut Box<dyn TranlocalEntry>,
) -> Result<&mut Tranlocal<T>, PanicError> {
    entry
        .as_any_mut()
        .downcast_mut::<Tranlocal<T>>()
        .ok_or_else(|| PanicError::new("tranlocal stored under a reference id has a different value type"))
}
