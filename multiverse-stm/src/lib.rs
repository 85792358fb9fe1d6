//! Software transactional memory with ownership records.
//!
//! # Architecture
//!
//! Every [`TxnRef`] carries an *orec*: one atomic word holding the reference's
//! lock state (read, write and exclusive locks), the number of transactions
//! depending on it (the *surplus*) and a read-bias mode for references that are
//! almost never written.
//!
//! - **Reads**: optimistic. A transaction arrives on the orec, snapshots value
//!   and version, and keeps the copy in its read/write set. Reads stay
//!   consistent through a global conflict counter: writers that overwrite a
//!   reference somebody depends on bump it, and readers revalidate when it moved.
//! - **Writes**: buffered in the transaction. At commit, entries are locked in
//!   reference-id order, validated, and published under one version from the
//!   [`VersionClock`].
//! - **Commuting writes**: deferred functions that are fixated at commit under
//!   the exclusive lock, so two commuting increments don't conflict.
//! - **Blocking retry**: returning [`retry()`] parks the attempt on a latch
//!   registered with every reference it read until one of them changes.
//! - **Reclamation**: replaced values are handed to kovan's `retire`, so readers
//!   never block writers.
//!
//! ```
//! use multiverse_stm::Stm;
//!
//! let stm = Stm::new();
//! let from = stm.new_long(100);
//! let to = stm.new_long(0);
//!
//! stm.atomically(|tx| {
//!     from.decrement(tx, 30)?;
//!     to.increment(tx, 30)
//! })
//! .unwrap();
//!
//! assert_eq!(from.atomic_get().unwrap(), 70);
//! assert_eq!(to.atomic_get().unwrap(), 30);
//! ```

mod backoff;
mod clock;
mod commit;
mod config;
mod errors;
mod executor;
mod latch;
mod listeners;
mod orec;
mod reference;
mod refs;
mod scope;
mod tranlocal;
mod transaction;

pub use backoff::{BackoffPolicy, ExponentialBackoffPolicy, NoBackoff};
pub use clock::{GlobalConflictCounter, LocalVersionClock, VersionClock};
pub use config::{
    IsolationLevel, SpeculativeConfig, StmConfig, TransactionFactory, TransactionFactoryBuilder,
    TxnConfig,
};
pub use errors::{PanicError, StmError, StmResult, retry};
pub use executor::AtomicBlock;
pub use latch::{Interruptor, Latch, LatchWait};
pub use orec::{ArriveStatus, LockMode, Orec, OrecState};
pub use reference::{RefId, TxnRef, TxnValue};
pub use refs::{TxnDouble, TxnInteger, TxnLong};
pub use scope::TxnScope;
pub use tranlocal::{CommuteLog, TranlocalMode};
pub use transaction::{Transaction, TxnStatus};

use std::fmt;
use std::sync::Arc;

struct StmInner {
    config: StmConfig,
    clock: Arc<dyn VersionClock>,
    conflicts: GlobalConflictCounter,
    /// Family used by [`Stm::atomically`]; shared so its speculative state persists.
    default_txn_config: Arc<TxnConfig>,
}

/// The runtime: clock, conflict counter and defaults shared by its references.
///
/// Cloning is cheap and yields a handle to the same runtime. References of one
/// runtime can't be used in transactions of another.
#[derive(Clone)]
pub struct Stm {
    inner: Arc<StmInner>,
}

impl fmt::Debug for Stm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stm")
            .field("version", &self.inner.clock.now())
            .field("conflicts", &self.inner.conflicts.count())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Default for Stm {
    fn default() -> Self {
        Self::new()
    }
}

impl Stm {
    /// Runtime with the default configuration and a local clock.
    pub fn new() -> Self {
        Self::build(StmConfig::default(), Arc::new(LocalVersionClock::new()))
    }

    pub fn with_config(config: StmConfig) -> StmResult<Self> {
        Self::with_clock(config, Arc::new(LocalVersionClock::new()))
    }

    pub fn with_clock(config: StmConfig, clock: Arc<dyn VersionClock>) -> StmResult<Self> {
        config.validate()?;
        Ok(Self::build(config, clock))
    }

    fn build(config: StmConfig, clock: Arc<dyn VersionClock>) -> Self {
        let default_txn_config = Arc::new(TxnConfig::from_stm(&config));
        tracing::debug!(
            spin_count = config.spin_count,
            read_biased_threshold = config.read_biased_threshold,
            max_retries = config.max_retries,
            "stm created"
        );
        Self {
            inner: Arc::new(StmInner {
                config,
                clock,
                conflicts: GlobalConflictCounter::new(),
                default_txn_config,
            }),
        }
    }

    pub fn config(&self) -> &StmConfig {
        &self.inner.config
    }

    pub fn clock(&self) -> &dyn VersionClock {
        &*self.inner.clock
    }

    pub fn conflict_counter(&self) -> &GlobalConflictCounter {
        &self.inner.conflicts
    }

    /// Whether both handles point at the same runtime.
    pub fn ptr_eq(&self, other: &Stm) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn factory_builder(&self) -> TransactionFactoryBuilder {
        TransactionFactoryBuilder::new(self.clone())
    }

    /// Transaction of the default family, for manual commit and abort.
    pub fn new_transaction(&self) -> Transaction {
        self.default_factory().new_transaction()
    }

    fn default_factory(&self) -> TransactionFactory {
        TransactionFactory {
            stm: self.clone(),
            config: self.inner.default_txn_config.clone(),
        }
    }

    /// Execute a closure atomically in the default family.
    ///
    /// Conflicts and retries are handled by restarting the closure; see
    /// [`AtomicBlock`] for the details.
    ///
    /// # Example
    ///
    /// ```
    /// use multiverse_stm::Stm;
    /// let stm = Stm::new();
    /// let var = stm.new_ref(10);
    ///
    /// let doubled = stm.atomically(|tx| var.alter_and_get(tx, |v| v * 2)).unwrap();
    /// assert_eq!(doubled, 20);
    /// ```
    pub fn atomically<R, F>(&self, f: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        AtomicBlock::new(self.default_factory()).execute(f)
    }

    /// Like [`atomically`](Self::atomically), joining the scope's live transaction if it has one.
    pub fn atomically_in<R, F>(&self, scope: &mut TxnScope, f: F) -> StmResult<R>
    where
        F: FnMut(&mut TxnScope) -> StmResult<R>,
    {
        AtomicBlock::new(self.default_factory()).execute_in(scope, f)
    }

    pub fn new_ref<T: TxnValue>(&self, value: T) -> TxnRef<T> {
        TxnRef::new(self, value)
    }

    pub fn new_long(&self, value: i64) -> TxnLong {
        TxnLong::new(self, value)
    }

    pub fn new_integer(&self, value: i32) -> TxnInteger {
        TxnInteger::new(self, value)
    }

    pub fn new_double(&self, value: f64) -> TxnDouble {
        TxnDouble::new(self, value)
    }
}
