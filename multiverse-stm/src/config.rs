//! Configuration of the runtime and of transaction families.

use crate::backoff::{BackoffPolicy, ExponentialBackoffPolicy};
use crate::errors::{StmError, StmResult};
use crate::executor::AtomicBlock;
use crate::latch::Interruptor;
use crate::orec::{DEFAULT_READ_BIASED_THRESHOLD, LockMode, MAX_READ_BIASED_THRESHOLD};
use crate::transaction::Transaction;
use crate::Stm;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Isolation a transaction family commits under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Reads are not locked at commit, so write skew can occur.
    #[default]
    Snapshot,
    /// Every read entry is read locked and revalidated at commit.
    Serializable,
}

impl IsolationLevel {
    pub fn allows_write_skew(self) -> bool {
        matches!(self, IsolationLevel::Snapshot)
    }
}

/// Runtime-wide settings, and the defaults every transaction family starts from.
#[derive(Debug, Clone)]
pub struct StmConfig {
    /// Times an orec operation spins on a conflicting lock before giving up.
    pub spin_count: usize,
    /// Readonly departs in a row that flip an orec to read-biased.
    pub read_biased_threshold: u32,
    pub max_retries: usize,
    pub isolation_level: IsolationLevel,
    pub dirty_check: bool,
    pub track_reads: bool,
    pub blocking_allowed: bool,
    pub speculative_config_enabled: bool,
    pub backoff: Arc<dyn BackoffPolicy>,
    /// Total time an atomic block may spend blocked in retries.
    pub timeout: Option<Duration>,
}

impl Default for StmConfig {
    fn default() -> Self {
        Self {
            spin_count: 64,
            read_biased_threshold: DEFAULT_READ_BIASED_THRESHOLD,
            max_retries: 1000,
            isolation_level: IsolationLevel::default(),
            dirty_check: true,
            track_reads: true,
            blocking_allowed: true,
            speculative_config_enabled: true,
            backoff: Arc::new(ExponentialBackoffPolicy::default()),
            timeout: None,
        }
    }
}

impl StmConfig {
    pub fn validate(&self) -> StmResult<()> {
        if self.read_biased_threshold == 0 || self.read_biased_threshold > MAX_READ_BIASED_THRESHOLD {
            return Err(StmError::IllegalArgument(format!(
                "read biased threshold must be in 1..={MAX_READ_BIASED_THRESHOLD}, got {}",
                self.read_biased_threshold
            )));
        }
        Ok(())
    }
}

/// What a factory learned about its transactions at runtime.
///
/// Shared by every transaction of a factory. Once a lean transaction hits a
/// feature it doesn't support, all later ones start fat.
#[derive(Debug, Default)]
pub struct SpeculativeConfig {
    fat_required: AtomicBool,
}

impl SpeculativeConfig {
    pub fn is_fat_required(&self) -> bool {
        self.fat_required.load(Ordering::Acquire)
    }

    pub(crate) fn signal_fat_required(&self) {
        if !self.fat_required.swap(true, Ordering::AcqRel) {
            tracing::debug!("speculative configuration upgraded to fat transactions");
        }
    }
}

/// Immutable settings of one transaction family.
#[derive(Clone)]
pub struct TxnConfig {
    pub(crate) family_name: Arc<str>,
    pub(crate) readonly: bool,
    pub(crate) track_reads: bool,
    pub(crate) blocking_allowed: bool,
    pub(crate) max_retries: usize,
    pub(crate) timeout: Option<Duration>,
    pub(crate) isolation_level: IsolationLevel,
    pub(crate) dirty_check: bool,
    pub(crate) spin_count: usize,
    pub(crate) read_lock_mode: LockMode,
    pub(crate) write_lock_mode: LockMode,
    pub(crate) backoff: Arc<dyn BackoffPolicy>,
    pub(crate) interruptor: Option<Arc<Interruptor>>,
    pub(crate) speculative: Arc<SpeculativeConfig>,
    pub(crate) speculative_enabled: bool,
}

impl fmt::Debug for TxnConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxnConfig")
            .field("family_name", &self.family_name)
            .field("readonly", &self.readonly)
            .field("isolation_level", &self.isolation_level)
            .field("max_retries", &self.max_retries)
            .field("timeout", &self.timeout)
            .field("read_lock_mode", &self.read_lock_mode)
            .field("write_lock_mode", &self.write_lock_mode)
            .field("interruptible", &self.interruptor.is_some())
            .field("fat_required", &self.speculative.is_fat_required())
            .finish_non_exhaustive()
    }
}

impl TxnConfig {
    pub(crate) fn from_stm(config: &StmConfig) -> Self {
        Self {
            family_name: Arc::from("anonymous"),
            readonly: false,
            track_reads: config.track_reads,
            blocking_allowed: config.blocking_allowed,
            max_retries: config.max_retries,
            timeout: config.timeout,
            isolation_level: config.isolation_level,
            dirty_check: config.dirty_check,
            spin_count: config.spin_count,
            read_lock_mode: LockMode::None,
            write_lock_mode: LockMode::None,
            backoff: config.backoff.clone(),
            interruptor: None,
            speculative: Arc::new(SpeculativeConfig::default()),
            speculative_enabled: config.speculative_config_enabled,
        }
    }

    pub fn validate(&self) -> StmResult<()> {
        if self.readonly && self.write_lock_mode != LockMode::None {
            return Err(StmError::IllegalArgument(format!(
                "[{}] a readonly transaction can't use write lock mode {}",
                self.family_name, self.write_lock_mode
            )));
        }
        if self.write_lock_mode != LockMode::None && self.write_lock_mode < self.read_lock_mode {
            return Err(StmError::IllegalArgument(format!(
                "[{}] write lock mode {} is weaker than read lock mode {}",
                self.family_name, self.write_lock_mode, self.read_lock_mode
            )));
        }
        Ok(())
    }

    pub fn family_name(&self) -> &Arc<str> {
        &self.family_name
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    pub fn is_track_reads(&self) -> bool {
        self.track_reads
    }

    pub fn is_blocking_allowed(&self) -> bool {
        self.blocking_allowed
    }

    pub fn max_retries(&self) -> usize {
        self.max_retries
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn is_write_skew_allowed(&self) -> bool {
        self.isolation_level.allows_write_skew()
    }

    pub fn dirty_check(&self) -> bool {
        self.dirty_check
    }

    pub fn spin_count(&self) -> usize {
        self.spin_count
    }

    pub fn read_lock_mode(&self) -> LockMode {
        self.read_lock_mode
    }

    pub fn write_lock_mode(&self) -> LockMode {
        self.write_lock_mode
    }

    pub fn backoff(&self) -> &Arc<dyn BackoffPolicy> {
        &self.backoff
    }

    pub fn interruptor(&self) -> Option<&Arc<Interruptor>> {
        self.interruptor.as_ref()
    }

    pub fn speculative(&self) -> &SpeculativeConfig {
        &self.speculative
    }

    /// Whether a new transaction must start in the fat shape.
    pub(crate) fn requires_fat(&self) -> bool {
        !self.speculative_enabled
            || self.speculative.is_fat_required()
            || self.read_lock_mode != LockMode::None
            || self.write_lock_mode != LockMode::None
    }
}

/// Fluent builder for a transaction family, obtained from [`Stm::factory_builder`].
#[derive(Debug, Clone)]
pub struct TransactionFactoryBuilder {
    stm: Stm,
    config: TxnConfig,
}

impl TransactionFactoryBuilder {
    pub(crate) fn new(stm: Stm) -> Self {
        let config = TxnConfig::from_stm(stm.config());
        Self { stm, config }
    }

    /// Name used in logs and error messages.
    pub fn family_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.config.family_name = name.into();
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.config.readonly = readonly;
        self
    }

    /// Whether reads count as dependencies for blocking retries.
    pub fn track_reads(mut self, track_reads: bool) -> Self {
        self.config.track_reads = track_reads;
        self
    }

    pub fn blocking_allowed(mut self, allowed: bool) -> Self {
        self.config.blocking_allowed = allowed;
        self
    }

    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.config.isolation_level = level;
        self
    }

    pub fn write_skew_allowed(mut self, allowed: bool) -> Self {
        self.config.isolation_level = if allowed {
            IsolationLevel::Snapshot
        } else {
            IsolationLevel::Serializable
        };
        self
    }

    /// Compare written values with the loaded ones; equal writes are not published.
    pub fn dirty_check(mut self, dirty_check: bool) -> Self {
        self.config.dirty_check = dirty_check;
        self
    }

    pub fn spin_count(mut self, spin_count: usize) -> Self {
        self.config.spin_count = spin_count;
        self
    }

    /// Lock acquired on every reference as soon as it is read.
    pub fn read_lock_mode(mut self, mode: LockMode) -> Self {
        self.config.read_lock_mode = mode;
        self
    }

    /// Lock acquired on every reference as soon as it is opened for writing.
    pub fn write_lock_mode(mut self, mode: LockMode) -> Self {
        self.config.write_lock_mode = mode;
        self
    }

    pub fn backoff_policy<B: BackoffPolicy + 'static>(mut self, policy: B) -> Self {
        self.config.backoff = Arc::new(policy);
        self
    }

    /// Make blocking retries abort with [`StmError::Interrupted`] when `interruptor` fires.
    pub fn interruptible(mut self, interruptor: Arc<Interruptor>) -> Self {
        self.config.interruptor = Some(interruptor);
        self
    }

    /// Start transactions lean and upgrade on demand. When disabled every
    /// transaction is fat from the first attempt.
    pub fn speculative_config_enabled(mut self, enabled: bool) -> Self {
        self.config.speculative_enabled = enabled;
        self
    }

    pub fn build(self) -> StmResult<TransactionFactory> {
        let mut config = self.config;
        config.validate()?;
        if config.write_lock_mode == LockMode::None && config.read_lock_mode > LockMode::None {
            config.write_lock_mode = config.read_lock_mode;
        }
        config.speculative = Arc::new(SpeculativeConfig::default());
        Ok(TransactionFactory {
            stm: self.stm,
            config: Arc::new(config),
        })
    }

    pub fn build_atomic_block(self) -> StmResult<AtomicBlock> {
        Ok(AtomicBlock::new(self.build()?))
    }
}

/// Creates transactions of one family.
#[derive(Debug, Clone)]
pub struct TransactionFactory {
    pub(crate) stm: Stm,
    pub(crate) config: Arc<TxnConfig>,
}

impl TransactionFactory {
    pub fn config(&self) -> &Arc<TxnConfig> {
        &self.config
    }

    pub fn stm(&self) -> &Stm {
        &self.stm
    }

    pub fn new_transaction(&self) -> Transaction {
        Transaction::new(self.stm.clone(), self.config.clone())
    }
}
