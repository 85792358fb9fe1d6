//! Ownership records.
//!
//! Every transactional reference embeds one [`Orec`]: a single `AtomicU64`
//! holding the lock mode, the surplus (how many transactions currently depend on
//! the reference), the read-bias flag and the readonly commit streak.
//!
//! ```text
//!  63   62   61   60 ........ 40   39 ........ 10   9 ..... 0
//! [EX] [WR] [RB] [ read locks  ]  [   surplus   ]  [readonly]
//! ```
//!
//! An update-biased orec counts every arrival so a writer knows whether readers
//! may be affected. Once a reference has seen `threshold` consecutive readonly
//! departures with nobody around it flips to read-biased: readers stop arriving
//! (they get [`ArriveStatus::UNREGISTERED`]) and the surplus degrades to a sticky
//! "somebody may be reading" bit. The next update resets it to update-biased.

use crate::errors::PanicError;
use bitflags::bitflags;
use core::hint::spin_loop;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

const MASK_EXCLUSIVE: u64 = 1 << 63;
const MASK_WRITE: u64 = 1 << 62;
const MASK_READ_BIASED: u64 = 1 << 61;

const READ_LOCKS_SHIFT: u32 = 40;
const READ_LOCKS_MAX: u64 = (1 << 21) - 1;
const MASK_READ_LOCKS: u64 = READ_LOCKS_MAX << READ_LOCKS_SHIFT;

const SURPLUS_SHIFT: u32 = 10;
const SURPLUS_MAX: u64 = (1 << 30) - 1;
const MASK_SURPLUS: u64 = SURPLUS_MAX << SURPLUS_SHIFT;

const MASK_READONLY_COUNT: u64 = 0x3FF;

/// Yield the thread every this many spins while a lock is held.
const SPIN_YIELD: usize = 32;

/// Consecutive readonly departures before an orec becomes read-biased.
pub const DEFAULT_READ_BIASED_THRESHOLD: u32 = 128;
/// Largest threshold that fits the readonly counter.
pub const MAX_READ_BIASED_THRESHOLD: u32 = MASK_READONLY_COUNT as u32;

/// Lock strength, weakest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LockMode {
    /// No lock. Readers and writers may still arrive.
    #[default]
    None,
    /// Shared lock. Blocks write and exclusive locks, not other readers.
    Read,
    /// Single writer. Existing unlocked arrivals proceed, new locks are refused.
    Write,
    /// Commit lock. Blocks everything, including plain arrivals.
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockMode::None => "none",
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::Exclusive => "exclusive",
        };
        f.write_str(name)
    }
}

/// Whether `requested` can be granted while the orec is held in `current`.
///
/// `LockMode::None` as request stands for a plain arrival.
pub const fn is_lock_compatible(current: LockMode, requested: LockMode) -> bool {
    match (current, requested) {
        (LockMode::Exclusive, _) => false,
        (LockMode::None, _) => true,
        (_, LockMode::None) => true,
        (LockMode::Read, LockMode::Read) => true,
        _ => false,
    }
}

bitflags! {
    /// Outcome of an arrive or lock operation. The empty mask is failure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArriveStatus: u8 {
        const SUCCESS = 0b001;
        /// Other transactions already depended on the orec when the exclusive lock was granted.
        const CONFLICT = 0b010;
        /// The orec is read-biased: no depart is owed for this arrival.
        const UNREGISTERED = 0b100;
    }
}

impl ArriveStatus {
    pub const FAILURE: ArriveStatus = ArriveStatus::empty();

    pub fn is_success(self) -> bool {
        self.contains(ArriveStatus::SUCCESS)
    }

    pub fn is_conflict(self) -> bool {
        self.contains(ArriveStatus::CONFLICT)
    }

    pub fn is_unregistered(self) -> bool {
        self.contains(ArriveStatus::UNREGISTERED)
    }
}

/// Decoded copy of an orec word.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OrecState(u64);

impl OrecState {
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn has_exclusive_lock(self) -> bool {
        self.0 & MASK_EXCLUSIVE != 0
    }

    pub const fn has_write_lock(self) -> bool {
        self.0 & MASK_WRITE != 0
    }

    pub const fn has_write_or_exclusive_lock(self) -> bool {
        self.0 & (MASK_EXCLUSIVE | MASK_WRITE) != 0
    }

    pub const fn has_any_lock(self) -> bool {
        self.0 & (MASK_EXCLUSIVE | MASK_WRITE | MASK_READ_LOCKS) != 0
    }

    pub const fn is_read_biased(self) -> bool {
        self.0 & MASK_READ_BIASED != 0
    }

    pub const fn read_lock_count(self) -> u64 {
        (self.0 & MASK_READ_LOCKS) >> READ_LOCKS_SHIFT
    }

    pub const fn surplus(self) -> u64 {
        (self.0 & MASK_SURPLUS) >> SURPLUS_SHIFT
    }

    pub const fn readonly_count(self) -> u32 {
        (self.0 & MASK_READONLY_COUNT) as u32
    }

    pub const fn lock_mode(self) -> LockMode {
        if self.has_exclusive_lock() {
            LockMode::Exclusive
        } else if self.has_write_lock() {
            LockMode::Write
        } else if self.read_lock_count() > 0 {
            LockMode::Read
        } else {
            LockMode::None
        }
    }

    /// Blocked for `requested` given the current word.
    const fn blocks(self, requested: LockMode) -> bool {
        match requested {
            LockMode::None => self.has_exclusive_lock(),
            LockMode::Read => self.has_write_or_exclusive_lock(),
            LockMode::Write | LockMode::Exclusive => self.has_any_lock(),
        }
    }

    const fn with_exclusive_lock(self, on: bool) -> Self {
        Self(if on { self.0 | MASK_EXCLUSIVE } else { self.0 & !MASK_EXCLUSIVE })
    }

    const fn with_write_lock(self, on: bool) -> Self {
        Self(if on { self.0 | MASK_WRITE } else { self.0 & !MASK_WRITE })
    }

    const fn with_read_biased(self, on: bool) -> Self {
        Self(if on { self.0 | MASK_READ_BIASED } else { self.0 & !MASK_READ_BIASED })
    }

    const fn with_read_lock_count(self, count: u64) -> Self {
        Self((self.0 & !MASK_READ_LOCKS) | ((count & READ_LOCKS_MAX) << READ_LOCKS_SHIFT))
    }

    const fn with_surplus(self, surplus: u64) -> Self {
        Self((self.0 & !MASK_SURPLUS) | ((surplus & SURPLUS_MAX) << SURPLUS_SHIFT))
    }

    const fn with_readonly_count(self, count: u32) -> Self {
        Self((self.0 & !MASK_READONLY_COUNT) | (count as u64 & MASK_READONLY_COUNT))
    }

    const fn with_lock(self, mode: LockMode) -> Self {
        match mode {
            LockMode::None => self,
            LockMode::Read => self.with_read_lock_count(self.read_lock_count() + 1),
            LockMode::Write => self.with_write_lock(true),
            LockMode::Exclusive => self.with_exclusive_lock(true),
        }
    }

    /// Drops one read lock, or the write/exclusive lock.
    const fn release_one_lock(self) -> Self {
        if self.has_write_or_exclusive_lock() {
            self.with_exclusive_lock(false).with_write_lock(false)
        } else {
            self.with_read_lock_count(self.read_lock_count().saturating_sub(1))
        }
    }

    /// Surplus after one more arrival. Read-biased orecs saturate at one.
    fn arrived(self) -> Result<u64, PanicError> {
        let surplus = self.surplus();
        if !self.is_read_biased() {
            return Ok(surplus + 1);
        }
        match surplus {
            0 | 1 => Ok(1),
            _ => Err(PanicError::on_orec(
                "surplus of a read-biased orec can never be larger than 1",
                self,
            )),
        }
    }
}

impl fmt::Debug for OrecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orec")
            .field("lock_mode", &self.lock_mode())
            .field("read_locks", &self.read_lock_count())
            .field("surplus", &self.surplus())
            .field("read_biased", &self.is_read_biased())
            .field("readonly_count", &self.readonly_count())
            .finish()
    }
}

#[inline]
fn relax(remaining: usize) {
    if remaining > 0 && remaining % SPIN_YIELD == 0 {
        std::thread::yield_now();
    } else {
        spin_loop();
    }
}

/// Per-reference ownership record.
pub struct Orec {
    state: AtomicU64,
    read_biased_threshold: u32,
}

impl Default for Orec {
    fn default() -> Self {
        Self::new(DEFAULT_READ_BIASED_THRESHOLD)
    }
}

impl fmt::Debug for Orec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.snapshot().fmt(f)
    }
}

impl Orec {
    /// Create an unlocked, update-biased orec. `read_biased_threshold` is clamped to
    /// [`MAX_READ_BIASED_THRESHOLD`].
    pub fn new(read_biased_threshold: u32) -> Self {
        Self {
            state: AtomicU64::new(0),
            read_biased_threshold: read_biased_threshold.clamp(1, MAX_READ_BIASED_THRESHOLD),
        }
    }

    #[inline]
    pub fn snapshot(&self) -> OrecState {
        OrecState(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn cas(&self, current: OrecState, next: OrecState) -> bool {
        self.state
            .compare_exchange(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn read_biased_threshold(&self) -> u32 {
        self.read_biased_threshold
    }

    pub fn lock_mode(&self) -> LockMode {
        self.snapshot().lock_mode()
    }

    pub fn surplus(&self) -> u64 {
        self.snapshot().surplus()
    }

    pub fn read_lock_count(&self) -> u64 {
        self.snapshot().read_lock_count()
    }

    pub fn readonly_count(&self) -> u32 {
        self.snapshot().readonly_count()
    }

    pub fn is_read_biased(&self) -> bool {
        self.snapshot().is_read_biased()
    }

    pub fn has_exclusive_lock(&self) -> bool {
        self.snapshot().has_exclusive_lock()
    }

    pub fn has_write_lock(&self) -> bool {
        self.snapshot().has_write_lock()
    }

    /// Spin up to `spin` times until nobody holds the exclusive lock.
    pub fn wait_for_exclusive_lock_to_become_free(&self, spin: usize) -> bool {
        let mut remaining = spin;
        loop {
            if !self.snapshot().has_exclusive_lock() {
                return true;
            }
            if remaining == 0 {
                return false;
            }
            remaining -= 1;
            relax(remaining);
        }
    }

    /// Register a dependency on the orec without locking it.
    ///
    /// Only the exclusive lock blocks an arrival. Returns
    /// [`ArriveStatus::FAILURE`] when it stayed held for the whole spin.
    pub fn arrive(&self, spin: usize) -> Result<ArriveStatus, PanicError> {
        self.arrive_and_lock(spin, LockMode::None)
    }

    /// Arrive and acquire `mode` in one step. Nothing changes when the lock is refused.
    pub fn arrive_and_lock(&self, spin: usize, mode: LockMode) -> Result<ArriveStatus, PanicError> {
        let mut remaining = spin;
        loop {
            let current = self.snapshot();

            if current.blocks(mode) {
                if remaining == 0 {
                    return Ok(ArriveStatus::FAILURE);
                }
                remaining -= 1;
                relax(remaining);
                continue;
            }

            let read_biased = current.is_read_biased();
            if read_biased && mode == LockMode::None && current.surplus() == 1 {
                return Ok(ArriveStatus::SUCCESS | ArriveStatus::UNREGISTERED);
            }

            let next = current.with_surplus(current.arrived()?).with_lock(mode);
            if self.cas(current, next) {
                let mut status = ArriveStatus::SUCCESS;
                if read_biased {
                    status |= ArriveStatus::UNREGISTERED;
                }
                if mode == LockMode::Exclusive && current.surplus() > 0 {
                    status |= ArriveStatus::CONFLICT;
                }
                return Ok(status);
            }
        }
    }

    pub fn arrive_and_exclusive_lock(&self, spin: usize) -> Result<ArriveStatus, PanicError> {
        self.arrive_and_lock(spin, LockMode::Exclusive)
    }

    /// Acquire `mode` for a transaction that already arrived normally.
    ///
    /// Faults when the orec is read-biased or carries no surplus, since then no
    /// normal arrival can have happened.
    pub fn try_lock_after_normal_arrive(
        &self,
        spin: usize,
        mode: LockMode,
    ) -> Result<ArriveStatus, PanicError> {
        if mode == LockMode::None {
            return Ok(ArriveStatus::SUCCESS);
        }
        let mut remaining = spin;
        loop {
            let current = self.snapshot();

            if current.is_read_biased() {
                return Err(PanicError::on_orec("orec is read-biased", current));
            }

            if current.blocks(mode) {
                if remaining == 0 {
                    return Ok(ArriveStatus::FAILURE);
                }
                remaining -= 1;
                relax(remaining);
                continue;
            }

            if current.surplus() == 0 {
                return Err(PanicError::on_orec(
                    "no surplus, the lock can't follow a normal arrive",
                    current,
                ));
            }

            if self.cas(current, current.with_lock(mode)) {
                let mut status = ArriveStatus::SUCCESS;
                if mode == LockMode::Exclusive && current.surplus() > 1 {
                    status |= ArriveStatus::CONFLICT;
                }
                return Ok(status);
            }
        }
    }

    /// Turn the caller's read lock into a write or exclusive lock.
    ///
    /// Only possible while the caller is the sole read-lock holder; returns
    /// `false` with the state untouched when others keep holding theirs.
    pub fn try_upgrade_read_lock(&self, spin: usize, exclusive: bool) -> Result<bool, PanicError> {
        let mut remaining = spin;
        loop {
            let current = self.snapshot();
            let read_locks = current.read_lock_count();

            if read_locks == 0 {
                return Err(PanicError::on_orec(
                    "can't upgrade a read lock that isn't held",
                    current,
                ));
            }

            if read_locks > 1 {
                if remaining == 0 {
                    return Ok(false);
                }
                remaining -= 1;
                relax(remaining);
                continue;
            }

            let next = current
                .with_read_lock_count(0)
                .with_lock(if exclusive { LockMode::Exclusive } else { LockMode::Write });
            if self.cas(current, next) {
                return Ok(true);
            }
        }
    }

    /// Write lock to exclusive lock.
    ///
    /// Returns whether other transactions may depend on the orec.
    pub fn upgrade_write_lock(&self) -> Result<bool, PanicError> {
        loop {
            let current = self.snapshot();

            if current.has_exclusive_lock() {
                return Ok(false);
            }

            if !current.has_write_lock() {
                return Err(PanicError::on_orec("write lock is not acquired", current));
            }

            let next = current.with_write_lock(false).with_exclusive_lock(true);
            if self.cas(current, next) {
                return Ok(current.is_read_biased() || current.surplus() > 1);
            }
        }
    }

    /// Depart after a readonly use without a lock.
    ///
    /// Bumps the readonly streak; the orec flips to read-biased once the streak
    /// reaches the threshold and nobody else depends on it.
    pub fn depart_after_reading(&self) -> Result<(), PanicError> {
        loop {
            let current = self.snapshot();
            let surplus = current.surplus();

            if surplus == 0 {
                return Err(PanicError::on_orec("there is no surplus", current));
            }
            if current.is_read_biased() {
                return Err(PanicError::on_orec("orec is read-biased", current));
            }
            if surplus <= 1 && current.has_any_lock() {
                return Err(PanicError::on_orec(
                    "not enough surplus for a lock holder and a reader",
                    current,
                ));
            }

            let next = self.after_readonly_depart(current, surplus - 1, !current.has_exclusive_lock());
            if self.cas(current, next) {
                return Ok(());
            }
        }
    }

    /// Depart after a readonly use and release the lock that was held for it.
    pub fn depart_after_reading_and_unlock(&self) -> Result<(), PanicError> {
        loop {
            let current = self.snapshot();
            let surplus = current.surplus();

            if surplus == 0 {
                return Err(PanicError::on_orec("there is no surplus", current));
            }
            if current.read_lock_count() == 0 && !current.has_write_or_exclusive_lock() {
                return Err(PanicError::on_orec("no lock acquired", current));
            }
            if current.is_read_biased() {
                return Err(PanicError::on_orec("orec is read-biased", current));
            }

            let next = self.after_readonly_depart(current.release_one_lock(), surplus - 1, true);
            if self.cas(current, next) {
                return Ok(());
            }
        }
    }

    fn after_readonly_depart(&self, state: OrecState, surplus: u64, may_bias: bool) -> OrecState {
        let mut readonly_count = state.readonly_count();
        if readonly_count < self.read_biased_threshold {
            readonly_count += 1;
        }

        let mut read_biased = false;
        if may_bias && surplus == 0 && readonly_count == self.read_biased_threshold {
            read_biased = true;
            readonly_count = 0;
        }

        state
            .with_read_biased(read_biased)
            .with_readonly_count(readonly_count)
            .with_surplus(surplus)
    }

    /// Depart after publishing a new value under the exclusive lock.
    ///
    /// When no other dependency remains, the orec returns to its initial
    /// update-biased state.
    pub fn depart_after_update_and_unlock(&self) -> Result<(), PanicError> {
        loop {
            let current = self.snapshot();

            if !current.has_exclusive_lock() {
                return Err(PanicError::on_orec(
                    "can't depart after update without the exclusive lock",
                    current,
                ));
            }

            let mut surplus = current.surplus();
            if surplus == 0 {
                return Err(PanicError::on_orec(
                    "can't depart after update without surplus",
                    current,
                ));
            }

            if current.is_read_biased() {
                if surplus > 1 {
                    return Err(PanicError::on_orec(
                        "surplus of a read-biased orec can never be larger than 1",
                        current,
                    ));
                }
                surplus = 0;
            } else {
                surplus -= 1;
            }

            if self.cas(current, OrecState(0).with_surplus(surplus)) {
                return Ok(());
            }
        }
    }

    /// Depart and unlock after a failed transaction held a lock.
    ///
    /// Works on both biases; a read-biased surplus is left alone since the
    /// number of readers behind it is unknown.
    pub fn depart_after_failure_and_unlock(&self) -> Result<(), PanicError> {
        loop {
            let current = self.snapshot();

            if !current.has_any_lock() {
                return Err(PanicError::on_orec("no lock acquired", current));
            }

            let mut surplus = current.surplus();
            if surplus == 0 {
                return Err(PanicError::on_orec("there is no surplus", current));
            }

            if !current.is_read_biased() {
                surplus -= 1;
            }

            let next = current.release_one_lock().with_surplus(surplus);
            if self.cas(current, next) {
                return Ok(());
            }
        }
    }

    /// Depart after a failed transaction that arrived without locking.
    pub fn depart_after_failure(&self) -> Result<(), PanicError> {
        loop {
            let current = self.snapshot();

            if current.is_read_biased() {
                return Err(PanicError::on_orec("orec is read-biased", current));
            }

            let surplus = current.surplus();
            if current.has_exclusive_lock() {
                if surplus < 2 {
                    return Err(PanicError::on_orec(
                        "exclusively locked orec needs both the lock holder and the caller in its surplus",
                        current,
                    ));
                }
            } else if surplus == 0 {
                return Err(PanicError::on_orec("there is no surplus", current));
            }

            if self.cas(current, current.with_surplus(surplus - 1)) {
                return Ok(());
            }
        }
    }

    /// Release a lock that was taken by an unregistered (read-biased) arrival.
    pub fn unlock_by_unregistered(&self) -> Result<(), PanicError> {
        loop {
            let current = self.snapshot();

            if !current.is_read_biased() {
                return Err(PanicError::on_orec(
                    "can't unlock by unregistered when the orec is update-biased",
                    current,
                ));
            }
            if !current.has_any_lock() {
                return Err(PanicError::on_orec("no lock acquired", current));
            }
            if current.surplus() > 1 {
                return Err(PanicError::on_orec(
                    "surplus of a read-biased orec can never be larger than 1",
                    current,
                ));
            }

            if self.cas(current, current.release_one_lock()) {
                return Ok(());
            }
        }
    }
}
