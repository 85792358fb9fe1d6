//! Commit barriers: commit a group of transactions all together or not at all.
//!
//! A participant prepares its transaction (all locks taken and validated) and
//! then waits at the barrier. When the barrier opens with a commit every
//! prepared participant publishes; when it is aborted every one of them rolls
//! back. Since nothing can conflict past prepare, the group commit can't fail
//! halfway.
//!
//! - [`CountDownCommitBarrier`] opens once a given number of parties joined.
//! - [`VetoCommitBarrier`] opens when anybody calls
//!   [`veto_commit`](VetoCommitBarrier::veto_commit).
//!
//! ```
//! use multiverse_barrier::CountDownCommitBarrier;
//! use multiverse_stm::Stm;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let stm = Stm::new();
//! let barrier = Arc::new(CountDownCommitBarrier::new(2));
//! let a = stm.new_long(0);
//! let b = stm.new_long(0);
//!
//! let handle = {
//!     let (stm, barrier, a) = (stm.clone(), barrier.clone(), a.clone());
//!     thread::spawn(move || {
//!         let mut tx = stm.new_transaction();
//!         a.set(&mut tx, 1).unwrap();
//!         barrier.join_commit(&mut tx).unwrap();
//!     })
//! };
//!
//! let mut tx = stm.new_transaction();
//! b.set(&mut tx, 2).unwrap();
//! barrier.join_commit(&mut tx).unwrap();
//! handle.join().unwrap();
//!
//! assert!(barrier.is_committed());
//! assert_eq!(a.atomic_get().unwrap() + b.atomic_get().unwrap(), 3);
//! ```

mod countdown;
mod error;
mod group;
mod veto;

pub use countdown::CountDownCommitBarrier;
pub use error::BarrierError;
pub use veto::VetoCommitBarrier;

use std::fmt;

/// Where a barrier is in its life. Only moves forward, out of `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarrierStatus {
    /// Still accepting participants.
    Closed,
    Committed,
    Aborted,
}

impl fmt::Display for BarrierStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BarrierStatus::Closed => "closed",
            BarrierStatus::Committed => "committed",
            BarrierStatus::Aborted => "aborted",
        })
    }
}
