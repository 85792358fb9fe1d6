//! Multiverse: software transactional memory for Rust.
//!
//! This crate bundles the workspace members behind one import:
//!
//! - [`multiverse_stm`]: references, transactions, the atomic block executor
//!   and blocking retry.
//! - [`multiverse_barrier`]: commit barriers that commit a group of
//!   transactions all together or not at all.
//!
//! # Example
//!
//! ```
//! use multiverse::{retry, Stm};
//! use std::thread;
//!
//! let stm = Stm::new();
//! let queue = stm.new_ref(Vec::<u32>::new());
//!
//! let consumer = {
//!     let (stm, queue) = (stm.clone(), queue.clone());
//!     thread::spawn(move || {
//!         stm.atomically(|tx| {
//!             let mut items = queue.get(tx)?;
//!             let Some(item) = items.pop() else { return retry() };
//!             queue.set(tx, items)?;
//!             Ok(item)
//!         })
//!     })
//! };
//!
//! stm.atomically(|tx| queue.alter_and_get(tx, |mut items| { items.push(7); items }))
//!     .unwrap();
//! assert_eq!(consumer.join().unwrap().unwrap(), 7);
//! ```

pub use multiverse_barrier::{BarrierError, BarrierStatus, CountDownCommitBarrier, VetoCommitBarrier};
pub use multiverse_stm::*;
