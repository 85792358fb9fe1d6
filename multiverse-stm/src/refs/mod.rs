//! Numeric references with arithmetic shortcuts.

mod double;
mod integral;

pub use double::TxnDouble;
pub use integral::{TxnInteger, TxnLong};
