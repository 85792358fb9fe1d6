use crate::errors::StmResult;
use crate::reference::TxnRef;
use crate::scope::TxnScope;
use crate::transaction::Transaction;
use crate::Stm;
use std::ops::Deref;

macro_rules! integral_ref {
    ($(#[$meta:meta])* $name:ident, $int:ty) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(TxnRef<$int>);

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0).finish()
            }
        }

        impl Deref for $name {
            type Target = TxnRef<$int>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<TxnRef<$int>> for $name {
            fn from(reference: TxnRef<$int>) -> Self {
                Self(reference)
            }
        }

        impl $name {
            pub fn new(stm: &Stm, value: $int) -> Self {
                Self(TxnRef::new(stm, value))
            }

            pub fn into_inner(self) -> TxnRef<$int> {
                self.0
            }

            /// Add `amount`, wrapping on overflow.
            pub fn increment(&self, tx: &mut Transaction, amount: $int) -> StmResult<()> {
                self.0.alter_and_get(tx, |v| v.wrapping_add(amount)).map(drop)
            }

            pub fn decrement(&self, tx: &mut Transaction, amount: $int) -> StmResult<()> {
                self.increment(tx, amount.wrapping_neg())
            }

            pub fn increment_and_get(&self, tx: &mut Transaction, amount: $int) -> StmResult<$int> {
                self.0.alter_and_get(tx, |v| v.wrapping_add(amount))
            }

            pub fn get_and_increment(&self, tx: &mut Transaction, amount: $int) -> StmResult<$int> {
                self.0.get_and_alter(tx, |v| v.wrapping_add(amount))
            }

            /// Increment without reading, so concurrent increments don't conflict.
            pub fn commuting_increment(&self, tx: &mut Transaction, amount: $int) -> StmResult<()> {
                self.0.commute(tx, move |v: $int| v.wrapping_add(amount))
            }

            pub fn atomic_increment_and_get(&self, amount: $int) -> StmResult<$int> {
                self.0.atomic_alter_and_get(|v| v.wrapping_add(amount))
            }

            pub fn atomic_get_and_increment(&self, amount: $int) -> StmResult<$int> {
                self.0.atomic_get_and_alter(|v| v.wrapping_add(amount))
            }

            pub fn increment_in(&self, scope: &mut TxnScope, amount: $int) -> StmResult<$int> {
                self.0.alter_and_get_in(scope, |v| v.wrapping_add(amount))
            }
        }
    };
}

integral_ref!(
    /// Transactional `i64`.
    TxnLong,
    i64
);

integral_ref!(
    /// Transactional `i32`.
    TxnInteger,
    i32
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StmError;

    #[test]
    fn increments() {
        let stm = Stm::new();
        let counter = TxnLong::new(&stm, 10);
        stm.atomically(|tx| {
            counter.increment(tx, 5)?;
            assert_eq!(counter.get_and_increment(tx, 1)?, 15);
            assert_eq!(counter.increment_and_get(tx, 1)?, 17);
            counter.decrement(tx, 2)
        })
        .unwrap();
        assert_eq!(counter.atomic_get().unwrap(), 15);
    }

    #[test]
    fn atomic_increments() {
        let stm = Stm::new();
        let counter = TxnInteger::new(&stm, i32::MAX);
        assert_eq!(counter.atomic_get_and_increment(1).unwrap(), i32::MAX);
        assert_eq!(counter.atomic_get().unwrap(), i32::MIN);
        assert_eq!(counter.atomic_increment_and_get(2).unwrap(), i32::MIN + 2);
    }

    #[test]
    fn commuting_increments_stack() {
        let stm = Stm::new();
        let counter = TxnLong::new(&stm, 0);
        stm.atomically(|tx| {
            counter.commuting_increment(tx, 1)?;
            counter.commuting_increment(tx, 2)
        })
        .unwrap();
        assert_eq!(counter.atomic_get().unwrap(), 3);
    }

    #[test]
    fn increment_in_falls_back_to_atomic() {
        let stm = Stm::new();
        let counter = TxnLong::new(&stm, 1);
        let mut scope = TxnScope::new();
        assert_eq!(counter.increment_in(&mut scope, 4).unwrap(), 5);
        assert!(matches!(counter.ensure_in(&mut scope), Err(StmError::TransactionRequired { .. })));
    }
}
