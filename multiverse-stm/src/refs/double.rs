use crate::errors::StmResult;
use crate::reference::TxnRef;
use crate::scope::TxnScope;
use crate::transaction::Transaction;
use crate::Stm;
use std::ops::Deref;

/// Transactional `f64`.
///
/// Equality drives the dirty check, so writing `NaN` over `NaN` is always
/// published.
#[derive(Debug, Clone)]
pub struct TxnDouble(TxnRef<f64>);

impl Deref for TxnDouble {
    type Target = TxnRef<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<TxnRef<f64>> for TxnDouble {
    fn from(reference: TxnRef<f64>) -> Self {
        Self(reference)
    }
}

impl TxnDouble {
    pub fn new(stm: &Stm, value: f64) -> Self {
        Self(TxnRef::new(stm, value))
    }

    pub fn into_inner(self) -> TxnRef<f64> {
        self.0
    }

    pub fn increment(&self, tx: &mut Transaction, amount: f64) -> StmResult<()> {
        self.0.alter_and_get(tx, |v| v + amount).map(drop)
    }

    pub fn decrement(&self, tx: &mut Transaction, amount: f64) -> StmResult<()> {
        self.increment(tx, -amount)
    }

    pub fn increment_and_get(&self, tx: &mut Transaction, amount: f64) -> StmResult<f64> {
        self.0.alter_and_get(tx, |v| v + amount)
    }

    pub fn get_and_increment(&self, tx: &mut Transaction, amount: f64) -> StmResult<f64> {
        self.0.get_and_alter(tx, |v| v + amount)
    }

    pub fn commuting_increment(&self, tx: &mut Transaction, amount: f64) -> StmResult<()> {
        self.0.commute(tx, move |v: f64| v + amount)
    }

    pub fn atomic_increment_and_get(&self, amount: f64) -> StmResult<f64> {
        self.0.atomic_alter_and_get(|v| v + amount)
    }

    pub fn atomic_get_and_increment(&self, amount: f64) -> StmResult<f64> {
        self.0.atomic_get_and_alter(|v| v + amount)
    }

    pub fn increment_in(&self, scope: &mut TxnScope, amount: f64) -> StmResult<f64> {
        self.0.alter_and_get_in(scope, |v| v + amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments() {
        let stm = Stm::new();
        let d = TxnDouble::new(&stm, 1.5);
        let got = stm.atomically(|tx| {
            d.increment(tx, 1.0)?;
            d.decrement(tx, 0.5)?;
            d.increment_and_get(tx, 0.25)
        });
        assert_eq!(got.unwrap(), 2.25);
        assert_eq!(d.atomic_get_and_increment(0.75).unwrap(), 2.25);
        assert_eq!(d.atomic_get().unwrap(), 3.0);
    }
}
