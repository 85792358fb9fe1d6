use crate::transaction::Transaction;

/// Caller-owned slot for the transaction in progress.
///
/// Passed explicitly instead of living in a thread local; the `*_in` operations
/// on references run inside the slot's transaction when there is a live one and
/// fall back to a one-shot atomic operation otherwise.
#[derive(Debug, Default)]
pub struct TxnScope {
    current: Option<Transaction>,
}

impl TxnScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(tx: Transaction) -> Self {
        Self { current: Some(tx) }
    }

    /// The slot's transaction, if it is still alive.
    pub fn get(&mut self) -> Option<&mut Transaction> {
        self.current.as_mut().filter(|tx| tx.is_alive())
    }

    /// Store `tx`, returning the previous occupant.
    pub fn set(&mut self, tx: Transaction) -> Option<Transaction> {
        self.current.replace(tx)
    }

    pub fn clear(&mut self) -> Option<Transaction> {
        self.current.take()
    }

    pub fn is_active(&self) -> bool {
        self.current.as_ref().is_some_and(Transaction::is_alive)
    }

    /// The slot's transaction whatever its status.
    pub(crate) fn slot(&mut self) -> Option<&mut Transaction> {
        self.current.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Stm, TxnRef};

    #[test]
    fn empty_scope_falls_back_to_atomic() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 1);
        let mut scope = TxnScope::new();
        assert!(!scope.is_active());
        r.set_in(&mut scope, 2).unwrap();
        assert_eq!(r.get_in(&mut scope).unwrap(), 2);
        assert!(r.ensure_in(&mut scope).is_err());
    }

    #[test]
    fn dead_transaction_is_not_handed_out() {
        let stm = Stm::new();
        let r = TxnRef::new(&stm, 1);
        let mut scope = TxnScope::with(stm.new_transaction());
        assert!(scope.is_active());

        r.set_in(&mut scope, 5).unwrap();
        assert_eq!(r.atomic_get().unwrap(), 1);
        scope.get().unwrap().commit().unwrap();

        assert!(!scope.is_active());
        assert!(scope.get().is_none());
        assert_eq!(r.get_in(&mut scope).unwrap(), 5);
        assert!(scope.clear().is_some());
    }
}
