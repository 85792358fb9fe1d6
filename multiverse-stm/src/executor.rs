//! Retry loop around a transactional closure.

use crate::config::TransactionFactory;
use crate::errors::{PanicError, StmError, StmResult};
use crate::latch::LatchWait;
use crate::scope::TxnScope;
use crate::transaction::Transaction;
use std::time::Instant;

/// Runs closures atomically for one transaction family.
///
/// Each attempt runs the closure and commits. Conflicts abort, back off and
/// restart; [`StmError::Retry`] blocks until a reference the attempt read is
/// changed by someone else; a speculative failure restarts at once in the fat
/// shape. Any other error aborts the attempt and is returned.
///
/// DANGER AHEAD: the closure may run many times. Keep I/O out of it and use
/// [`Transaction::on_commit`] for side effects.
#[derive(Debug, Clone)]
pub struct AtomicBlock {
    factory: TransactionFactory,
}

impl AtomicBlock {
    pub fn new(factory: TransactionFactory) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &TransactionFactory {
        &self.factory
    }

    /// Run `f` in a fresh transaction until it commits.
    pub fn execute<R, F>(&self, mut f: F) -> StmResult<R>
    where
        F: FnMut(&mut Transaction) -> StmResult<R>,
    {
        let mut scope = TxnScope::with(self.factory.new_transaction());
        self.drive(&mut scope, &mut |scope: &mut TxnScope| match scope.get() {
            Some(tx) => f(tx),
            None => Err(PanicError::new("atomic block lost its transaction").into()),
        })
    }

    /// Run `f` inside `scope`.
    ///
    /// When the scope already holds a live transaction `f` joins it (flat
    /// nesting) and nothing is committed here. Otherwise a new transaction is
    /// placed in the scope for the duration of the block.
    pub fn execute_in<R, F>(&self, scope: &mut TxnScope, mut f: F) -> StmResult<R>
    where
        F: FnMut(&mut TxnScope) -> StmResult<R>,
    {
        if scope.is_active() {
            return f(scope);
        }
        scope.set(self.factory.new_transaction());
        let result = self.drive(scope, &mut f);
        scope.clear();
        result
    }

    fn drive<R>(&self, scope: &mut TxnScope, f: &mut dyn FnMut(&mut TxnScope) -> StmResult<R>) -> StmResult<R> {
        loop {
            let outcome = f(scope);
            let tx = scope
                .slot()
                .ok_or_else(|| PanicError::new("transaction scope was cleared inside an atomic block"))?;
            let error = match outcome.and_then(|value| tx.commit().map(|()| value)) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            self.recover(tx, error)?;
        }
    }

    /// Decide what a failed attempt turns into: `Ok` restarts, `Err` ends the block.
    fn recover(&self, tx: &mut Transaction, error: StmError) -> StmResult<()> {
        let config = self.factory.config();
        match error {
            StmError::Retry => {
                let latch = tx.prepare_retry_wait()?;
                let started = Instant::now();
                let deadline = tx.remaining_timeout.map(|timeout| started + timeout);
                let interruptor = config.interruptor().map(|interruptor| &**interruptor);
                tracing::debug!(
                    family = %config.family_name(),
                    attempt = tx.attempt(),
                    "blocking until a read reference changes"
                );

                match latch.wait(deadline, interruptor) {
                    LatchWait::Opened => {
                        if let Some(remaining) = tx.remaining_timeout {
                            tx.remaining_timeout = Some(remaining.saturating_sub(started.elapsed()));
                        }
                    }
                    LatchWait::TimedOut => {
                        tracing::warn!(family = %config.family_name(), "retry timed out");
                        return Err(StmError::RetryTimeout {
                            family: config.family_name().clone(),
                        });
                    }
                    LatchWait::Interrupted => {
                        tracing::debug!(family = %config.family_name(), "blocking retry interrupted");
                        return Err(StmError::Interrupted {
                            family: config.family_name().clone(),
                        });
                    }
                }
                tx.soft_reset()
            }
            StmError::SpeculativeConfigurationFailure(feature) => {
                tracing::debug!(
                    family = %config.family_name(),
                    attempt = tx.attempt(),
                    feature,
                    "restarting as a fat transaction"
                );
                tx.restart();
                Ok(())
            }
            error if error.is_conflict() => {
                tx.abort();
                tracing::debug!(
                    family = %config.family_name(),
                    attempt = tx.attempt(),
                    %error,
                    "conflict, backing off"
                );
                config.backoff().backoff(tx.attempt());
                tx.soft_reset()
            }
            error => {
                tx.abort();
                Err(error)
            }
        }
    }
}
