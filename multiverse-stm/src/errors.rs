use crate::orec::OrecState;
use crate::transaction::TxnStatus;
use std::sync::Arc;
use thiserror::Error;

/// Internal consistency fault.
///
/// Raised when an orec (or a transaction's bookkeeping of one) is asked to
/// perform a transition its recorded state contradicts. These are never part of
/// normal control flow and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("internal consistency fault: {message}")]
pub struct PanicError {
    message: String,
    state: Option<OrecState>,
}

impl PanicError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(%message, "stm consistency fault");
        Self {
            message,
            state: None,
        }
    }

    pub(crate) fn on_orec(message: impl Into<String>, state: OrecState) -> Self {
        let message = message.into();
        tracing::error!(%message, ?state, "orec consistency fault");
        Self {
            message,
            state: Some(state),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Orec word observed when the fault was detected, if the fault came from an orec.
    pub fn orec_state(&self) -> Option<OrecState> {
        self.state
    }
}

/// Every failure a transactional operation can report.
///
/// `Retry`, `ReadWriteConflict`, `UncommittedReadConflict` and
/// `SpeculativeConfigurationFailure` are control flow: an [`AtomicBlock`](crate::AtomicBlock)
/// consumes them and starts another attempt. Everything else reaches the caller.
#[derive(Debug, Error)]
pub enum StmError {
    /// The transaction asked to block until one of the references it read changes.
    #[error("transaction retry requested")]
    Retry,
    /// A lock could not be acquired or a read was invalidated by a concurrent commit.
    #[error("read/write conflict")]
    ReadWriteConflict,
    /// A reference constructed by a transaction that has not committed yet was read.
    #[error("read of a reference that has never been committed")]
    UncommittedReadConflict,
    /// The lean transaction shape was too small for what the closure did.
    #[error("speculative configuration failure: {0} requires a fat transaction")]
    SpeculativeConfigurationFailure(&'static str),

    #[error("[{family}] can't {operation}: transaction is {status}")]
    DeadTransaction {
        family: Arc<str>,
        operation: &'static str,
        status: TxnStatus,
    },
    #[error("[{family}] can't {operation}: transaction is already prepared")]
    PreparedTransaction {
        family: Arc<str>,
        operation: &'static str,
    },
    #[error("{operation} requires an active transaction")]
    TransactionRequired { operation: &'static str },
    #[error("[{family}] can't {operation} in a readonly transaction")]
    ReadonlyViolation {
        family: Arc<str>,
        operation: &'static str,
    },
    #[error("[{family}] too many retries, the maximum of {max_retries} was exceeded")]
    TooManyRetries { family: Arc<str>, max_retries: usize },
    #[error("[{family}] timed out while waiting for a retry wakeup")]
    RetryTimeout { family: Arc<str> },
    #[error("[{family}] retry is not possible, no tracked reads to wait on")]
    NoRetryPossible { family: Arc<str> },
    #[error("[{family}] blocking retry is not allowed")]
    RetryNotAllowed { family: Arc<str> },
    #[error("[{family}] transaction is abort-only")]
    AbortOnly { family: Arc<str> },
    #[error("[{family}] blocking wait was interrupted")]
    Interrupted { family: Arc<str> },
    /// An atomic operation could not get past a lock held by a transaction.
    #[error("{operation} gave up on reference {reference}: it stayed locked")]
    LockedReference {
        operation: &'static str,
        reference: u64,
    },
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error(transparent)]
    Panic(#[from] PanicError),

    /// Application level abort raised from inside a transactional closure.
    #[error("transaction aborted: {0}")]
    User(String),
}

impl StmError {
    /// True for the control-flow signals that an executor answers with another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StmError::Retry
                | StmError::ReadWriteConflict
                | StmError::UncommittedReadConflict
                | StmError::SpeculativeConfigurationFailure(_)
        )
    }

    /// True for conflicts that are answered with a backoff before the next attempt.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StmError::ReadWriteConflict | StmError::UncommittedReadConflict
        )
    }
}

/// Shorthand for `Result<T, StmError>`.
pub type StmResult<T> = Result<T, StmError>;

/// Signal a blocking retry from inside a transaction closure.
///
/// ```ignore
/// let item = queue_len.get(tx)?;
/// if item == 0 {
///     return retry();
/// }
/// ```
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::Retry)
}
