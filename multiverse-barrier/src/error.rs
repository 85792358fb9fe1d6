use crate::BarrierStatus;
use multiverse_stm::StmError;
use thiserror::Error;

/// Failures of commit barrier operations.
#[derive(Debug, Error)]
pub enum BarrierError {
    /// The barrier already committed or aborted and takes no more changes.
    #[error("commit barrier is already open, it was {status}")]
    BarrierOpen { status: BarrierStatus },
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    /// The barrier was aborted while the caller was waiting on it.
    #[error("commit barrier was aborted")]
    Aborted,
    #[error("timed out waiting for the commit barrier")]
    Timeout,
    /// Preparing or committing the caller's transaction failed.
    #[error(transparent)]
    Stm(#[from] StmError),
}

impl BarrierError {
    pub(crate) fn closed_as(status: BarrierStatus) -> Self {
        match status {
            BarrierStatus::Aborted => BarrierError::Aborted,
            status => BarrierError::BarrierOpen { status },
        }
    }
}
