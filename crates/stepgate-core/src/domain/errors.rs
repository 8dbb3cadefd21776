use thiserror::Error;

use super::envelope::JobKey;
use super::record::JobStatus;

/// Dispatcher errors.
///
/// Step failures are not errors: they are recorded in the job record.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Another request with the same key is queued or running. Retry later.
    #[error("duplicate in flight: key={key} job_id={job_id}")]
    DuplicateInFlight { key: JobKey, job_id: String },

    #[error("invalid transition for key={key}: record is {status}")]
    InvalidTransition { key: JobKey, status: JobStatus },
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::DuplicateInFlight { .. })
    }
}
