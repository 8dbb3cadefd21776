use serde::{Deserialize, Serialize};

use crate::domain::JobStatus;

/// Number of records per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchCounts {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl DispatchCounts {
    pub(crate) fn add(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Succeeded => self.succeeded += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.running + self.succeeded + self.failed
    }
}
