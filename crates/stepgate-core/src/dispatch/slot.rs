//! One entry of the per-key lock table.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};

use crate::domain::JobRecord;
use crate::ports::{Clock, ProgressReporter};

pub(crate) struct SlotState {
    pub record: JobRecord,

    /// Bumped whenever the record is replaced by a fresh execution, so a
    /// stale claim can never touch its successor.
    pub generation: u64,

    /// Held (upgradable) while an `execute` call in this process is awaiting
    /// the runner. Dropped with that call, including on cancellation or panic.
    pub runner: Weak<()>,
}

impl SlotState {
    /// Past its lease with no live local execution behind it.
    pub fn reclaimable(&self, cutoff: DateTime<Utc>) -> bool {
        self.runner.strong_count() == 0 && self.record.lease_expired(cutoff)
    }
}

/// Exclusive lock over one key's record plus a wake-up for waiters.
pub(crate) struct KeySlot {
    pub state: Mutex<SlotState>,
    pub settled: Notify,
}

impl KeySlot {
    pub fn new(record: JobRecord) -> Self {
        Self {
            state: Mutex::new(SlotState {
                record,
                generation: 0,
                runner: Weak::new(),
            }),
            settled: Notify::new(),
        }
    }
}

/// Progress handle given to a runner. Only touches its own generation.
pub(crate) struct SlotReporter {
    pub slot: Arc<KeySlot>,
    pub generation: u64,
    pub clock: Arc<dyn Clock>,
}

#[async_trait]
impl ProgressReporter for SlotReporter {
    async fn report_progress(&self, progress: Option<f64>, message: Option<String>) {
        let mut state = self.slot.state.lock().await;
        if state.generation == self.generation {
            state
                .record
                .report_progress(progress, message, self.clock.now());
        }
    }
}
