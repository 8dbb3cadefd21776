//! WorkerState: the idempotent step dispatcher.
//!
//! Locking:
//! - `table` (std mutex) only guards key -> slot membership. Get-or-insert of
//!   a slot is the linearization point for concurrent submits of one key.
//!   It is never held across an await.
//! - Each slot has its own async mutex. Every read or write of a record
//!   happens under it.
//! - Runners execute with no lock held, so a slow step never blocks other keys.
//!
//! Lease reclaim only applies to records nobody is executing: claims that were
//! never executed, and executions whose future was dropped or panicked.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::counts::DispatchCounts;
use super::policy::{DispatchConfig, DuplicatePolicy, SubmitOptions};
use super::slot::{KeySlot, SlotReporter};
use crate::domain::{
    DispatchError, Envelope, JobKey, JobRecord, LEASE_EXPIRED, STEP_TIMEOUT, StepFailure,
    WorkerId,
};
use crate::ports::{Clock, IdGenerator, StepContext, StepRunner, SystemClock, UlidGenerator};

/// Exclusive right to execute one freshly queued record.
pub struct Claim {
    key: JobKey,
    slot: Arc<KeySlot>,
    generation: u64,
}

impl Claim {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    /// Current state of the claimed record.
    pub async fn snapshot(&self) -> JobRecord {
        self.slot.state.lock().await.record.clone()
    }
}

impl fmt::Debug for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Claim")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Result of `submit`.
#[derive(Debug)]
pub enum Submission {
    /// New record queued; the caller must `execute` it.
    Claimed(Claim),

    /// A terminal result already exists for this key.
    Cached(JobRecord),
}

pub struct WorkerState {
    table: Mutex<HashMap<JobKey, Arc<KeySlot>>>,
    config: DispatchConfig,
    clock: Arc<dyn Clock>,
    worker_id: WorkerId,
}

impl WorkerState {
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: DispatchConfig, clock: Arc<dyn Clock>) -> Self {
        let worker_id = UlidGenerator::new(Arc::clone(&clock)).generate_worker_id();
        Self {
            table: Mutex::new(HashMap::new()),
            config,
            clock,
            worker_id,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.lock_table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_table().is_empty()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<JobKey, Arc<KeySlot>>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &JobKey) -> Option<Arc<KeySlot>> {
        self.lock_table().get(key).cloned()
    }

    /// Get-or-insert under the table lock. `true` if a new slot was created.
    fn slot_for(&self, key: &JobKey, envelope: &Envelope) -> (Arc<KeySlot>, bool) {
        let mut table = self.lock_table();
        if let Some(slot) = table.get(key) {
            return (Arc::clone(slot), false);
        }
        let slot = Arc::new(KeySlot::new(JobRecord::new(
            envelope.clone(),
            self.clock.now(),
        )));
        table.insert(key.clone(), Arc::clone(&slot));
        (slot, true)
    }

    fn lease_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.lease_timeout)
            .ok()
            .and_then(|lease| now.checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn reclaim(key: &JobKey, record: &mut JobRecord, now: DateTime<Utc>) {
        let since = record
            .last_heartbeat
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        warn!(
            %key,
            job_id = record.envelope.job_id(),
            status = %record.status,
            last_heartbeat = %since,
            "lease expired; reclaiming record as failed"
        );
        record.mark_failed(
            StepFailure::new(LEASE_EXPIRED, format!("no heartbeat since {since}")),
            now,
        );
    }

    pub async fn submit(&self, envelope: &Envelope) -> Result<Submission, DispatchError> {
        self.submit_with(envelope, SubmitOptions::default()).await
    }

    /// Deduplicate a step request by its job key.
    ///
    /// - no record: a queued record is inserted and claimed by the caller
    /// - terminal record: served as a cached response (`idempotent=true`),
    ///   unless `bypass_cache` is set or the record was failed by lease reclaim
    /// - queued/running record: resolved by `DuplicatePolicy`
    pub async fn submit_with(
        &self,
        envelope: &Envelope,
        options: SubmitOptions,
    ) -> Result<Submission, DispatchError> {
        let key = envelope.job_key();
        let (slot, inserted) = self.slot_for(&key, envelope);
        if inserted {
            debug!(%key, job_id = envelope.job_id(), "queued new record");
            return Ok(Submission::Claimed(Claim {
                key,
                slot,
                generation: 0,
            }));
        }

        let deadline = match self.config.duplicate_policy {
            DuplicatePolicy::Reject => None,
            DuplicatePolicy::Wait { timeout } => Some(tokio::time::Instant::now() + timeout),
        };

        loop {
            // Register for the wake-up before inspecting the record so a
            // completion between the check and the wait is not missed.
            let notified = slot.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let in_flight_job_id = {
                let mut state = slot.state.lock().await;
                let now = self.clock.now();

                if state.reclaimable(self.lease_cutoff(now)) {
                    Self::reclaim(&key, &mut state.record, now);
                    slot.settled.notify_waiters();
                }

                if state.record.is_terminal() {
                    if options.bypass_cache || state.record.was_reclaimed() {
                        debug!(
                            %key,
                            previous_job_id = state.record.envelope.job_id(),
                            job_id = envelope.job_id(),
                            "replacing terminal record with a fresh execution"
                        );
                        state.record = JobRecord::new(envelope.clone(), now);
                        state.generation += 1;
                        let generation = state.generation;
                        drop(state);
                        return Ok(Submission::Claimed(Claim {
                            key,
                            slot: Arc::clone(&slot),
                            generation,
                        }));
                    }
                    debug!(
                        %key,
                        cached_job_id = state.record.envelope.job_id(),
                        "serving cached result"
                    );
                    return Ok(Submission::Cached(state.record.cached_for(envelope)));
                }

                state.record.envelope.job_id().to_string()
            };

            let Some(deadline) = deadline else {
                return Err(DispatchError::DuplicateInFlight {
                    key,
                    job_id: in_flight_job_id,
                });
            };
            if tokio::time::timeout_at(deadline, notified.as_mut())
                .await
                .is_err()
            {
                return Err(DispatchError::DuplicateInFlight {
                    key,
                    job_id: in_flight_job_id,
                });
            }
        }
    }

    /// Run a claimed record: queued -> running -> succeeded | failed.
    ///
    /// The runner is invoked without holding any lock. If the record was
    /// reclaimed while the runner was still working, the late result is
    /// dropped and the reclaimed record is returned unchanged.
    pub async fn execute(
        &self,
        claim: Claim,
        payload: &serde_json::Value,
        runner: &dyn StepRunner,
    ) -> Result<JobRecord, DispatchError> {
        let Claim {
            key,
            slot,
            generation,
        } = claim;

        // Keeps the record out of lease reclaim for as long as this call is
        // alive; a dropped or panicked call releases it.
        let running = Arc::new(());
        let envelope = {
            let mut state = slot.state.lock().await;
            let now = self.clock.now();
            if state.generation != generation || !state.record.start(self.worker_id, now) {
                return Err(DispatchError::InvalidTransition {
                    key,
                    status: state.record.status,
                });
            }
            info!(
                %key,
                run_id = state.record.envelope.run_id(),
                job_id = state.record.envelope.job_id(),
                worker_id = %self.worker_id,
                "step started"
            );
            state.runner = Arc::downgrade(&running);
            state.record.envelope.clone()
        };

        let reporter = SlotReporter {
            slot: Arc::clone(&slot),
            generation,
            clock: Arc::clone(&self.clock),
        };
        let ctx = StepContext::new(&envelope, payload, &reporter);
        let result = match self.config.step_timeout {
            Some(limit) => tokio::time::timeout(limit, runner.run(&ctx))
                .await
                .unwrap_or_else(|_| {
                    Err(StepFailure::new(
                        STEP_TIMEOUT,
                        format!("step exceeded {:.3}s", limit.as_secs_f64()),
                    ))
                }),
            None => runner.run(&ctx).await,
        };

        let record = {
            let mut state = slot.state.lock().await;
            if state.generation != generation || state.record.is_terminal() {
                warn!(
                    %key,
                    job_id = envelope.job_id(),
                    status = %state.record.status,
                    "record settled while the step was running; discarding late result"
                );
                return Ok(state.record.clone());
            }
            let now = self.clock.now();
            match result {
                Ok(output) => {
                    state.record.mark_succeeded(output, now);
                    info!(%key, job_id = envelope.job_id(), exit_code = ?state.record.exit_code, "step succeeded");
                }
                Err(failure) => {
                    warn!(
                        %key,
                        job_id = envelope.job_id(),
                        error_code = %failure.code,
                        error = %failure.message,
                        "step failed"
                    );
                    state.record.mark_failed(failure, now);
                }
            }
            state.record.clone()
        };
        drop(running);

        slot.settled.notify_waiters();
        Ok(record)
    }

    pub async fn dispatch(
        &self,
        envelope: &Envelope,
        payload: &serde_json::Value,
        runner: &dyn StepRunner,
    ) -> Result<JobRecord, DispatchError> {
        self.dispatch_with(envelope, payload, runner, SubmitOptions::default())
            .await
    }

    /// `submit_with` followed by `execute` when the submission was claimed.
    pub async fn dispatch_with(
        &self,
        envelope: &Envelope,
        payload: &serde_json::Value,
        runner: &dyn StepRunner,
        options: SubmitOptions,
    ) -> Result<JobRecord, DispatchError> {
        match self.submit_with(envelope, options).await? {
            Submission::Cached(record) => Ok(record),
            Submission::Claimed(claim) => self.execute(claim, payload, runner).await,
        }
    }

    /// Read-only status query.
    ///
    /// A terminal record asked about under a different job_id is reported as
    /// the cached response that job_id would have received.
    pub async fn status(&self, envelope: &Envelope) -> Option<JobRecord> {
        let slot = self.lookup(&envelope.job_key())?;
        let state = slot.state.lock().await;
        let record = &state.record;
        if record.is_terminal() && record.envelope.job_id() != envelope.job_id() {
            Some(record.cached_for(envelope))
        } else {
            Some(record.clone())
        }
    }

    /// Fail every non-terminal record whose lease has expired.
    pub async fn reap_expired(&self) -> Vec<JobKey> {
        let slots: Vec<(JobKey, Arc<KeySlot>)> = self
            .lock_table()
            .iter()
            .map(|(key, slot)| (key.clone(), Arc::clone(slot)))
            .collect();

        let now = self.clock.now();
        let cutoff = self.lease_cutoff(now);
        let mut reaped = Vec::new();
        for (key, slot) in slots {
            let mut state = slot.state.lock().await;
            if !state.reclaimable(cutoff) {
                continue;
            }
            Self::reclaim(&key, &mut state.record, now);
            drop(state);
            slot.settled.notify_waiters();
            reaped.push(key);
        }
        reaped
    }

    pub async fn counts_by_status(&self) -> DispatchCounts {
        let slots: Vec<Arc<KeySlot>> = self.lock_table().values().cloned().collect();
        let mut counts = DispatchCounts::default();
        for slot in slots {
            counts.add(slot.state.lock().await.record.status);
        }
        counts
    }
}
