//! Dispatcher configuration.

use std::time::Duration;

/// What `submit` does when the same key is already queued or running.
///
/// Neither variant ever executes the step a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Fail fast with `DispatchError::DuplicateInFlight`; the caller retries.
    Reject,

    /// Block until the in-flight execution settles and serve its result as a
    /// cached response. Gives up with `DuplicateInFlight` after `timeout`.
    Wait { timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub duplicate_policy: DuplicatePolicy,

    /// A non-terminal record without a heartbeat for this long is reclaimed
    /// and recorded as failed, unless an `execute` call in this process is
    /// still awaiting its runner. Bound live runners with `step_timeout`.
    pub lease_timeout: Duration,

    /// Optional hard limit on a single runner invocation.
    pub step_timeout: Option<Duration>,

    /// How often the reaper loop scans for expired leases.
    pub reap_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::Reject,
            lease_timeout: Duration::from_secs(15 * 60),
            step_timeout: None,
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl DispatchConfig {
    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = Some(step_timeout);
        self
    }

    pub fn with_reap_interval(mut self, reap_interval: Duration) -> Self {
        self.reap_interval = reap_interval;
        self
    }
}

/// Per-call options for `WorkerState::submit_with`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitOptions {
    /// Re-execute even if a terminal result is cached under the key.
    pub bypass_cache: bool,
}

impl SubmitOptions {
    pub fn bypass_cache() -> Self {
        Self { bypass_cache: true }
    }
}
