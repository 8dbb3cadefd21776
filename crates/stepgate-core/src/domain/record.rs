//! Job record: lifecycle of one step execution, keyed by its job key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::Envelope;
use super::ids::WorkerId;

/// Status of a step execution.
///
/// State transitions:
/// - Queued -> Running -> Succeeded
/// - Queued -> Running -> Failed (runner error, timeout, or lease reclaim)
///
/// Terminal records are never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A file produced by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
}

impl ArtifactRef {
    pub fn new(kind: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            path: path.into(),
        }
    }
}

/// Successful runner result.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub exit_code: i32,
    pub message: Option<String>,
    pub metrics: serde_json::Map<String, serde_json::Value>,
    pub artifacts: Vec<ArtifactRef>,
    pub log_path: Option<String>,
    pub receipt_path: Option<String>,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_artifact(mut self, artifact: ArtifactRef) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn with_receipt_path(mut self, path: impl Into<String>) -> Self {
        self.receipt_path = Some(path.into());
        self
    }
}

/// Failed runner result. Recorded as data, never raised past the dispatcher.
#[derive(Debug, Clone)]
pub struct StepFailure {
    pub code: String,
    pub message: String,
    pub exit_code: Option<i32>,
    pub metrics: serde_json::Map<String, serde_json::Value>,
    pub log_path: Option<String>,
}

impl StepFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            exit_code: None,
            metrics: serde_json::Map::new(),
            log_path: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn with_log_path(mut self, path: impl Into<String>) -> Self {
        self.log_path = Some(path.into());
        self
    }
}

/// Error code recorded when a record with an expired lease is reclaimed.
pub const LEASE_EXPIRED: &str = "LEASE_EXPIRED";

/// Error code recorded when a runner exceeds the configured step timeout.
pub const STEP_TIMEOUT: &str = "STEP_TIMEOUT";

/// Lifecycle record for one step execution.
///
/// - Owned by the dispatcher; the only writers are the submit/execute/reap paths.
/// - Owns the envelope of the request that created it.
/// - All transitions go through the methods below, each of which is a no-op
///   on a terminal record.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
    pub envelope: Envelope,
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,

    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub exit_code: Option<i32>,
    pub metrics: serde_json::Map<String, serde_json::Value>,
    pub artifacts: Vec<ArtifactRef>,
    pub error_code: String,
    pub error_message: String,

    /// True when this response was served from a previous execution.
    pub idempotent: bool,
    /// job_id of the execution that produced a cached response.
    pub cached_job_id: String,

    pub worker_id: Option<WorkerId>,
    pub log_path: String,
    pub receipt_path: String,

    /// Lease heartbeat; set on creation, refreshed on start and on every
    /// progress report.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(envelope: Envelope, now: DateTime<Utc>) -> Self {
        Self {
            envelope,
            status: JobStatus::Queued,
            progress: 0.0,
            message: String::new(),
            created_at: Some(now),
            started_at: None,
            finished_at: None,
            exit_code: None,
            metrics: serde_json::Map::new(),
            artifacts: Vec::new(),
            error_code: String::new(),
            error_message: String::new(),
            idempotent: false,
            cached_job_id: String::new(),
            worker_id: None,
            log_path: String::new(),
            receipt_path: String::new(),
            last_heartbeat: Some(now),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued -> Running. Returns false if the record was not queued.
    pub fn start(&mut self, worker_id: WorkerId, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Queued {
            return false;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        self.worker_id = Some(worker_id);
        true
    }

    /// Progress report from a running step; also counts as a heartbeat.
    /// `None` (or NaN) leaves the current progress as it is.
    pub fn report_progress(
        &mut self,
        progress: Option<f64>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        if self.status != JobStatus::Running {
            return;
        }
        if let Some(progress) = progress.filter(|p| !p.is_nan()) {
            self.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(message) = message {
            self.message = message;
        }
        self.last_heartbeat = Some(now);
    }

    pub fn mark_succeeded(&mut self, output: StepOutput, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Succeeded;
        self.progress = 1.0;
        self.finished_at = Some(now);
        self.exit_code = Some(output.exit_code);
        self.metrics = output.metrics;
        self.artifacts = output.artifacts;
        if let Some(message) = output.message {
            self.message = message;
        }
        if let Some(path) = output.log_path {
            self.log_path = path;
        }
        if let Some(path) = output.receipt_path {
            self.receipt_path = path;
        }
    }

    pub fn mark_failed(&mut self, failure: StepFailure, now: DateTime<Utc>) {
        if self.is_terminal() {
            return;
        }
        self.status = JobStatus::Failed;
        self.finished_at = Some(now);
        self.exit_code = failure.exit_code;
        self.metrics = failure.metrics;
        self.message = failure.message.clone();
        self.error_code = failure.code;
        self.error_message = failure.message;
        if let Some(path) = failure.log_path {
            self.log_path = path;
        }
    }

    /// Non-terminal record whose heartbeat is at or before `cutoff`.
    ///
    /// Covers both a crashed runner (`running`) and a claim that was never
    /// executed (`queued`).
    pub fn lease_expired(&self, cutoff: DateTime<Utc>) -> bool {
        !self.is_terminal() && self.last_heartbeat.is_none_or(|beat| beat <= cutoff)
    }

    /// Failed by reclaim rather than by the step itself.
    pub fn was_reclaimed(&self) -> bool {
        self.status == JobStatus::Failed && self.error_code == LEASE_EXPIRED
    }

    /// Response for a retried request served from this terminal record.
    ///
    /// Identity fields come from the retry's envelope; everything else is
    /// copied from the record that actually ran.
    pub fn cached_for(&self, envelope: &Envelope) -> JobRecord {
        let mut view = self.clone();
        view.envelope = envelope.clone();
        view.idempotent = true;
        view.cached_job_id = self.envelope.job_id().to_string();
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record() -> JobRecord {
        JobRecord::new(Envelope::new("r1", "j1", "render", "h1", "t", "tok"), now())
    }

    #[test]
    fn new_record_is_queued() {
        let rec = record();
        assert_eq!(rec.status, JobStatus::Queued);
        assert_eq!(rec.created_at, Some(now()));
        assert!(rec.started_at.is_none());
        assert!(!rec.idempotent);
    }

    #[test]
    fn start_only_from_queued() {
        let mut rec = record();
        let worker = WorkerId::from_ulid(Ulid::new());
        assert!(rec.start(worker, now()));
        assert_eq!(rec.status, JobStatus::Running);
        assert_eq!(rec.worker_id, Some(worker));
        assert!(!rec.start(worker, now()));
    }

    #[test]
    fn terminal_record_is_frozen() {
        let mut rec = record();
        rec.start(WorkerId::from_ulid(Ulid::new()), now());
        rec.mark_succeeded(StepOutput::new().with_metric("frames", 10.into()), now());
        let frozen = rec.clone();

        rec.mark_failed(StepFailure::new("E", "late"), now());
        rec.report_progress(Some(0.1), Some("late".to_string()), now());
        rec.mark_succeeded(StepOutput::new(), now());

        assert_eq!(rec, frozen);
        assert_eq!(rec.metrics["frames"], 10);
    }

    #[test]
    fn progress_is_clamped() {
        let mut rec = record();
        rec.start(WorkerId::from_ulid(Ulid::new()), now());
        rec.report_progress(Some(1.7), Some("almost".to_string()), now());
        assert_eq!(rec.progress, 1.0);
        rec.report_progress(Some(-3.0), None, now());
        assert_eq!(rec.progress, 0.0);
        assert_eq!(rec.message, "almost");
    }

    #[test]
    fn heartbeat_keeps_progress_and_message() {
        let mut rec = record();
        rec.start(WorkerId::from_ulid(Ulid::new()), now());
        rec.report_progress(Some(0.4), Some("encoding".to_string()), now());

        let later = now() + chrono::Duration::minutes(3);
        rec.report_progress(None, None, later);
        assert_eq!(rec.progress, 0.4);
        assert_eq!(rec.message, "encoding");
        assert_eq!(rec.last_heartbeat, Some(later));
    }

    #[test]
    fn failure_is_captured_as_data() {
        let mut rec = record();
        rec.start(WorkerId::from_ulid(Ulid::new()), now());
        rec.mark_failed(StepFailure::new("RENDER_CRASH", "ffmpeg exited").with_exit_code(3), now());
        assert_eq!(rec.status, JobStatus::Failed);
        assert_eq!(rec.exit_code, Some(3));
        assert_eq!(rec.error_code, "RENDER_CRASH");
        assert_eq!(rec.error_message, "ffmpeg exited");
        assert!(!rec.was_reclaimed());
    }

    #[test]
    fn lease_expiry_uses_last_heartbeat() {
        let mut rec = record();
        let later = now() + chrono::Duration::minutes(10);
        assert!(rec.lease_expired(now()));
        assert!(!rec.lease_expired(now() - chrono::Duration::seconds(1)));

        rec.start(WorkerId::from_ulid(Ulid::new()), now());
        rec.report_progress(Some(0.5), None, later);
        assert!(!rec.lease_expired(later - chrono::Duration::seconds(1)));

        rec.mark_failed(StepFailure::new(LEASE_EXPIRED, "reclaimed"), later);
        assert!(!rec.lease_expired(later));
        assert!(rec.was_reclaimed());
    }

    #[test]
    fn cached_view_keeps_original_job_id() {
        let mut rec = record();
        rec.start(WorkerId::from_ulid(Ulid::new()), now());
        rec.mark_succeeded(StepOutput::new(), now());

        let retry = Envelope::new("r2", "j2", "render", "h1", "t2", "tok");
        let view = rec.cached_for(&retry);
        assert!(view.idempotent);
        assert_eq!(view.cached_job_id, "j1");
        assert_eq!(view.envelope.job_id(), "j2");
        assert_eq!(view.status, JobStatus::Succeeded);
    }
}
