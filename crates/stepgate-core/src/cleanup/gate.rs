//! Safety-gated cleanup of one run directory.
//!
//! `CleanupGate::run` walks the refusal checks in order, plans the purge,
//! measures it, deletes (only with `apply`), and appends an audit entry to
//! the run manifest. A refusal is an ordinary outcome, not an error, and
//! leaves the directory and the manifest exactly as they were.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::CleanupError;
use super::layout::RunLayout;
use super::manifest::{CleanupEntry, ManifestSession};
use super::plan::{PlanInputs, execute_plan, select_targets};
use super::receipt::UploadReceipt;
use super::verifier::ReceiptVerifier;
use crate::ports::{Clock, SystemClock};

#[derive(Debug, Clone)]
pub struct CleanupOptions {
    pub run_dir: PathBuf,
    /// Delete for real. Without it the call only measures and records.
    pub apply: bool,
    pub keep_main_image: bool,
    pub delete_final_video: bool,
    /// Refuse runs whose directory is younger than this. `0` disables.
    pub min_age_hours: f64,
    /// Minimum time since upload before the final video may go.
    pub min_upload_age_hours: f64,
    /// Skip the receipt checks and the upload age window.
    pub force: bool,
    pub layout: RunLayout,
}

impl CleanupOptions {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
            apply: false,
            keep_main_image: false,
            delete_final_video: false,
            min_age_hours: 0.0,
            min_upload_age_hours: 24.0,
            force: false,
            layout: RunLayout::default(),
        }
    }

    fn validate(&self) -> Result<(), CleanupError> {
        for (name, hours) in [
            ("min_age_hours", self.min_age_hours),
            ("min_upload_age_hours", self.min_upload_age_hours),
        ] {
            if !hours.is_finite() || hours < 0.0 {
                return Err(CleanupError::Config(format!(
                    "{name} must be a non-negative number, got {hours}"
                )));
            }
        }
        Ok(())
    }
}

fn hours(h: f64) -> chrono::Duration {
    chrono::Duration::milliseconds((h * 3_600_000.0).round() as i64)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefusalReason {
    MissingRunDir,
    MissingManifest,
    TooNew,
    CannotStatRunDir,
    MissingReceipt,
    /// Carries the receipt status as found.
    ReceiptNotUploaded(String),
    ReceiptHmacInvalid,
}

impl RefusalReason {
    /// Stable machine-readable code.
    pub fn code(&self) -> String {
        match self {
            Self::MissingRunDir => "missing_run_dir".to_string(),
            Self::MissingManifest => "missing_manifest".to_string(),
            Self::TooNew => "too_new_refuse".to_string(),
            Self::CannotStatRunDir => "cannot_stat_run_dir".to_string(),
            Self::MissingReceipt => "missing_receipt".to_string(),
            Self::ReceiptNotUploaded(status) => {
                format!("receipt_status_{}_not_uploaded", status.to_lowercase())
            }
            Self::ReceiptHmacInvalid => "receipt_hmac_invalid".to_string(),
        }
    }
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub applied: bool,
    pub targets: Vec<PathBuf>,
    pub targets_count: usize,
    pub deleted: usize,
    pub bytes_freed_est: u64,
    pub final_video_retained_reason: Option<String>,
    pub history_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Completed(CleanupStats),
    Refused(RefusalReason),
}

impl CleanupOutcome {
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Refused(_))
    }
}

pub struct CleanupGate {
    verifier: Box<dyn ReceiptVerifier>,
    clock: Arc<dyn Clock>,
}

impl CleanupGate {
    pub fn new(verifier: Box<dyn ReceiptVerifier>) -> Self {
        Self::with_clock(verifier, Arc::new(SystemClock))
    }

    pub fn with_clock(verifier: Box<dyn ReceiptVerifier>, clock: Arc<dyn Clock>) -> Self {
        Self { verifier, clock }
    }

    pub fn run(&self, opts: &CleanupOptions) -> Result<CleanupOutcome, CleanupError> {
        opts.validate()?;
        let now = self.clock.now();

        let (receipt, refusal) = self.check(opts, now)?;
        if let Some(reason) = refusal {
            warn!(run_dir = %opts.run_dir.display(), reason = %reason, "cleanup refused");
            return Ok(CleanupOutcome::Refused(reason));
        }

        // the audit entry must be writable before anything is deleted
        let manifest = ManifestSession::open(&opts.layout.manifest_path(&opts.run_dir))?;

        let plan = select_targets(
            &opts.run_dir,
            &opts.layout,
            &PlanInputs {
                keep_main_image: opts.keep_main_image,
                delete_final_video: opts.delete_final_video,
                force: opts.force,
                min_upload_age: hours(opts.min_upload_age_hours),
                receipt: receipt.as_ref(),
                now,
            },
        );
        let result = execute_plan(&plan, opts.apply);

        let entry = CleanupEntry {
            at_utc: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            applied: opts.apply,
            bytes_freed_est: result.bytes_freed_est,
            targets_count: plan.targets.len(),
            deleted_count: result.deleted,
            keep_main_image: opts.keep_main_image,
            delete_final_video: opts.delete_final_video,
            force: opts.force,
            final_video_retained_reason: plan.final_video_retained_reason.clone(),
        };
        let history_len = manifest.commit(&entry)?;

        info!(
            run_dir = %opts.run_dir.display(),
            applied = opts.apply,
            targets = entry.targets_count,
            deleted = result.deleted,
            bytes = result.bytes_freed_est,
            "cleanup finished"
        );

        Ok(CleanupOutcome::Completed(CleanupStats {
            applied: opts.apply,
            targets_count: plan.targets.len(),
            targets: plan.targets.into_iter().map(|t| t.path).collect(),
            deleted: result.deleted,
            bytes_freed_est: result.bytes_freed_est,
            final_video_retained_reason: plan.final_video_retained_reason,
            history_len,
        }))
    }

    /// Ordered refusal checks. The first failing check wins. Also returns
    /// the loaded receipt, which target selection needs.
    fn check(
        &self,
        opts: &CleanupOptions,
        now: DateTime<Utc>,
    ) -> Result<(Option<UploadReceipt>, Option<RefusalReason>), CleanupError> {
        let run_dir = &opts.run_dir;
        if !run_dir.is_dir() {
            return Ok((None, Some(RefusalReason::MissingRunDir)));
        }
        if !opts.layout.manifest_path(run_dir).is_file() {
            return Ok((None, Some(RefusalReason::MissingManifest)));
        }
        if opts.min_age_hours > 0.0 {
            let Some(modified) = modified_at(run_dir) else {
                return Ok((None, Some(RefusalReason::CannotStatRunDir)));
            };
            if now - modified <= hours(opts.min_age_hours) {
                return Ok((None, Some(RefusalReason::TooNew)));
            }
        }

        let receipt_path = opts.layout.receipt_path(run_dir);
        if opts.force {
            let receipt = match UploadReceipt::load(&receipt_path) {
                Ok(receipt) => receipt,
                Err(e) => {
                    warn!(error = %e, "unreadable receipt ignored under force");
                    None
                }
            };
            return Ok((receipt, None));
        }

        let Some(receipt) = UploadReceipt::load(&receipt_path)? else {
            return Ok((None, Some(RefusalReason::MissingReceipt)));
        };
        if !receipt.status_accepted() {
            let reason = RefusalReason::ReceiptNotUploaded(receipt.status.clone());
            return Ok((None, Some(reason)));
        }
        if !self.verifier.verify(&receipt) {
            return Ok((None, Some(RefusalReason::ReceiptHmacInvalid)));
        }
        Ok((Some(receipt), None))
    }
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from)
}
