//! Cleanup gate for finished run directories.
//!
//! Deletes bulky intermediates of a run only after the upload receipt
//! proves the final asset left the machine, and records every non-refused
//! invocation in the run manifest.

mod gate;
mod layout;
mod manifest;
mod plan;
mod receipt;
mod verifier;

use std::path::PathBuf;

use thiserror::Error;

pub use gate::{CleanupGate, CleanupOptions, CleanupOutcome, CleanupStats, RefusalReason};
pub use layout::RunLayout;
pub use manifest::{CleanupEntry, HISTORY_LIMIT, ManifestSession, read_history, record_cleanup};
pub use plan::{
    PlanInputs, PurgePlan, PurgeResult, PurgeTarget, RETAIN_MIN_UPLOAD_AGE_BUFFER,
    RETAIN_RECEIPT_NOT_UPLOADED, RETAIN_UPLOAD_TIME_UNPARSEABLE, TargetKind, execute_plan,
    path_size, select_targets,
};
pub use receipt::{ACCEPTED_STATUSES, UploadReceipt};
pub use verifier::{
    HmacReceiptVerifier, ReceiptVerifier, StructuralReceiptVerifier, VerifierKind, build_verifier,
};

/// Unexpected cleanup failures. Safety refusals are not errors; see
/// [`CleanupOutcome::Refused`].
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {what} json at {}: {source}", .path.display())]
    Json {
        what: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed manifest {}: {reason}", .path.display())]
    MalformedManifest { path: PathBuf, reason: String },

    #[error("configuration: {0}")]
    Config(String),
}
