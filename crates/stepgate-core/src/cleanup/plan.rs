//! Purge target selection and best-effort execution.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::layout::RunLayout;
use super::receipt::UploadReceipt;

/// Final video kept because the receipt status does not qualify.
pub const RETAIN_RECEIPT_NOT_UPLOADED: &str = "RECEIPT_NOT_UPLOADED";
/// Final video kept because the upload is younger than the safety window.
pub const RETAIN_MIN_UPLOAD_AGE_BUFFER: &str = "MIN_UPLOAD_AGE_BUFFER";
/// Final video kept because the receipt's upload time cannot be read.
pub const RETAIN_UPLOAD_TIME_UNPARSEABLE: &str = "UPLOAD_TIME_UNPARSEABLE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    File,
    Dir,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeTarget {
    pub path: PathBuf,
    pub kind: TargetKind,
}

impl PurgeTarget {
    fn file(path: PathBuf) -> Self {
        Self {
            path,
            kind: TargetKind::File,
        }
    }

    fn dir(path: PathBuf) -> Self {
        Self {
            path,
            kind: TargetKind::Dir,
        }
    }

    fn of(path: PathBuf) -> Self {
        if path.is_dir() {
            Self::dir(path)
        } else {
            Self::file(path)
        }
    }
}

/// Inputs to target selection that do not come from the run directory.
#[derive(Debug, Clone, Copy)]
pub struct PlanInputs<'a> {
    pub keep_main_image: bool,
    pub delete_final_video: bool,
    pub force: bool,
    pub min_upload_age: chrono::Duration,
    pub receipt: Option<&'a UploadReceipt>,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgePlan {
    pub targets: Vec<PurgeTarget>,
    pub final_video_retained_reason: Option<String>,
}

fn sorted_entries(dir: &Path) -> Vec<PathBuf> {
    let mut entries: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(Result::ok).map(|e| e.path()).collect(),
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "cannot list directory; skipping");
            Vec::new()
        }
    };
    entries.sort();
    entries
}

fn starts_with_prefix(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with(prefix))
        .unwrap_or(false)
}

/// Decide whether the final video may go. `Err` carries the retain reason.
fn final_video_decision(inputs: &PlanInputs<'_>) -> Result<(), &'static str> {
    let Some(receipt) = inputs.receipt.filter(|r| r.status_accepted()) else {
        return Err(RETAIN_RECEIPT_NOT_UPLOADED);
    };
    if inputs.force {
        return Ok(());
    }
    let Some(uploaded_at) = receipt.uploaded_at() else {
        return Err(RETAIN_UPLOAD_TIME_UNPARSEABLE);
    };
    if inputs.now - uploaded_at >= inputs.min_upload_age {
        Ok(())
    } else {
        Err(RETAIN_MIN_UPLOAD_AGE_BUFFER)
    }
}

/// Select what to delete. Only existing paths are returned.
pub fn select_targets(run_dir: &Path, layout: &RunLayout, inputs: &PlanInputs<'_>) -> PurgePlan {
    let mut plan = PurgePlan::default();

    for name in &layout.heavy_files {
        let path = run_dir.join(name);
        if path.is_file() {
            plan.targets.push(PurgeTarget::file(path));
        }
    }

    let products = layout.products_path(run_dir);
    if products.is_dir() {
        for product in sorted_entries(&products).into_iter().filter(|p| p.is_dir()) {
            let images = product.join(&layout.source_images_dir);
            if images.is_dir() {
                if inputs.keep_main_image {
                    plan.targets.extend(
                        sorted_entries(&images)
                            .into_iter()
                            .filter(|p| !starts_with_prefix(p, &layout.main_image_prefix))
                            .map(PurgeTarget::of),
                    );
                    // hashes describe the full image set and are stale once it shrinks
                    let hashes = product.join(&layout.image_hashes_file);
                    if hashes.is_file() {
                        plan.targets.push(PurgeTarget::file(hashes));
                    }
                } else {
                    plan.targets.push(PurgeTarget::dir(images));
                }
            }

            let broll = product.join(&layout.broll_dir);
            if broll.is_dir() {
                plan.targets.push(PurgeTarget::dir(broll));
            }
        }
    }

    let final_video = layout.final_video_path(run_dir);
    if inputs.delete_final_video && final_video.is_file() {
        match final_video_decision(inputs) {
            Ok(()) => plan.targets.push(PurgeTarget::file(final_video)),
            Err(reason) => {
                info!(reason, "final video retained");
                plan.final_video_retained_reason = Some(reason.to_string());
            }
        }
    }

    plan
}

/// Size of a file, or of a directory tree. Unreadable entries count as 0.
/// Symlinks are not followed.
pub fn path_size(path: &Path) -> u64 {
    let Ok(meta) = fs::symlink_metadata(path) else {
        return 0;
    };
    if meta.is_dir() {
        fs::read_dir(path)
            .map(|rd| {
                rd.filter_map(Result::ok)
                    .map(|entry| path_size(&entry.path()))
                    .sum()
            })
            .unwrap_or(0)
    } else {
        meta.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeResult {
    pub bytes_freed_est: u64,
    pub deleted: usize,
}

/// Measure every target, then (only when `apply`) delete them one by one.
/// A failed deletion is logged and skipped; it never aborts the batch.
pub fn execute_plan(plan: &PurgePlan, apply: bool) -> PurgeResult {
    let bytes_freed_est = plan.targets.iter().map(|t| path_size(&t.path)).sum();
    let mut deleted = 0;

    if apply {
        for target in &plan.targets {
            let removed = match target.kind {
                TargetKind::Dir => fs::remove_dir_all(&target.path),
                TargetKind::File => fs::remove_file(&target.path),
            };
            match removed {
                Ok(()) => {
                    deleted += 1;
                    info!(path = %target.path.display(), "deleted");
                }
                Err(e) => {
                    warn!(path = %target.path.display(), error = %e, "delete failed; continuing");
                }
            }
        }
    }

    PurgeResult {
        bytes_freed_est,
        deleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn write(path: &Path, len: usize) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, vec![b'x'; len]).unwrap();
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap()
    }

    fn inputs(receipt: Option<&UploadReceipt>) -> PlanInputs<'_> {
        PlanInputs {
            keep_main_image: false,
            delete_final_video: false,
            force: false,
            min_upload_age: chrono::Duration::hours(24),
            receipt,
            now: now(),
        }
    }

    fn product_run(dir: &Path) {
        let product = dir.join("products/sku-1");
        write(&product.join("source_images/main_front.jpg"), 10);
        write(&product.join("source_images/side.jpg"), 20);
        write(&product.join("source_images/back.jpg"), 30);
        write(&product.join("image_hashes.json"), 5);
        write(&product.join("broll/clip1.mp4"), 100);
    }

    #[test]
    fn whole_image_dir_goes_without_keep_main_image() {
        let dir = tempfile::tempdir().unwrap();
        product_run(dir.path());

        let plan = select_targets(dir.path(), &RunLayout::default(), &inputs(None));
        let product = dir.path().join("products/sku-1");
        assert_eq!(
            plan.targets,
            vec![
                PurgeTarget::dir(product.join("source_images")),
                PurgeTarget::dir(product.join("broll")),
            ]
        );
        assert_eq!(execute_plan(&plan, false).bytes_freed_est, 160);
    }

    #[test]
    fn keep_main_image_spares_main_files_and_drops_hashes() {
        let dir = tempfile::tempdir().unwrap();
        product_run(dir.path());

        let mut keep = inputs(None);
        keep.keep_main_image = true;
        let plan = select_targets(dir.path(), &RunLayout::default(), &keep);
        let product = dir.path().join("products/sku-1");
        assert_eq!(
            plan.targets,
            vec![
                PurgeTarget::file(product.join("source_images/back.jpg")),
                PurgeTarget::file(product.join("source_images/side.jpg")),
                PurgeTarget::file(product.join("image_hashes.json")),
                PurgeTarget::dir(product.join("broll")),
            ]
        );

        let result = execute_plan(&plan, true);
        assert_eq!(result.deleted, 4);
        assert_eq!(result.bytes_freed_est, 155);
        assert!(product.join("source_images/main_front.jpg").is_file());
        assert!(!product.join("source_images/side.jpg").exists());
    }

    #[test]
    fn final_video_needs_request_and_receipt() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("final.mp4"), 1);

        let plan = select_targets(dir.path(), &RunLayout::default(), &inputs(None));
        assert!(plan.targets.is_empty());
        assert!(plan.final_video_retained_reason.is_none());

        let mut requested = inputs(None);
        requested.delete_final_video = true;
        requested.force = true;
        let plan = select_targets(dir.path(), &RunLayout::default(), &requested);
        assert!(plan.targets.is_empty());
        assert_eq!(
            plan.final_video_retained_reason.as_deref(),
            Some(RETAIN_RECEIPT_NOT_UPLOADED)
        );
    }

    #[test]
    fn unparseable_upload_time_retains_final_video() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("final.mp4"), 1);
        let receipt = UploadReceipt::from_value(json!({ "status": "UPLOADED", "uploaded_at_utc": "yesterday" }));

        let mut requested = inputs(Some(&receipt));
        requested.delete_final_video = true;
        let plan = select_targets(dir.path(), &RunLayout::default(), &requested);
        assert_eq!(
            plan.final_video_retained_reason.as_deref(),
            Some(RETAIN_UPLOAD_TIME_UNPARSEABLE)
        );
    }

    #[test]
    fn failed_deletion_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("voiceover.wav"), 7);
        let plan = PurgePlan {
            targets: vec![
                PurgeTarget::file(dir.path().join("vanished.wav")),
                PurgeTarget::file(dir.path().join("voiceover.wav")),
            ],
            final_video_retained_reason: None,
        };

        let result = execute_plan(&plan, true);
        assert_eq!(result.deleted, 1);
        assert_eq!(result.bytes_freed_est, 7);
        assert!(!dir.path().join("voiceover.wav").exists());
    }

    #[test]
    fn directory_size_is_recursive() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("a/b/c.bin"), 3);
        write(&dir.path().join("a/d.bin"), 4);
        assert_eq!(path_size(&dir.path().join("a")), 7);
        assert_eq!(path_size(&dir.path().join("missing")), 0);
    }
}
