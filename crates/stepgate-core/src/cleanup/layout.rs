//! File layout of one run directory.

use std::path::{Path, PathBuf};

/// Names of the files and directories the cleanup gate knows about.
///
/// ```text
/// <run_dir>/
///   manifest.json
///   upload_receipt.json
///   final.mp4
///   voiceover.wav, raw_frame.png          (heavy top-level files)
///   products/<product>/
///     source_images/main_*.jpg, ...
///     image_hashes.json
///     broll/
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub manifest: String,
    pub receipt: String,
    pub final_video: String,
    pub heavy_files: Vec<String>,
    pub products_dir: String,
    pub source_images_dir: String,
    pub image_hashes_file: String,
    pub broll_dir: String,
    pub main_image_prefix: String,
}

impl Default for RunLayout {
    fn default() -> Self {
        Self {
            manifest: "manifest.json".to_string(),
            receipt: "upload_receipt.json".to_string(),
            final_video: "final.mp4".to_string(),
            heavy_files: vec!["voiceover.wav".to_string(), "raw_frame.png".to_string()],
            products_dir: "products".to_string(),
            source_images_dir: "source_images".to_string(),
            image_hashes_file: "image_hashes.json".to_string(),
            broll_dir: "broll".to_string(),
            main_image_prefix: "main".to_string(),
        }
    }
}

impl RunLayout {
    pub fn manifest_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(&self.manifest)
    }

    pub fn receipt_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(&self.receipt)
    }

    pub fn final_video_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(&self.final_video)
    }

    pub fn products_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(&self.products_dir)
    }
}
