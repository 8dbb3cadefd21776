//! `stepgate-cleanup`: reclaim disk space from a finished run directory.
//!
//! Prints one JSON object to stdout. Logs go to stderr.
//! Exit codes: 0 done (including dry runs), 2 refused, 1 error.

mod config;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde_json::{Value, json};
use stepgate_core::cleanup::{CleanupGate, CleanupOptions, CleanupOutcome, build_verifier};
use tracing_subscriber::EnvFilter;

use crate::config::CleanupEnv;

#[derive(Parser, Debug)]
#[command(name = "stepgate-cleanup", version, about = "Receipt-gated cleanup of run intermediates")]
struct Cli {
    /// Run directory to clean.
    #[arg(long)]
    run_dir: PathBuf,

    /// Delete for real (default is a dry run).
    #[arg(long)]
    apply: bool,

    /// Keep product images whose name starts with the main-image prefix.
    #[arg(long)]
    keep_main_image: bool,

    /// Also delete the final video once the upload is old enough.
    #[arg(long)]
    delete_final_video: bool,

    /// Refuse runs younger than this many hours (0 disables).
    #[arg(long, default_value_t = 0.0)]
    min_age_hours: f64,

    /// Hours since upload before the final video may be deleted.
    #[arg(long, default_value_t = 24.0)]
    min_upload_age_hours: f64,

    /// Skip receipt checks and the upload age window.
    #[arg(long)]
    force: bool,
}

impl Cli {
    fn options(&self) -> Result<CleanupOptions> {
        for (flag, hours) in [
            ("--min-age-hours", self.min_age_hours),
            ("--min-upload-age-hours", self.min_upload_age_hours),
        ] {
            if !hours.is_finite() || hours < 0.0 {
                bail!("{flag} must be a non-negative number, got {hours}");
            }
        }
        let mut opts = CleanupOptions::new(&self.run_dir);
        opts.apply = self.apply;
        opts.keep_main_image = self.keep_main_image;
        opts.delete_final_video = self.delete_final_video;
        opts.min_age_hours = self.min_age_hours;
        opts.min_upload_age_hours = self.min_upload_age_hours;
        opts.force = self.force;
        Ok(opts)
    }
}

fn outcome_json(opts: &CleanupOptions, outcome: &CleanupOutcome) -> Value {
    let run_dir = opts.run_dir.display().to_string();
    match outcome {
        CleanupOutcome::Completed(stats) => json!({
            "ok": true,
            "run_dir": run_dir,
            "applied": stats.applied,
            "targets": stats.targets,
            "targets_count": stats.targets_count,
            "deleted_count": stats.deleted,
            "bytes_freed_est": stats.bytes_freed_est,
            "final_video_retained_reason": stats.final_video_retained_reason,
            "history_len": stats.history_len,
        }),
        CleanupOutcome::Refused(reason) => json!({
            "ok": false,
            "run_dir": run_dir,
            "refused": reason.code(),
        }),
    }
}

fn exit_code(outcome: &CleanupOutcome) -> u8 {
    match outcome {
        CleanupOutcome::Completed(_) => 0,
        CleanupOutcome::Refused(_) => 2,
    }
}

fn run(cli: &Cli) -> Result<(Value, u8)> {
    let opts = cli.options()?;
    let env = CleanupEnv::from_env().context("load STEPGATE_* configuration")?;
    let verifier = build_verifier(env.receipt_verifier, env.receipt_hmac_key.as_deref())
        .context("build receipt verifier")?;
    tracing::info!(verifier = verifier.name(), run_dir = %opts.run_dir.display(), apply = opts.apply, "starting cleanup");

    let outcome = CleanupGate::new(verifier)
        .run(&opts)
        .with_context(|| format!("cleanup of {}", opts.run_dir.display()))?;
    Ok((outcome_json(&opts, &outcome), exit_code(&outcome)))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok((body, code)) => {
            println!("{body}");
            ExitCode::from(code)
        }
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "cleanup failed");
            println!("{}", json!({ "ok": false, "error": format!("{e:#}") }));
            ExitCode::from(1)
        }
    }
}
