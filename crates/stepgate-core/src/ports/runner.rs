//! StepRunner port: the code that actually performs a pipeline step.
//!
//! The dispatcher treats the payload as opaque and never interprets it.

use async_trait::async_trait;

use crate::domain::{Envelope, StepFailure, StepOutput};

/// Progress/heartbeat channel back into the dispatcher.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    /// `progress` is clamped to 0.0..=1.0; `None` keeps the current value.
    /// Every call refreshes the lease.
    async fn report_progress(&self, progress: Option<f64>, message: Option<String>);
}

/// What a runner gets to see of the request it serves.
pub struct StepContext<'a> {
    pub envelope: &'a Envelope,
    pub payload: &'a serde_json::Value,
    reporter: &'a dyn ProgressReporter,
}

impl<'a> StepContext<'a> {
    pub fn new(
        envelope: &'a Envelope,
        payload: &'a serde_json::Value,
        reporter: &'a dyn ProgressReporter,
    ) -> Self {
        Self {
            envelope,
            payload,
            reporter,
        }
    }

    pub async fn report_progress(&self, progress: f64, message: impl Into<String>) {
        self.reporter
            .report_progress(Some(progress), Some(message.into()))
            .await;
    }

    /// Keep the lease alive without touching progress or message.
    pub async fn heartbeat(&self) {
        self.reporter.report_progress(None, None).await;
    }
}

#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepOutput, StepFailure>;
}
