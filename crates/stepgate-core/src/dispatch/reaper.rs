use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::state::WorkerState;

/// Background task that reclaims records whose lease expired.
/// - `request_shutdown()` stops it after the current scan
/// - `shutdown_and_join()` waits for it to exit
pub struct ReaperLoop {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    /// Spawn with the interval from the state's config.
    pub fn spawn(state: Arc<WorkerState>) -> Self {
        let interval = state.config().reap_interval;
        Self::spawn_with_interval(state, interval)
    }

    pub fn spawn_with_interval(state: Arc<WorkerState>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            reaper_loop(state, interval, &mut shutdown_rx).await;
        });
        Self { shutdown_tx, join }
    }

    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

async fn reaper_loop(
    state: Arc<WorkerState>,
    interval: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        let reaped = state.reap_expired().await;
        if reaped.is_empty() {
            debug!("reaper scan: nothing expired");
        } else {
            info!(count = reaped.len(), "reaper reclaimed expired records");
        }
    }
}
