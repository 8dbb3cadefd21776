//! Step dispatcher: idempotent execution tracking keyed by job key.

mod counts;
mod policy;
mod reaper;
mod slot;
mod state;

pub use counts::DispatchCounts;
pub use policy::{DispatchConfig, DuplicatePolicy, SubmitOptions};
pub use reaper::ReaperLoop;
pub use state::{Claim, Submission, WorkerState};
