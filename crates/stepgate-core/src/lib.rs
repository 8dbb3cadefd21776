//! stepgate-core
//!
//! Building blocks for running media pipeline steps safely.
//!
//! - **domain**: envelopes, job keys, job records and their wire shape
//! - **ports**: clock, id generation, the `StepRunner` seam
//! - **dispatch**: `WorkerState`, the idempotent per-key dispatcher, and its reaper
//! - **cleanup**: `CleanupGate`, receipt-gated deletion of run intermediates

pub mod cleanup;
pub mod dispatch;
pub mod domain;
pub mod ports;
