//! Domain model (envelope, job key, record, wire shape, ids).

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod record;
pub mod wire;

pub use envelope::{Envelope, JobKey, job_key};
pub use errors::DispatchError;
pub use ids::{Id, IdMarker, WorkerId};
pub use record::{
    ArtifactRef, JobRecord, JobStatus, LEASE_EXPIRED, STEP_TIMEOUT, StepFailure, StepOutput,
};
pub use wire::{WIRE_KEYS, serialize_record};
